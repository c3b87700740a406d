//! GRE tunnel derivation and row maintenance.
//!
//! A station link with a link-local address gets an L2 GRE overlay towards
//! the .1 of its /16. The VIF side derives `(enable, local, remote)` from
//! observed inet state and pushes it into its tunnel; the tunnel side owns
//! the Wifi_Inet_Config row and replaces it wholesale whenever any
//! parameter diverges (tunnel parameters are never mutated in place).

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use airmesh_store::{
    RowUpdate, Store, WifiInetConfig, WifiInetState, IF_TYPE_GRE, IP_SCHEME_NONE,
};
use airmesh_work::{Millis, RecalcGate};
use tracing::{debug, info, warn};

use crate::BackhaulError;

pub const GRE_DEADLINE_MS: Millis = 3000;
pub const GRE_TUN_BACKOFF_MS: Millis = 3000;
/// The VIF side re-derives faster; it only feeds the tunnel entity.
pub const GRE_VIF_BACKOFF_MS: Millis = 1000;

fn is_link_local(addr: Ipv4Addr) -> bool {
    let o = addr.octets();
    o[0] == 169 && o[1] == 254
}

#[derive(Debug, Default, Clone)]
struct VifReport {
    enabled: bool,
    network: bool,
    inet_addr: Option<Ipv4Addr>,
    netmask: Option<Ipv4Addr>,
}

pub struct GreVif {
    name: String,
    gate: RecalcGate,
    report: VifReport,
}

impl GreVif {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            gate: RecalcGate::new(GRE_DEADLINE_MS, GRE_VIF_BACKOFF_MS),
            report: VifReport::default(),
        }
    }

    fn derive_enable(&self) -> bool {
        let addr = match self.report.inet_addr {
            Some(a) if !a.is_unspecified() => a,
            _ => return false,
        };
        match self.report.netmask {
            Some(m) if !m.is_unspecified() => m,
            _ => return false,
        };
        if !self.report.enabled || !self.report.network {
            return false;
        }
        if !is_link_local(addr) {
            warn!(vif = %self.name, addr = %addr, "gre: address is not link-local");
            return false;
        }
        true
    }

    fn derive_local_ip(&self) -> Ipv4Addr {
        self.report.inet_addr.unwrap_or(Ipv4Addr::UNSPECIFIED)
    }

    /// The .1 of the subnet: `(addr & mask) | 1` in network byte order.
    fn derive_remote_ip(&self) -> Ipv4Addr {
        let addr = u32::from(self.report.inet_addr.unwrap_or(Ipv4Addr::UNSPECIFIED));
        let mask = u32::from(self.report.netmask.unwrap_or(Ipv4Addr::UNSPECIFIED));
        Ipv4Addr::from((addr & mask) | 1)
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
struct TunConfig {
    enable: bool,
    local_ip: Option<Ipv4Addr>,
    remote_ip: Option<Ipv4Addr>,
}

#[derive(Debug, Default, Clone)]
struct TunReport {
    vif_name: Option<String>,
    local_ip: Option<Ipv4Addr>,
    remote_ip: Option<Ipv4Addr>,
}

/// A tunnel owns its parent VIF entity outright; binding moves the VIF in
/// and dropping the tunnel drops the VIF with it.
pub struct GreTun {
    name: String,
    vif: GreVif,
    gate: RecalcGate,
    config: TunConfig,
    report: TunReport,
}

pub struct GreEngine {
    /// VIF entities not yet bound to a tunnel.
    vifs: BTreeMap<String, GreVif>,
    tuns: BTreeMap<String, GreTun>,
    /// Parent VIF name -> owning tunnel name, for event routing.
    vif_to_tun: BTreeMap<String, String>,
    mtu: u32,
}

impl GreEngine {
    pub fn new(mtu: u32) -> Self {
        Self {
            vifs: BTreeMap::new(),
            tuns: BTreeMap::new(),
            vif_to_tun: BTreeMap::new(),
            mtu,
        }
    }

    pub fn add_vif(&mut self, vif_name: &str) -> Result<(), BackhaulError> {
        if self.vifs.contains_key(vif_name) || self.vif_to_tun.contains_key(vif_name) {
            return Err(BackhaulError::Duplicate(vif_name.to_string()));
        }
        info!(vif = %vif_name, "gre: vif: allocated");
        self.vifs.insert(vif_name.to_string(), GreVif::new(vif_name));
        Ok(())
    }

    /// Bind a tunnel to an unbound VIF. Takes ownership of the VIF entity.
    pub fn bind_tun(&mut self, vif_name: &str, tun_name: &str) -> Result<(), BackhaulError> {
        if self.tuns.contains_key(tun_name) {
            return Err(BackhaulError::Duplicate(tun_name.to_string()));
        }
        if self.vif_to_tun.contains_key(vif_name) {
            return Err(BackhaulError::AlreadyBound(vif_name.to_string()));
        }
        let vif = self
            .vifs
            .remove(vif_name)
            .ok_or_else(|| BackhaulError::NotFound(vif_name.to_string()))?;
        info!(tun = %tun_name, vif = %vif_name, "gre: tun: allocated");
        self.vif_to_tun.insert(vif_name.to_string(), tun_name.to_string());
        self.tuns.insert(
            tun_name.to_string(),
            GreTun {
                name: tun_name.to_string(),
                vif,
                gate: RecalcGate::new(GRE_DEADLINE_MS, GRE_TUN_BACKOFF_MS),
                config: TunConfig::default(),
                report: TunReport::default(),
            },
        );
        Ok(())
    }

    pub fn drop_vif(&mut self, vif_name: &str) -> Result<(), BackhaulError> {
        if self.vif_to_tun.contains_key(vif_name) {
            warn!(vif = %vif_name, "gre: refusing to drop vif still bound to tunnel");
            return Err(BackhaulError::AlreadyBound(vif_name.to_string()));
        }
        if self.vifs.remove(vif_name).is_some() {
            info!(vif = %vif_name, "gre: vif: dropping");
        }
        Ok(())
    }

    /// Drop a tunnel: delete its row and release the owned VIF entity with it.
    pub fn drop_tun(&mut self, tun_name: &str, store: &mut Store) {
        if let Some(tun) = self.tuns.remove(tun_name) {
            info!(tun = %tun_name, vif = %tun.vif.name, "gre: tun: dropping");
            Self::tun_delete(&tun, store);
            self.vif_to_tun.remove(&tun.vif.name);
        }
    }

    pub fn has_tun(&self, tun_name: &str) -> bool {
        self.tuns.contains_key(tun_name)
    }

    fn vif_mut(&mut self, vif_name: &str) -> Option<&mut GreVif> {
        if let Some(tun_name) = self.vif_to_tun.get(vif_name) {
            let tun_name = tun_name.clone();
            return self.tuns.get_mut(&tun_name).map(|t| &mut t.vif);
        }
        self.vifs.get_mut(vif_name)
    }

    pub fn on_inet_state(&mut self, u: &RowUpdate<WifiInetState>, now: Millis) {
        let if_name = u.key().to_string();

        if u.changed(|r| &r.enabled) {
            let v = u.row().and_then(|r| r.enabled).unwrap_or(false);
            if let Some(vif) = self.vif_mut(&if_name) {
                if vif.report.enabled != v {
                    info!(vif = %if_name, from = vif.report.enabled, to = v, "gre: report: enabled");
                    vif.report.enabled = v;
                    vif.gate.mark(now);
                }
            }
        }
        if u.changed(|r| &r.network) {
            let v = u.row().and_then(|r| r.network).unwrap_or(false);
            if let Some(vif) = self.vif_mut(&if_name) {
                if vif.report.network != v {
                    info!(vif = %if_name, from = vif.report.network, to = v, "gre: report: network");
                    vif.report.network = v;
                    vif.gate.mark(now);
                }
            }
        }
        if u.changed(|r| &r.inet_addr) {
            let v = u.row().and_then(|r| r.inet_addr);
            if let Some(vif) = self.vif_mut(&if_name) {
                if vif.report.inet_addr != v {
                    info!(vif = %if_name, "gre: report: inet_addr");
                    vif.report.inet_addr = v;
                    vif.gate.mark(now);
                }
            }
        }
        if u.changed(|r| &r.netmask) {
            let v = u.row().and_then(|r| r.netmask);
            if let Some(vif) = self.vif_mut(&if_name) {
                if vif.report.netmask != v {
                    info!(vif = %if_name, "gre: report: netmask");
                    vif.report.netmask = v;
                    vif.gate.mark(now);
                }
            }
        }

        // Tunnel-row echo fields, keyed by the tunnel interface name.
        if u.changed(|r| &r.gre_ifname) {
            let v = u.row().and_then(|r| r.gre_ifname.clone());
            if let Some(tun) = self.tuns.get_mut(&if_name) {
                if tun.report.vif_name != v {
                    info!(
                        tun = %if_name,
                        from = tun.report.vif_name.as_deref().unwrap_or(""),
                        to = v.as_deref().unwrap_or(""),
                        "gre: report: vif_name"
                    );
                    tun.report.vif_name = v;
                    tun.gate.mark(now);
                }
            }
        }
        if u.changed(|r| &r.gre_local_inet_addr) {
            let v = u.row().and_then(|r| r.gre_local_inet_addr);
            if let Some(tun) = self.tuns.get_mut(&if_name) {
                if tun.report.local_ip != v {
                    info!(tun = %if_name, "gre: report: local_ip");
                    tun.report.local_ip = v;
                    tun.gate.mark(now);
                }
            }
        }
        if u.changed(|r| &r.gre_remote_inet_addr) {
            let v = u.row().and_then(|r| r.gre_remote_inet_addr);
            if let Some(tun) = self.tuns.get_mut(&if_name) {
                if tun.report.remote_ip != v {
                    info!(tun = %if_name, "gre: report: remote_ip");
                    tun.report.remote_ip = v;
                    tun.gate.mark(now);
                }
            }
        }
    }

    fn tun_insert(tun: &GreTun, mtu: u32, store: &mut Store) {
        info!(tun = %tun.name, "gre: inserting");
        store.upsert_inet_config(WifiInetConfig {
            if_name: tun.name.clone(),
            enabled: Some(true),
            network: Some(true),
            mtu: Some(mtu),
            ip_assign_scheme: Some(IP_SCHEME_NONE.to_string()),
            if_type: Some(IF_TYPE_GRE.to_string()),
            gre_ifname: Some(tun.vif.name.clone()),
            gre_local_inet_addr: tun.config.local_ip,
            gre_remote_inet_addr: tun.config.remote_ip,
            dhcp_renew: None,
        });
    }

    fn tun_delete(tun: &GreTun, store: &mut Store) {
        info!(tun = %tun.name, "gre: deleting");
        store.delete_inet_config(&tun.name);
    }

    fn recalc_tun(tun: &GreTun, mtu: u32, store: &mut Store) {
        let desired_vif = if tun.config.enable {
            Some(tun.vif.name.as_str())
        } else {
            None
        };
        let enabled = tun.report.vif_name.is_some();
        let changed = (tun.config.enable != enabled)
            || (tun.config.local_ip != tun.report.local_ip)
            || (tun.config.remote_ip != tun.report.remote_ip)
            || (desired_vif != tun.report.vif_name.as_deref());
        let complete = tun.config.enable
            && tun.config.local_ip.map(|a| !a.is_unspecified()).unwrap_or(false)
            && tun.config.remote_ip.map(|a| !a.is_unspecified()).unwrap_or(false);

        if changed {
            if enabled {
                Self::tun_delete(tun, store);
            }
            if complete {
                Self::tun_insert(tun, mtu, store);
            }
        }
    }

    fn recalc_vif(tun: &mut GreTun, now: Millis) {
        let enable = tun.vif.derive_enable();
        let local_ip = Some(tun.vif.derive_local_ip());
        let remote_ip = Some(tun.vif.derive_remote_ip());

        if tun.config.enable != enable {
            info!(tun = %tun.name, from = tun.config.enable, to = enable, "gre: set: enable");
            tun.config.enable = enable;
            tun.gate.mark(now);
        }
        if tun.config.local_ip != local_ip {
            info!(tun = %tun.name, "gre: set: local_ip");
            tun.config.local_ip = local_ip;
            tun.gate.mark(now);
        }
        if tun.config.remote_ip != remote_ip {
            info!(tun = %tun.name, "gre: set: remote_ip");
            tun.config.remote_ip = remote_ip;
            tun.gate.mark(now);
        }
    }

    pub fn poll(&mut self, now: Millis, store: &mut Store) {
        let names: Vec<String> = self.tuns.keys().cloned().collect();
        for name in &names {
            if let Some(tun) = self.tuns.get_mut(name) {
                if tun.vif.gate.try_fire(now) {
                    debug!(vif = %tun.vif.name, "gre: vif recalc");
                    Self::recalc_vif(tun, now);
                }
            }
        }
        for name in &names {
            if let Some(tun) = self.tuns.get_mut(name) {
                if tun.gate.try_fire(now) {
                    debug!(tun = %name, "gre: tun recalc");
                    Self::recalc_tun(tun, self.mtu, store);
                }
            }
        }
        // Unbound VIF entities still re-derive; their output has nowhere to
        // go until a tunnel binds them.
        let vif_names: Vec<String> = self.vifs.keys().cloned().collect();
        for name in vif_names {
            if let Some(vif) = self.vifs.get_mut(&name) {
                let _ = vif.gate.try_fire(now);
            }
        }
    }

    pub fn next_wakeup(&self) -> Option<Millis> {
        let tuns = self
            .tuns
            .values()
            .flat_map(|t| [t.gate.next_wakeup(), t.vif.gate.next_wakeup()]);
        let vifs = self.vifs.values().map(|v| v.gate.next_wakeup());
        tuns.chain(vifs).flatten().min()
    }
}
