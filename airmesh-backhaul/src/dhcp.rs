//! Conditional DHCP renewal for station VIFs.
//!
//! The renewal convinces the external DHCP client to re-acquire a lease
//! after a rapid WLAN re-connect: zero the reported addresses and bump the
//! renew counter, all in one transaction. Only a port-state edge raises the
//! work flag; the other observed fields merely re-arm evaluation.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use airmesh_store::{
    RowUpdate, Store, TxOp, UpdateKind, WifiInetConfig, WifiInetState, WifiMasterState,
    WifiVifState, IP_SCHEME_DHCP, PORT_STATE_ACTIVE, VIF_MODE_STA,
};
use airmesh_work::{Millis, RecalcGate};
use tracing::{debug, info, warn};

use crate::BackhaulError;

pub const DHCP_BACKOFF_MS: Millis = 3000;
pub const DHCP_DEADLINE_MS: Millis = 3000;

#[derive(Debug, Clone)]
struct VifState {
    is_active: bool,       // Wifi_Master_State
    is_4addr: bool,        // Wifi_VIF_State
    is_sta: bool,          // Wifi_VIF_State
    is_configurable: bool, // Wifi_Inet_Config
    is_enabled: bool,      // Wifi_Inet_State
    is_network: bool,      // Wifi_Inet_State
    ip_assign_scheme: Option<String>,
    ip: Ipv4Addr,
}

impl Default for VifState {
    fn default() -> Self {
        Self {
            is_active: false,
            is_4addr: false,
            is_sta: false,
            is_configurable: false,
            is_enabled: false,
            is_network: false,
            ip_assign_scheme: None,
            ip: Ipv4Addr::UNSPECIFIED,
        }
    }
}

struct DhcpVif {
    name: String,
    gate: RecalcGate,
    state: VifState,
}

pub struct DhcpEngine {
    vifs: BTreeMap<String, DhcpVif>,
}

impl DhcpEngine {
    pub fn new() -> Self {
        Self { vifs: BTreeMap::new() }
    }

    pub fn add_vif(&mut self, vif_name: &str) -> Result<(), BackhaulError> {
        if self.vifs.contains_key(vif_name) {
            return Err(BackhaulError::Duplicate(vif_name.to_string()));
        }
        info!(vif = %vif_name, "dhcp: vif: allocated");
        self.vifs.insert(
            vif_name.to_string(),
            DhcpVif {
                name: vif_name.to_string(),
                gate: RecalcGate::new(DHCP_DEADLINE_MS, DHCP_BACKOFF_MS),
                state: VifState {
                    ip: Ipv4Addr::UNSPECIFIED,
                    ..Default::default()
                },
            },
        );
        Ok(())
    }

    pub fn drop_vif(&mut self, vif_name: &str) {
        if self.vifs.remove(vif_name).is_some() {
            info!(vif = %vif_name, "dhcp: vif: dropping");
        }
    }

    pub fn has_vif(&self, vif_name: &str) -> bool {
        self.vifs.contains_key(vif_name)
    }

    fn report_bool(
        &mut self,
        vif_name: &str,
        now: Millis,
        field: &str,
        raises_work: bool,
        get: impl Fn(&mut VifState) -> &mut bool,
        v: bool,
    ) {
        if let Some(vif) = self.vifs.get_mut(vif_name) {
            let slot = get(&mut vif.state);
            if *slot == v {
                return;
            }
            info!(vif = %vif_name, field, from = *slot, to = v, "dhcp: report");
            *slot = v;
            if raises_work {
                vif.gate.mark(now);
            } else {
                vif.gate.arm(now);
            }
        }
    }

    pub fn on_master_state(&mut self, u: &RowUpdate<WifiMasterState>, now: Millis) {
        let if_name = u.key().to_string();
        if u.changed(|r| &r.port_state) {
            let v = u
                .row()
                .and_then(|r| r.port_state.as_deref())
                .map(|s| s == PORT_STATE_ACTIVE)
                .unwrap_or(false);
            // The renewal trigger: port state flipping to active.
            self.report_bool(&if_name, now, "is_active", true, |s| &mut s.is_active, v);
        }
    }

    pub fn on_vif_state(&mut self, u: &RowUpdate<WifiVifState>, now: Millis) {
        let if_name = u.key().to_string();
        if u.changed(|r| &r.wds) {
            let v = u.row().and_then(|r| r.wds).unwrap_or(false);
            self.report_bool(&if_name, now, "is_4addr", false, |s| &mut s.is_4addr, v);
        }
        if u.changed(|r| &r.mode) {
            let v = u
                .row()
                .and_then(|r| r.mode.as_deref())
                .map(|m| m == VIF_MODE_STA)
                .unwrap_or(false);
            self.report_bool(&if_name, now, "is_sta", false, |s| &mut s.is_sta, v);
        }
    }

    pub fn on_inet_config(&mut self, u: &RowUpdate<WifiInetConfig>, now: Millis) {
        let if_name = u.key().to_string();
        match u.kind {
            UpdateKind::New => {
                self.report_bool(&if_name, now, "is_configurable", false, |s| &mut s.is_configurable, true)
            }
            UpdateKind::Modify => (),
            UpdateKind::Delete => {
                self.report_bool(&if_name, now, "is_configurable", false, |s| &mut s.is_configurable, false)
            }
        }
    }

    pub fn on_inet_state(&mut self, u: &RowUpdate<WifiInetState>, now: Millis) {
        let if_name = u.key().to_string();
        if u.changed(|r| &r.enabled) {
            let v = u.row().and_then(|r| r.enabled).unwrap_or(false);
            self.report_bool(&if_name, now, "is_enabled", false, |s| &mut s.is_enabled, v);
        }
        if u.changed(|r| &r.network) {
            let v = u.row().and_then(|r| r.network).unwrap_or(false);
            self.report_bool(&if_name, now, "is_network", false, |s| &mut s.is_network, v);
        }
        if u.changed(|r| &r.ip_assign_scheme) {
            let v = u.row().and_then(|r| r.ip_assign_scheme.clone());
            if let Some(vif) = self.vifs.get_mut(&if_name) {
                if vif.state.ip_assign_scheme != v {
                    info!(
                        vif = %if_name,
                        from = vif.state.ip_assign_scheme.as_deref().unwrap_or(""),
                        to = v.as_deref().unwrap_or(""),
                        "dhcp: report: ip_assign_scheme"
                    );
                    vif.state.ip_assign_scheme = v;
                    vif.gate.arm(now);
                }
            }
        }
        if u.changed(|r| &r.inet_addr) {
            let v = u
                .row()
                .and_then(|r| r.inet_addr)
                .unwrap_or(Ipv4Addr::UNSPECIFIED);
            if let Some(vif) = self.vifs.get_mut(&if_name) {
                if vif.state.ip != v {
                    info!(vif = %if_name, from = %vif.state.ip, to = %v, "dhcp: report: ip");
                    vif.state.ip = v;
                    vif.gate.arm(now);
                }
            }
        }
    }

    fn renew(vif: &DhcpVif, store: &mut Store) {
        info!(vif = %vif.name, "dhcp: renewing");
        let ops = vec![
            TxOp::ZeroMasterInetAddr { if_name: vif.name.clone() },
            TxOp::ZeroInetStateInetAddr { if_name: vif.name.clone() },
            TxOp::BumpDhcpRenew { if_name: vif.name.clone() },
        ];
        if let Err(e) = store.transact(ops) {
            warn!(vif = %vif.name, error = %e, "dhcp: renewal transaction failed");
        }
    }

    fn recalc(vif: &DhcpVif, store: &mut Store) {
        let s = &vif.state;
        let scheme_is_dhcp = s.ip_assign_scheme.as_deref() == Some(IP_SCHEME_DHCP);
        let can_renew = s.is_configurable
            && s.is_active
            && s.is_enabled
            && s.is_network
            && s.is_sta
            && !s.is_4addr
            && scheme_is_dhcp;

        // A 4addr (WDS) VIF should never run its own DHCP client; it only
        // ever goes into a bridge where the LAN DHCP client runs.
        if s.is_4addr && scheme_is_dhcp {
            warn!(vif = %vif.name, "dhcp: 4addr vif with dhcp scheme");
        }

        if can_renew {
            Self::renew(vif, store);
        }
    }

    pub fn poll(&mut self, now: Millis, store: &mut Store) {
        let names: Vec<String> = self.vifs.keys().cloned().collect();
        for name in names {
            let fire = self
                .vifs
                .get_mut(&name)
                .map(|v| v.gate.try_fire(now))
                .unwrap_or(false);
            if fire {
                debug!(vif = %name, "dhcp: recalc");
                if let Some(vif) = self.vifs.get(&name) {
                    Self::recalc(vif, store);
                }
            }
        }
    }

    pub fn next_wakeup(&self) -> Option<Millis> {
        self.vifs.values().filter_map(|v| v.gate.next_wakeup()).min()
    }
}

impl Default for DhcpEngine {
    fn default() -> Self {
        Self::new()
    }
}
