//! Multi-link operation aggregator.
//!
//! Link-VIFs tagged with the same `mld_if_name` fold into one MLD entity.
//! The MLD presents a single station identity to the CMU/DHCP/GRE
//! reconcilers (named after the MLD) and garbage-collects itself when its
//! last link detaches. Recalcs coalesce through the shared work scheduler.

use std::collections::{BTreeMap, BTreeSet};

use airmesh_store::{RowUpdate, Store, WifiVifState, VIF_MODE_STA};
use airmesh_work::{Millis, Work};
use tracing::{debug, info};

use crate::bootstrap::gre_name_for;
use crate::cmu::CmuEngine;
use crate::dhcp::DhcpEngine;
use crate::gre::GreEngine;

pub const MLO_DEADLINE_MS: Millis = 3000;
pub const MLO_COOLDOWN_MS: Millis = 3000;

#[derive(Debug, Default, Clone)]
struct LinkReport {
    wvs_sta: bool,
    wvs_4addr: bool,
}

struct MloVif {
    mld: Option<String>,
    report: LinkReport,
}

struct Mld {
    work: Work,
    vifs: BTreeSet<String>,
    has_gre: bool,
}

pub struct MloEngine {
    vifs: BTreeMap<String, MloVif>,
    mlds: BTreeMap<String, Mld>,
}

impl MloEngine {
    pub fn new() -> Self {
        Self {
            vifs: BTreeMap::new(),
            mlds: BTreeMap::new(),
        }
    }

    pub fn has_mld(&self, mld_name: &str) -> bool {
        self.mlds.contains_key(mld_name)
    }

    fn ensure_vif(&mut self, vif_name: &str) {
        if !self.vifs.contains_key(vif_name) {
            info!(vif = %vif_name, "mlo: vif: allocated");
            self.vifs.insert(
                vif_name.to_string(),
                MloVif {
                    mld: None,
                    report: LinkReport::default(),
                },
            );
        }
    }

    fn ensure_mld(
        &mut self,
        mld_name: &str,
        cmu: &mut CmuEngine,
        dhcp: &mut DhcpEngine,
    ) {
        if self.mlds.contains_key(mld_name) {
            return;
        }
        info!(mld = %mld_name, "mlo: mld: allocated");
        let gre_name = gre_name_for(mld_name);
        let _ = cmu.add_vif(mld_name);
        let _ = cmu.add_gre(&gre_name, mld_name);
        let _ = dhcp.add_vif(mld_name);
        self.mlds.insert(
            mld_name.to_string(),
            Mld {
                work: Work::new(format!("mlo: mld: {mld_name}"), MLO_DEADLINE_MS, MLO_COOLDOWN_MS),
                vifs: BTreeSet::new(),
                has_gre: false,
            },
        );
    }

    fn schedule_mld(&mut self, mld_name: &str, now: Millis) {
        if let Some(mld) = self.mlds.get_mut(mld_name) {
            mld.work.schedule(now);
        }
    }

    fn report_mld(&mut self, vif_name: &str, mld_name: Option<&str>, now: Millis) {
        let old = match self.vifs.get(vif_name) {
            Some(vif) => vif.mld.clone(),
            None => return,
        };
        if old.as_deref() == mld_name {
            return;
        }
        info!(
            vif = %vif_name,
            from = old.as_deref().unwrap_or(""),
            to = mld_name.unwrap_or(""),
            "mlo: vif: mld"
        );
        if let Some(old_name) = old {
            if let Some(mld) = self.mlds.get_mut(&old_name) {
                mld.vifs.remove(vif_name);
            }
            if let Some(vif) = self.vifs.get_mut(vif_name) {
                vif.mld = None;
            }
            self.schedule_mld(&old_name, now);
        }
        if let Some(new_name) = mld_name {
            if let Some(mld) = self.mlds.get_mut(new_name) {
                mld.vifs.insert(vif_name.to_string());
            }
            if let Some(vif) = self.vifs.get_mut(vif_name) {
                vif.mld = Some(new_name.to_string());
            }
            self.schedule_mld(new_name, now);
        }
    }

    fn report_wvs_sta(&mut self, vif_name: &str, v: bool, now: Millis) {
        let mld = match self.vifs.get_mut(vif_name) {
            Some(vif) if vif.report.wvs_sta != v => {
                info!(vif = %vif_name, from = vif.report.wvs_sta, to = v, "mlo: wvs_sta");
                vif.report.wvs_sta = v;
                vif.mld.clone()
            }
            _ => return,
        };
        if let Some(mld_name) = mld {
            self.schedule_mld(&mld_name, now);
        }
    }

    fn report_wvs_4addr(&mut self, vif_name: &str, v: bool, now: Millis) {
        let mld = match self.vifs.get_mut(vif_name) {
            Some(vif) if vif.report.wvs_4addr != v => {
                info!(vif = %vif_name, from = vif.report.wvs_4addr, to = v, "mlo: wvs_4addr");
                vif.report.wvs_4addr = v;
                vif.mld.clone()
            }
            _ => return,
        };
        if let Some(mld_name) = mld {
            self.schedule_mld(&mld_name, now);
        }
    }

    pub fn on_vif_state(
        &mut self,
        u: &RowUpdate<WifiVifState>,
        now: Millis,
        cmu: &mut CmuEngine,
        dhcp: &mut DhcpEngine,
        _gre: &mut GreEngine,
    ) {
        let if_name = u.key().to_string();
        self.ensure_vif(&if_name);

        if u.changed(|r| &r.mld_if_name) {
            let mld_name = u
                .row()
                .and_then(|r| r.mld_if_name.as_deref())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            if let Some(ref name) = mld_name {
                self.ensure_mld(name, cmu, dhcp);
            }
            self.report_mld(&if_name, mld_name.as_deref(), now);
        }

        if u.changed(|r| &r.mode) {
            let v = u
                .row()
                .and_then(|r| r.mode.as_deref())
                .map(|m| m == VIF_MODE_STA)
                .unwrap_or(false);
            self.report_wvs_sta(&if_name, v, now);
        }

        if u.changed(|r| &r.wds) {
            let v = u.row().and_then(|r| r.wds).unwrap_or(false);
            self.report_wvs_4addr(&if_name, v, now);
        }
    }

    fn mld_counts(&self, mld: &Mld) -> (usize, usize, usize) {
        let n = mld.vifs.len();
        let mut n_sta = 0;
        let mut n_4addr = 0;
        for name in &mld.vifs {
            if let Some(vif) = self.vifs.get(name) {
                if vif.report.wvs_sta {
                    n_sta += 1;
                }
                if vif.report.wvs_4addr {
                    n_4addr += 1;
                }
            }
        }
        (n, n_sta, n_4addr)
    }

    fn mld_work(
        &mut self,
        mld_name: &str,
        now: Millis,
        cmu: &mut CmuEngine,
        dhcp: &mut DhcpEngine,
        gre: &mut GreEngine,
        store: &mut Store,
    ) {
        let (n, n_sta, n_4addr) = match self.mlds.get(mld_name) {
            Some(mld) => self.mld_counts(mld),
            None => return,
        };
        let is_sta = n > 0 && n_sta == n;
        let is_4addr = is_sta && n_4addr == n;
        let is_3addr = is_sta && n_4addr == 0;
        let wvs_sta = is_sta && (is_3addr || is_4addr);
        let wvs_4addr = is_sta && is_4addr;

        // GRE tunnel existence follows the 3-address verdict.
        let needs_gre = is_sta && is_3addr;
        let gre_name = gre_name_for(mld_name);
        let runs_gre = self.mlds.get(mld_name).map(|m| m.has_gre).unwrap_or(false);
        if needs_gre != runs_gre {
            info!(mld = %mld_name, from = runs_gre, to = needs_gre, "mlo: gre");
            if runs_gre {
                gre.drop_tun(&gre_name, store);
            }
            if needs_gre {
                let _ = gre.add_vif(mld_name);
                let _ = gre.bind_tun(mld_name, &gre_name);
            }
            if let Some(mld) = self.mlds.get_mut(mld_name) {
                mld.has_gre = needs_gre;
            }
        }

        cmu.report_vif_wvs_sta(mld_name, wvs_sta, now);
        cmu.report_vif_wvs_4addr(mld_name, wvs_4addr, now);

        if n == 0 {
            self.drop_mld(mld_name, cmu, dhcp, gre, store);
        }
    }

    fn drop_mld(
        &mut self,
        mld_name: &str,
        cmu: &mut CmuEngine,
        dhcp: &mut DhcpEngine,
        gre: &mut GreEngine,
        store: &mut Store,
    ) {
        let mld = match self.mlds.remove(mld_name) {
            Some(m) => m,
            None => return,
        };
        info!(mld = %mld_name, "mlo: mld: dropping");
        let gre_name = gre_name_for(mld_name);
        cmu.drop_gre(&gre_name);
        cmu.drop_vif(mld_name);
        dhcp.drop_vif(mld_name);
        if mld.has_gre {
            gre.drop_tun(&gre_name, store);
        }
    }

    pub fn poll(
        &mut self,
        now: Millis,
        cmu: &mut CmuEngine,
        dhcp: &mut DhcpEngine,
        gre: &mut GreEngine,
        store: &mut Store,
    ) {
        let names: Vec<String> = self.mlds.keys().cloned().collect();
        for name in names {
            let fire = self
                .mlds
                .get_mut(&name)
                .map(|m| m.work.poll(now, true))
                .unwrap_or(false);
            if fire {
                debug!(mld = %name, "mlo: work");
                self.mld_work(&name, now, cmu, dhcp, gre, store);
            }
        }
    }

    pub fn next_wakeup(&self) -> Option<Millis> {
        self.mlds.values().filter_map(|m| m.work.next_wakeup()).min()
    }
}

impl Default for MloEngine {
    fn default() -> Self {
        Self::new()
    }
}
