//! Connection_Manager_Uplink row lifecycle.
//!
//! One entity per backhaul interface. A VIF entity owns the row of a
//! 4-address station link; its GRE child owns the row of the tunnel that
//! carries a 3-address link. The two are mutually exclusive by derivation:
//! `wvs_4addr` selects which one exists.

use std::collections::BTreeMap;

use airmesh_store::{
    ConnectionManagerUplink, RowUpdate, Store, UpdateKind, WifiMasterState, WifiVifState,
    IF_TYPE_GRE, IF_TYPE_VIF, PORT_STATE_ACTIVE, VIF_MODE_STA,
};
use airmesh_work::{Millis, RecalcGate};
use tracing::{debug, info, warn};

use crate::BackhaulError;

pub const CMU_BACKOFF_MS: Millis = 3000;
pub const CMU_DEADLINE_MS: Millis = 3000;

#[derive(Debug, Default, Clone)]
struct VifReport {
    wvs_sta: bool,
    wvs_4addr: bool,
    wms_active: bool,
    cmu_exists: bool,
    cmu_has_l2: bool,
    cmu_has_l3: bool,
}

struct CmuVif {
    gre: Option<String>,
    gate: RecalcGate,
    need_delete: bool,
    report: VifReport,
}

#[derive(Debug, Default, Clone)]
struct GreReport {
    wms_active: bool,
    cmu_exists: bool,
    cmu_has_l2: bool,
    cmu_has_l3: bool,
}

struct CmuGre {
    parent: String,
    gate: RecalcGate,
    need_delete: bool,
    report: GreReport,
}

/// A port-state blip (active -> inactive -> active) must force the row
/// through a delete/insert cycle so the link selector re-processes it.
fn wms_active_to_need_delete(active: bool) -> bool {
    !active
}

pub struct CmuEngine {
    vifs: BTreeMap<String, CmuVif>,
    gres: BTreeMap<String, CmuGre>,
}

impl CmuEngine {
    pub fn new() -> Self {
        Self {
            vifs: BTreeMap::new(),
            gres: BTreeMap::new(),
        }
    }

    pub fn add_vif(&mut self, vif_name: &str) -> Result<(), BackhaulError> {
        if self.vifs.contains_key(vif_name) {
            return Err(BackhaulError::Duplicate(vif_name.to_string()));
        }
        info!(vif = %vif_name, "cmu: vif: allocated");
        self.vifs.insert(
            vif_name.to_string(),
            CmuVif {
                gre: None,
                gate: RecalcGate::new(CMU_DEADLINE_MS, CMU_BACKOFF_MS),
                need_delete: false,
                report: VifReport::default(),
            },
        );
        Ok(())
    }

    pub fn add_gre(&mut self, gre_name: &str, parent_name: &str) -> Result<(), BackhaulError> {
        if self.gres.contains_key(gre_name) {
            return Err(BackhaulError::Duplicate(gre_name.to_string()));
        }
        let vif = self
            .vifs
            .get_mut(parent_name)
            .ok_or_else(|| BackhaulError::NotFound(parent_name.to_string()))?;
        if vif.gre.is_some() {
            return Err(BackhaulError::AlreadyBound(parent_name.to_string()));
        }
        vif.gre = Some(gre_name.to_string());
        info!(gre = %gre_name, vif = %parent_name, "cmu: gre: allocated");
        self.gres.insert(
            gre_name.to_string(),
            CmuGre {
                parent: parent_name.to_string(),
                gate: RecalcGate::new(CMU_DEADLINE_MS, CMU_BACKOFF_MS),
                need_delete: false,
                report: GreReport::default(),
            },
        );
        Ok(())
    }

    pub fn drop_gre(&mut self, gre_name: &str) {
        if let Some(gre) = self.gres.remove(gre_name) {
            info!(gre = %gre_name, "cmu: gre: dropping");
            if let Some(vif) = self.vifs.get_mut(&gre.parent) {
                vif.gre = None;
            }
        }
    }

    pub fn drop_vif(&mut self, vif_name: &str) {
        if let Some(vif) = self.vifs.remove(vif_name) {
            info!(vif = %vif_name, "cmu: vif: dropping");
            if let Some(gre) = vif.gre {
                warn!(vif = %vif_name, gre = %gre, "cmu: vif dropped before its gre");
            }
        }
    }

    pub fn has_vif(&self, vif_name: &str) -> bool {
        self.vifs.contains_key(vif_name)
    }

    pub fn has_gre(&self, gre_name: &str) -> bool {
        self.gres.contains_key(gre_name)
    }

    fn schedule_vif(&mut self, vif_name: &str, now: Millis) {
        let gre = match self.vifs.get_mut(vif_name) {
            Some(vif) => {
                vif.gate.mark(now);
                vif.gre.clone()
            }
            None => return,
        };
        if let Some(gre_name) = gre {
            if let Some(gre) = self.gres.get_mut(&gre_name) {
                gre.gate.mark(now);
            }
        }
    }

    fn schedule_gre(&mut self, gre_name: &str, now: Millis) {
        if let Some(gre) = self.gres.get_mut(gre_name) {
            gre.gate.mark(now);
        }
    }

    /// Station-mode report for a VIF entity. Public because the MLO
    /// aggregator substitutes the per-MLD identity through this.
    pub fn report_vif_wvs_sta(&mut self, vif_name: &str, v: bool, now: Millis) {
        let changed = match self.vifs.get_mut(vif_name) {
            Some(vif) if vif.report.wvs_sta != v => {
                info!(vif = %vif_name, from = vif.report.wvs_sta, to = v, "cmu: report: wvs_sta");
                vif.report.wvs_sta = v;
                true
            }
            _ => false,
        };
        if changed {
            self.schedule_vif(vif_name, now);
        }
    }

    pub fn report_vif_wvs_4addr(&mut self, vif_name: &str, v: bool, now: Millis) {
        let changed = match self.vifs.get_mut(vif_name) {
            Some(vif) if vif.report.wvs_4addr != v => {
                info!(vif = %vif_name, from = vif.report.wvs_4addr, to = v, "cmu: report: wvs_4addr");
                vif.report.wvs_4addr = v;
                true
            }
            _ => false,
        };
        if changed {
            self.schedule_vif(vif_name, now);
        }
    }

    fn report_vif_wms_active(&mut self, vif_name: &str, v: bool, now: Millis) {
        let (changed, gre) = match self.vifs.get_mut(vif_name) {
            Some(vif) if vif.report.wms_active != v => {
                info!(vif = %vif_name, from = vif.report.wms_active, to = v, "cmu: report: wms_active");
                vif.report.wms_active = v;
                if wms_active_to_need_delete(v) && !vif.need_delete {
                    info!(vif = %vif_name, "cmu: set: need_delete");
                    vif.need_delete = true;
                }
                (true, vif.gre.clone())
            }
            _ => (false, None),
        };
        if !changed {
            return;
        }
        if let Some(gre_name) = gre {
            self.set_gre_need_delete(&gre_name, wms_active_to_need_delete(v), now);
        }
        self.schedule_vif(vif_name, now);
    }

    fn set_gre_need_delete(&mut self, gre_name: &str, v: bool, now: Millis) {
        let set = match self.gres.get_mut(gre_name) {
            Some(gre) if v && !gre.need_delete => {
                info!(gre = %gre_name, "cmu: set: need_delete");
                gre.need_delete = true;
                true
            }
            _ => false,
        };
        if set {
            self.schedule_gre(gre_name, now);
        }
    }

    fn report_gre_wms_active(&mut self, gre_name: &str, v: bool, now: Millis) {
        let changed = match self.gres.get_mut(gre_name) {
            Some(gre) if gre.report.wms_active != v => {
                info!(gre = %gre_name, from = gre.report.wms_active, to = v, "cmu: report: wms_active");
                gre.report.wms_active = v;
                true
            }
            _ => false,
        };
        if changed {
            self.set_gre_need_delete(gre_name, wms_active_to_need_delete(v), now);
            self.schedule_gre(gre_name, now);
        }
    }

    fn report_vif_cmu_exists(&mut self, vif_name: &str, v: bool, now: Millis) {
        let changed = match self.vifs.get_mut(vif_name) {
            Some(vif) if vif.report.cmu_exists != v => {
                info!(vif = %vif_name, from = vif.report.cmu_exists, to = v, "cmu: report: cmu_exists");
                vif.report.cmu_exists = v;
                true
            }
            _ => false,
        };
        if changed {
            self.schedule_vif(vif_name, now);
        }
    }

    fn report_vif_cmu_has_l2(&mut self, vif_name: &str, v: bool, now: Millis) {
        let changed = match self.vifs.get_mut(vif_name) {
            Some(vif) if vif.report.cmu_has_l2 != v => {
                info!(vif = %vif_name, from = vif.report.cmu_has_l2, to = v, "cmu: report: cmu_has_l2");
                vif.report.cmu_has_l2 = v;
                true
            }
            _ => false,
        };
        if changed {
            self.schedule_vif(vif_name, now);
        }
    }

    fn report_vif_cmu_has_l3(&mut self, vif_name: &str, v: bool, now: Millis) {
        let changed = match self.vifs.get_mut(vif_name) {
            Some(vif) if vif.report.cmu_has_l3 != v => {
                info!(vif = %vif_name, from = vif.report.cmu_has_l3, to = v, "cmu: report: cmu_has_l3");
                vif.report.cmu_has_l3 = v;
                true
            }
            _ => false,
        };
        if changed {
            self.schedule_vif(vif_name, now);
        }
    }

    fn report_gre_cmu_exists(&mut self, gre_name: &str, v: bool, now: Millis) {
        let changed = match self.gres.get_mut(gre_name) {
            Some(gre) if gre.report.cmu_exists != v => {
                info!(gre = %gre_name, from = gre.report.cmu_exists, to = v, "cmu: report: cmu_exists");
                gre.report.cmu_exists = v;
                true
            }
            _ => false,
        };
        if changed {
            self.schedule_gre(gre_name, now);
        }
    }

    fn report_gre_cmu_has_l2(&mut self, gre_name: &str, v: bool, now: Millis) {
        let changed = match self.gres.get_mut(gre_name) {
            Some(gre) if gre.report.cmu_has_l2 != v => {
                info!(gre = %gre_name, from = gre.report.cmu_has_l2, to = v, "cmu: report: cmu_has_l2");
                gre.report.cmu_has_l2 = v;
                true
            }
            _ => false,
        };
        if changed {
            self.schedule_gre(gre_name, now);
        }
    }

    fn report_gre_cmu_has_l3(&mut self, gre_name: &str, v: bool, now: Millis) {
        let changed = match self.gres.get_mut(gre_name) {
            Some(gre) if gre.report.cmu_has_l3 != v => {
                info!(gre = %gre_name, from = gre.report.cmu_has_l3, to = v, "cmu: report: cmu_has_l3");
                gre.report.cmu_has_l3 = v;
                true
            }
            _ => false,
        };
        if changed {
            self.schedule_gre(gre_name, now);
        }
    }

    // Observers.

    pub fn on_vif_state(&mut self, u: &RowUpdate<WifiVifState>, now: Millis) {
        let if_name = u.key().to_string();
        if u.changed(|r| &r.mode) {
            let v = u
                .row()
                .and_then(|r| r.mode.as_deref())
                .map(|m| m == VIF_MODE_STA)
                .unwrap_or(false);
            self.report_vif_wvs_sta(&if_name, v, now);
        }
        if u.changed(|r| &r.wds) {
            let v = u.row().and_then(|r| r.wds).unwrap_or(false);
            self.report_vif_wvs_4addr(&if_name, v, now);
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
            self.report_vif_wms_active(&if_name, v, now);
            self.report_gre_wms_active(&if_name, v, now);
        }
    }

    pub fn on_uplink(&mut self, u: &RowUpdate<ConnectionManagerUplink>, now: Millis) {
        let if_name = u.key().to_string();
        if u.changed(|r| &r.has_l2) {
            let v = u.row().and_then(|r| r.has_l2).unwrap_or(false);
            self.report_vif_cmu_has_l2(&if_name, v, now);
            self.report_gre_cmu_has_l2(&if_name, v, now);
        }
        if u.changed(|r| &r.has_l3) {
            let v = u.row().and_then(|r| r.has_l3).unwrap_or(false);
            self.report_vif_cmu_has_l3(&if_name, v, now);
            self.report_gre_cmu_has_l3(&if_name, v, now);
        }
        match u.kind {
            UpdateKind::New => {
                self.report_vif_cmu_exists(&if_name, true, now);
                self.report_gre_cmu_exists(&if_name, true, now);
            }
            UpdateKind::Modify => (),
            UpdateKind::Delete => {
                self.report_vif_cmu_exists(&if_name, false, now);
                self.report_gre_cmu_exists(&if_name, false, now);
            }
        }
    }

    // Derivation.

    fn vif_derive(report: &VifReport) -> (bool, bool, bool) {
        let cmu_exists = report.wvs_sta && report.wvs_4addr;
        let has_l2 = cmu_exists && report.wms_active;
        let has_l3 = has_l2;
        (cmu_exists, has_l2, has_l3)
    }

    fn gre_derive(parent: &VifReport, report: &GreReport) -> (bool, bool, bool) {
        let cmu_exists = parent.wvs_sta && !parent.wvs_4addr;
        let has_l2 = cmu_exists && parent.wms_active && report.wms_active;
        let has_l3 = has_l2;
        (cmu_exists, has_l2, has_l3)
    }

    fn insert_row(store: &mut Store, if_name: &str, if_type: &str, has_l2: bool, has_l3: bool) -> bool {
        store
            .insert_uplink(ConnectionManagerUplink {
                if_name: if_name.to_string(),
                if_type: Some(if_type.to_string()),
                has_l2: Some(has_l2),
                has_l3: Some(has_l3),
            })
            .map_err(|e| warn!(if_name = %if_name, error = %e, "cmu: insert failed"))
            .is_ok()
    }

    fn recalc_vif(&mut self, vif_name: &str, now: Millis, store: &mut Store) {
        let (report, mut need_delete) = match self.vifs.get(vif_name) {
            Some(vif) => (vif.report.clone(), vif.need_delete),
            None => return,
        };

        let (cmu_exists, has_l2, has_l3) = Self::vif_derive(&report);
        let cmu_changed = cmu_exists != report.cmu_exists;
        let l2_changed = has_l2 != report.cmu_has_l2;
        let l3_changed = has_l3 != report.cmu_has_l3;

        if cmu_changed && cmu_exists {
            info!(vif = %vif_name, "cmu: inserting");
            need_delete = false;
            if Self::insert_row(store, vif_name, IF_TYPE_VIF, has_l2, has_l3) {
                self.report_vif_cmu_exists(vif_name, true, now);
            }
        }

        let exists_now = self
            .vifs
            .get(vif_name)
            .map(|v| v.report.cmu_exists)
            .unwrap_or(false);
        if exists_now {
            if l2_changed {
                info!(vif = %vif_name, has_l2, "cmu: set: has_L2");
                let n = store.update_uplink_has_l2(vif_name, has_l2);
                if n != 1 {
                    warn!(vif = %vif_name, rows = n, "cmu: has_L2 update changed unexpected row count");
                }
            }
            if l3_changed {
                info!(vif = %vif_name, has_l3, "cmu: set: has_L3");
                let n = store.update_uplink_has_l3(vif_name, has_l3);
                if n != 1 {
                    warn!(vif = %vif_name, rows = n, "cmu: has_L3 update changed unexpected row count");
                }
            }
        }

        if (cmu_changed && !cmu_exists) || (exists_now && need_delete) {
            info!(vif = %vif_name, "cmu: deleting");
            need_delete = false;
            let n = store.delete_uplink(vif_name);
            if n != 1 {
                warn!(vif = %vif_name, rows = n, "cmu: delete changed unexpected row count");
            }
            self.schedule_vif(vif_name, now);
        }

        if let Some(vif) = self.vifs.get_mut(vif_name) {
            vif.need_delete = need_delete;
        }
    }

    fn recalc_gre(&mut self, gre_name: &str, now: Millis, store: &mut Store) {
        let (parent_report, report, mut need_delete) = match self.gres.get(gre_name) {
            Some(gre) => {
                let parent = match self.vifs.get(&gre.parent) {
                    Some(vif) => vif.report.clone(),
                    None => {
                        warn!(gre = %gre_name, parent = %gre.parent, "cmu: gre without parent vif");
                        return;
                    }
                };
                (parent, gre.report.clone(), gre.need_delete)
            }
            None => return,
        };

        let (cmu_exists, has_l2, has_l3) = Self::gre_derive(&parent_report, &report);
        let cmu_changed = cmu_exists != report.cmu_exists;
        let l2_changed = has_l2 != report.cmu_has_l2;
        let l3_changed = has_l3 != report.cmu_has_l3;

        if cmu_changed && cmu_exists {
            info!(gre = %gre_name, "cmu: inserting");
            need_delete = false;
            if Self::insert_row(store, gre_name, IF_TYPE_GRE, has_l2, has_l3) {
                self.report_gre_cmu_exists(gre_name, true, now);
            }
        }

        let exists_now = self
            .gres
            .get(gre_name)
            .map(|g| g.report.cmu_exists)
            .unwrap_or(false);
        if exists_now {
            if l2_changed {
                info!(gre = %gre_name, has_l2, "cmu: set: has_L2");
                let n = store.update_uplink_has_l2(gre_name, has_l2);
                if n != 1 {
                    warn!(gre = %gre_name, rows = n, "cmu: has_L2 update changed unexpected row count");
                }
            }
            if l3_changed {
                info!(gre = %gre_name, has_l3, "cmu: set: has_L3");
                let n = store.update_uplink_has_l3(gre_name, has_l3);
                if n != 1 {
                    warn!(gre = %gre_name, rows = n, "cmu: has_L3 update changed unexpected row count");
                }
            }
        }

        if (cmu_changed && !cmu_exists) || (exists_now && need_delete) {
            info!(gre = %gre_name, "cmu: deleting");
            need_delete = false;
            let n = store.delete_uplink(gre_name);
            if n != 1 {
                warn!(gre = %gre_name, rows = n, "cmu: delete changed unexpected row count");
            }
            self.schedule_gre(gre_name, now);
        }

        if let Some(gre) = self.gres.get_mut(gre_name) {
            gre.need_delete = need_delete;
        }
    }

    pub fn poll(&mut self, now: Millis, store: &mut Store) {
        let vif_names: Vec<String> = self.vifs.keys().cloned().collect();
        for name in vif_names {
            let fire = self
                .vifs
                .get_mut(&name)
                .map(|v| v.gate.try_fire(now))
                .unwrap_or(false);
            if fire {
                debug!(vif = %name, "cmu: recalc");
                self.recalc_vif(&name, now, store);
            }
        }
        let gre_names: Vec<String> = self.gres.keys().cloned().collect();
        for name in gre_names {
            let fire = self
                .gres
                .get_mut(&name)
                .map(|g| g.gate.try_fire(now))
                .unwrap_or(false);
            if fire {
                debug!(gre = %name, "cmu: recalc");
                self.recalc_gre(&name, now, store);
            }
        }
    }

    pub fn next_wakeup(&self) -> Option<Millis> {
        let vifs = self.vifs.values().filter_map(|v| v.gate.next_wakeup());
        let gres = self.gres.values().filter_map(|g| g.gate.next_wakeup());
        vifs.chain(gres).min()
    }
}

impl Default for CmuEngine {
    fn default() -> Self {
        Self::new()
    }
}
