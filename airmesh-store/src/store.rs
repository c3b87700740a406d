use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;

use tracing::{debug, warn};

use crate::event::{RowUpdate, StoreEvent};
use crate::tables::{
    ConnectionManagerUplink, Row, WifiInetConfig, WifiInetState, WifiMasterState, WifiVifState,
};
use crate::StoreError;

/// Operations available inside a multi-row transaction. The DHCP renewal is
/// the one writer that needs atomicity across tables.
#[derive(Debug, Clone)]
pub enum TxOp {
    ZeroMasterInetAddr { if_name: String },
    ZeroInetStateInetAddr { if_name: String },
    BumpDhcpRenew { if_name: String },
}

/// In-memory state store with monitor-style event delivery.
///
/// Writers mutate rows; every effective transition is queued as a
/// [`StoreEvent`]. The embedding loop drains events and dispatches them to
/// the observers, which is what closes the reconciliation loop in tests and
/// in the daemon alike.
#[derive(Debug, Default)]
pub struct Store {
    vif_state: BTreeMap<String, WifiVifState>,
    master_state: BTreeMap<String, WifiMasterState>,
    inet_state: BTreeMap<String, WifiInetState>,
    inet_config: BTreeMap<String, WifiInetConfig>,
    uplink: BTreeMap<String, ConnectionManagerUplink>,
    events: VecDeque<StoreEvent>,
}

fn upsert<T: Row>(
    map: &mut BTreeMap<String, T>,
    row: T,
    wrap: impl Fn(RowUpdate<T>) -> StoreEvent,
    events: &mut VecDeque<StoreEvent>,
) {
    let key = row.key().to_string();
    match map.get(&key) {
        Some(old) if *old == row => (),
        Some(old) => {
            let old = old.clone();
            map.insert(key, row.clone());
            events.push_back(wrap(RowUpdate::modify(old, row)));
        }
        None => {
            map.insert(key, row.clone());
            events.push_back(wrap(RowUpdate::new_row(row)));
        }
    }
}

fn delete<T: Row>(
    map: &mut BTreeMap<String, T>,
    key: &str,
    wrap: impl Fn(RowUpdate<T>) -> StoreEvent,
    events: &mut VecDeque<StoreEvent>,
) -> usize {
    match map.remove(key) {
        Some(old) => {
            events.push_back(wrap(RowUpdate::delete(old)));
            1
        }
        None => 0,
    }
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain queued row-transition events in delivery order.
    pub fn drain_events(&mut self) -> Vec<StoreEvent> {
        self.events.drain(..).collect()
    }

    pub fn has_events(&self) -> bool {
        !self.events.is_empty()
    }

    /// Synthesize New events for every current row. Used when an observer
    /// attaches after rows already exist.
    pub fn replay(&mut self) {
        let mut replayed: VecDeque<StoreEvent> = VecDeque::new();
        for row in self.vif_state.values() {
            replayed.push_back(StoreEvent::VifState(RowUpdate::new_row(row.clone())));
        }
        for row in self.master_state.values() {
            replayed.push_back(StoreEvent::MasterState(RowUpdate::new_row(row.clone())));
        }
        for row in self.inet_state.values() {
            replayed.push_back(StoreEvent::InetState(RowUpdate::new_row(row.clone())));
        }
        for row in self.inet_config.values() {
            replayed.push_back(StoreEvent::InetConfig(RowUpdate::new_row(row.clone())));
        }
        for row in self.uplink.values() {
            replayed.push_back(StoreEvent::Uplink(RowUpdate::new_row(row.clone())));
        }
        self.events.append(&mut replayed);
    }

    // Observed tables. In a deployment these are fed by the schema
    // database monitor; tests and the daemon feed them directly.

    pub fn upsert_vif_state(&mut self, row: WifiVifState) {
        upsert(&mut self.vif_state, row, StoreEvent::VifState, &mut self.events);
    }

    pub fn delete_vif_state(&mut self, if_name: &str) -> usize {
        delete(&mut self.vif_state, if_name, StoreEvent::VifState, &mut self.events)
    }

    pub fn upsert_master_state(&mut self, row: WifiMasterState) {
        upsert(&mut self.master_state, row, StoreEvent::MasterState, &mut self.events);
    }

    pub fn delete_master_state(&mut self, if_name: &str) -> usize {
        delete(&mut self.master_state, if_name, StoreEvent::MasterState, &mut self.events)
    }

    pub fn upsert_inet_state(&mut self, row: WifiInetState) {
        upsert(&mut self.inet_state, row, StoreEvent::InetState, &mut self.events);
    }

    pub fn delete_inet_state(&mut self, if_name: &str) -> usize {
        delete(&mut self.inet_state, if_name, StoreEvent::InetState, &mut self.events)
    }

    pub fn upsert_inet_config(&mut self, row: WifiInetConfig) {
        upsert(&mut self.inet_config, row, StoreEvent::InetConfig, &mut self.events);
    }

    pub fn delete_inet_config(&mut self, if_name: &str) -> usize {
        delete(&mut self.inet_config, if_name, StoreEvent::InetConfig, &mut self.events)
    }

    pub fn get_inet_config(&self, if_name: &str) -> Option<&WifiInetConfig> {
        self.inet_config.get(if_name)
    }

    // Connection_Manager_Uplink: owned by the CMU reconciler.

    pub fn insert_uplink(&mut self, row: ConnectionManagerUplink) -> Result<(), StoreError> {
        if self.uplink.contains_key(row.key()) {
            return Err(StoreError::Duplicate(row.key().to_string()));
        }
        debug!(if_name = %row.if_name, "store: uplink: insert");
        upsert(&mut self.uplink, row, StoreEvent::Uplink, &mut self.events);
        Ok(())
    }

    /// Single-column update; returns the number of rows changed so callers
    /// can warn when it is not exactly one.
    pub fn update_uplink_has_l2(&mut self, if_name: &str, has_l2: bool) -> usize {
        match self.uplink.get(if_name).cloned() {
            Some(mut row) => {
                row.has_l2 = Some(has_l2);
                upsert(&mut self.uplink, row, StoreEvent::Uplink, &mut self.events);
                1
            }
            None => 0,
        }
    }

    pub fn update_uplink_has_l3(&mut self, if_name: &str, has_l3: bool) -> usize {
        match self.uplink.get(if_name).cloned() {
            Some(mut row) => {
                row.has_l3 = Some(has_l3);
                upsert(&mut self.uplink, row, StoreEvent::Uplink, &mut self.events);
                1
            }
            None => 0,
        }
    }

    pub fn delete_uplink(&mut self, if_name: &str) -> usize {
        delete(&mut self.uplink, if_name, StoreEvent::Uplink, &mut self.events)
    }

    pub fn get_uplink(&self, if_name: &str) -> Option<&ConnectionManagerUplink> {
        self.uplink.get(if_name)
    }

    pub fn uplinks(&self) -> impl Iterator<Item = &ConnectionManagerUplink> {
        self.uplink.values()
    }

    /// Atomic multi-row transaction. All operations apply or none do; a
    /// missing row fails the whole transaction before any mutation.
    pub fn transact(&mut self, ops: Vec<TxOp>) -> Result<(), StoreError> {
        for op in &ops {
            let (map_has, name) = match op {
                TxOp::ZeroMasterInetAddr { if_name } => {
                    (self.master_state.contains_key(if_name), if_name)
                }
                TxOp::ZeroInetStateInetAddr { if_name } => {
                    (self.inet_state.contains_key(if_name), if_name)
                }
                TxOp::BumpDhcpRenew { if_name } => {
                    (self.inet_config.contains_key(if_name), if_name)
                }
            };
            if !map_has {
                warn!(if_name = %name, "store: transact: missing row, aborting");
                return Err(StoreError::NotFound(name.clone()));
            }
        }

        for op in ops {
            match op {
                TxOp::ZeroMasterInetAddr { if_name } => {
                    let mut row = self.master_state[&if_name].clone();
                    row.inet_addr = Some(Ipv4Addr::UNSPECIFIED);
                    upsert(&mut self.master_state, row, StoreEvent::MasterState, &mut self.events);
                }
                TxOp::ZeroInetStateInetAddr { if_name } => {
                    let mut row = self.inet_state[&if_name].clone();
                    row.inet_addr = Some(Ipv4Addr::UNSPECIFIED);
                    upsert(&mut self.inet_state, row, StoreEvent::InetState, &mut self.events);
                }
                TxOp::BumpDhcpRenew { if_name } => {
                    let mut row = self.inet_config[&if_name].clone();
                    row.dhcp_renew = Some(row.dhcp_renew.unwrap_or(0) + 1);
                    upsert(&mut self.inet_config, row, StoreEvent::InetConfig, &mut self.events);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UpdateKind;

    #[test]
    fn upsert_emits_new_then_modify() {
        let mut s = Store::new();
        s.upsert_vif_state(WifiVifState {
            if_name: "bhaul-sta-5".into(),
            mode: Some("sta".into()),
            ..Default::default()
        });
        s.upsert_vif_state(WifiVifState {
            if_name: "bhaul-sta-5".into(),
            mode: Some("sta".into()),
            wds: Some(true),
            ..Default::default()
        });
        // Identical write is swallowed.
        s.upsert_vif_state(WifiVifState {
            if_name: "bhaul-sta-5".into(),
            mode: Some("sta".into()),
            wds: Some(true),
            ..Default::default()
        });
        let evs = s.drain_events();
        assert_eq!(evs.len(), 2);
        match (&evs[0], &evs[1]) {
            (StoreEvent::VifState(a), StoreEvent::VifState(b)) => {
                assert_eq!(a.kind, UpdateKind::New);
                assert_eq!(b.kind, UpdateKind::Modify);
                assert!(b.changed(|r| &r.wds));
                assert!(!b.changed(|r| &r.mode));
            }
            _ => panic!("wrong event types"),
        }
    }

    #[test]
    fn uplink_insert_rejects_duplicate() {
        let mut s = Store::new();
        let row = ConnectionManagerUplink {
            if_name: "bhaul-sta-5".into(),
            if_type: Some("vif".into()),
            has_l2: Some(true),
            has_l3: Some(true),
        };
        assert!(s.insert_uplink(row.clone()).is_ok());
        assert!(s.insert_uplink(row).is_err());
        assert_eq!(s.update_uplink_has_l2("bhaul-sta-5", false), 1);
        assert_eq!(s.update_uplink_has_l2("nonexistent", false), 0);
        assert_eq!(s.delete_uplink("bhaul-sta-5"), 1);
        assert_eq!(s.delete_uplink("bhaul-sta-5"), 0);
    }

    #[test]
    fn renewal_transaction_is_atomic() {
        let mut s = Store::new();
        s.upsert_master_state(WifiMasterState {
            if_name: "bhaul-sta-5".into(),
            port_state: Some("active".into()),
            inet_addr: Some(Ipv4Addr::new(169, 254, 7, 42)),
        });
        s.upsert_inet_state(WifiInetState {
            if_name: "bhaul-sta-5".into(),
            inet_addr: Some(Ipv4Addr::new(169, 254, 7, 42)),
            ..Default::default()
        });
        // Missing Wifi_Inet_Config row: nothing may change.
        let err = s.transact(vec![
            TxOp::ZeroMasterInetAddr { if_name: "bhaul-sta-5".into() },
            TxOp::ZeroInetStateInetAddr { if_name: "bhaul-sta-5".into() },
            TxOp::BumpDhcpRenew { if_name: "bhaul-sta-5".into() },
        ]);
        assert!(err.is_err());
        s.drain_events();

        s.upsert_inet_config(WifiInetConfig {
            if_name: "bhaul-sta-5".into(),
            dhcp_renew: Some(3),
            ..Default::default()
        });
        s.transact(vec![
            TxOp::ZeroMasterInetAddr { if_name: "bhaul-sta-5".into() },
            TxOp::ZeroInetStateInetAddr { if_name: "bhaul-sta-5".into() },
            TxOp::BumpDhcpRenew { if_name: "bhaul-sta-5".into() },
        ])
        .unwrap();
        assert_eq!(s.get_inet_config("bhaul-sta-5").unwrap().dhcp_renew, Some(4));
    }
}
