use crate::tables::{
    ConnectionManagerUplink, Row, WifiInetConfig, WifiInetState, WifiMasterState, WifiVifState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    New,
    Modify,
    Delete,
}

/// One monitored row transition, carrying both sides.
///
/// On `Delete` consumers must treat the row as absent; `new()` already
/// returns `None` in that case so derived booleans fall back to their
/// defaults, the same way a removed row clears every column.
#[derive(Debug, Clone)]
pub struct RowUpdate<T: Row> {
    pub kind: UpdateKind,
    old: Option<T>,
    new: Option<T>,
}

impl<T: Row> RowUpdate<T> {
    pub fn new_row(row: T) -> Self {
        Self {
            kind: UpdateKind::New,
            old: None,
            new: Some(row),
        }
    }

    pub fn modify(old: T, new: T) -> Self {
        Self {
            kind: UpdateKind::Modify,
            old: Some(old),
            new: Some(new),
        }
    }

    pub fn delete(old: T) -> Self {
        Self {
            kind: UpdateKind::Delete,
            old: Some(old),
            new: None,
        }
    }

    /// Row key regardless of transition direction.
    pub fn key(&self) -> &str {
        match (&self.new, &self.old) {
            (Some(n), _) => n.key(),
            (None, Some(o)) => o.key(),
            (None, None) => unreachable!("update without either side"),
        }
    }

    /// The row as visible after this update. `None` once deleted.
    pub fn row(&self) -> Option<&T> {
        match self.kind {
            UpdateKind::Delete => None,
            _ => self.new.as_ref(),
        }
    }

    pub fn old_row(&self) -> Option<&T> {
        self.old.as_ref()
    }

    /// Did the selected column change in this update? New and Delete report
    /// every column as changed, matching monitor semantics.
    pub fn changed<V: PartialEq>(&self, col: impl Fn(&T) -> &V) -> bool {
        match self.kind {
            UpdateKind::New | UpdateKind::Delete => true,
            UpdateKind::Modify => match (&self.old, &self.new) {
                (Some(o), Some(n)) => col(o) != col(n),
                _ => true,
            },
        }
    }
}

/// Events emitted by the store, one per row transition per table.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    VifState(RowUpdate<WifiVifState>),
    MasterState(RowUpdate<WifiMasterState>),
    InetState(RowUpdate<WifiInetState>),
    InetConfig(RowUpdate<WifiInetConfig>),
    Uplink(RowUpdate<ConnectionManagerUplink>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vif(name: &str, mode: Option<&str>) -> WifiVifState {
        WifiVifState {
            if_name: name.to_string(),
            mode: mode.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn modify_detects_changed_columns() {
        let u = RowUpdate::modify(vif("b", Some("ap")), vif("b", Some("sta")));
        assert!(u.changed(|r| &r.mode));
        assert!(!u.changed(|r| &r.wds));
    }

    #[test]
    fn new_and_delete_change_everything() {
        let u = RowUpdate::new_row(vif("b", None));
        assert!(u.changed(|r| &r.mode));
        let u = RowUpdate::delete(vif("b", Some("sta")));
        assert!(u.changed(|r| &r.mode));
        assert!(u.row().is_none());
        assert_eq!(u.key(), "b");
    }
}
