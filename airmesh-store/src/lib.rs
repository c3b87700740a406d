//! State-store surface consumed and produced by the reconcilers.
//!
//! The real deployment backs these tables with a schema database; here the
//! tables live in memory behind the same observable surface: typed rows,
//! per-column change detection on updates, and multi-row transactions. The
//! reconcilers only ever see [`RowUpdate`] events and issue row writes, so
//! swapping the backing store does not touch them.

pub mod event;
pub mod store;
pub mod tables;

pub use event::{RowUpdate, StoreEvent, UpdateKind};
pub use store::{Store, TxOp};
pub use tables::{
    ConnectionManagerUplink, WifiInetConfig, WifiInetState, WifiMasterState, WifiVifState,
    IF_TYPE_GRE, IF_TYPE_VIF, IP_SCHEME_DHCP, IP_SCHEME_NONE, PORT_STATE_ACTIVE, VIF_MODE_STA,
};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row already exists: {0}")]
    Duplicate(String),
    #[error("row not found: {0}")]
    NotFound(String),
}
