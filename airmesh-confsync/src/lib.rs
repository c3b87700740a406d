//! Wireless configuration synchronizer.
//!
//! A declarative reconciler between a desired wireless configuration tree
//! (phys -> vifs -> aps/stas) and what the driver actually reports. The
//! diff engine emits a minimum-sufficient reconfiguration plan with
//! per-field change masks; the state machine debounces rounds, retries
//! rejected requests, and verifies convergence against fresh driver state.
//!
//! Orderings the diff honors:
//! - a channel change rides a CSA only when no affected segment owes a CAC;
//! - a vif that will start a CAC keeps every other vif on that phy
//!   untouched for the round;
//! - a phy mid-CAC is left alone until the CAC (or its watchdog) finishes;
//! - freshly enabled vifs get a deferral window so transient invalidations
//!   cannot interrupt a slow bring-up.

pub mod conf;
pub mod defer_vif_down;
pub mod diff;
pub mod drv;
pub mod state;
pub mod sync;
pub mod types;

pub use conf::{ApConf, ConfMutator, ConfPhy, ConfTree, ConfVif, ConfVifKind, StaConf};
pub use defer_vif_down::{DeferEvent, DeferVifDown};
pub use drv::{ApConfig, DriverMux, DrvConf, PhyConfig, StaConfig, StaOperation, VifConfig, VifConfigKind};
pub use state::{ApState, ObservedTree, PhyInfo, PhyState, StaLink, StaState, VifState, VifStateKind};
pub use sync::{ConfSync, ConfsyncEnv, SyncState};
