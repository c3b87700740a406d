//! Backhaul reconcilers.
//!
//! Four cooperating state machines keep the uplink-facing rows of the state
//! store converged with what the wireless driver reports:
//!
//! - [`cmu::CmuEngine`] owns one Connection_Manager_Uplink row per backhaul
//!   interface (VIF or GRE) and its has_L2/has_L3 readiness flags.
//! - [`dhcp::DhcpEngine`] bumps the DHCP renew counter on station VIFs when
//!   the renewal preconditions hold.
//! - [`gre::GreEngine`] derives GRE tunnel endpoints from the link-local
//!   address of a 3-address station link and maintains the tunnel row.
//! - [`mlo::MloEngine`] aggregates multi-link VIFs into one MLD identity and
//!   feeds the other three with the per-MLD view.
//!
//! All of them follow the same report-then-schedule pattern: observers write
//! `report.*` fields, mark work, and a debounced recalc re-derives desired
//! state and emits the difference. Everything is idempotent; convergence is
//! reached by re-running, not by careful event ordering.

pub mod bootstrap;
pub mod cmu;
pub mod dhcp;
pub mod gre;
pub mod mlo;

use airmesh_store::{Store, StoreEvent};
use airmesh_work::Millis;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackhaulError {
    #[error("entity already exists: {0}")]
    Duplicate(String),
    #[error("entity not found: {0}")]
    NotFound(String),
    #[error("vif already bound: {0}")]
    AlreadyBound(String),
}

/// The full backhaul reconciler set wired together.
pub struct Backhaul {
    pub cmu: cmu::CmuEngine,
    pub dhcp: dhcp::DhcpEngine,
    pub gre: gre::GreEngine,
    pub mlo: mlo::MloEngine,
}

impl Backhaul {
    /// Build the reconciler set from a bootstrap list of space-separated
    /// `phy:vif` tokens. Each VIF gets a `g-<vif>` GRE sibling.
    pub fn from_list(list: &str, gre_mtu: u32) -> Self {
        let mut cmu = cmu::CmuEngine::new();
        let mut dhcp = dhcp::DhcpEngine::new();
        let mut gre = gre::GreEngine::new(gre_mtu);
        for entry in bootstrap::parse_list(list) {
            let vif_name = entry.vif_name;
            let gre_name = bootstrap::gre_name_for(&vif_name);
            let _ = cmu.add_vif(&vif_name);
            let _ = cmu.add_gre(&gre_name, &vif_name);
            let _ = dhcp.add_vif(&vif_name);
            let _ = gre.add_vif(&vif_name);
            let _ = gre.bind_tun(&vif_name, &gre_name);
        }
        Self {
            cmu,
            dhcp,
            gre,
            mlo: mlo::MloEngine::new(),
        }
    }

    /// Route one store event to every interested observer.
    pub fn dispatch(&mut self, ev: &StoreEvent, now: Millis) {
        match ev {
            StoreEvent::VifState(u) => {
                self.cmu.on_vif_state(u, now);
                self.dhcp.on_vif_state(u, now);
                self.mlo.on_vif_state(u, now, &mut self.cmu, &mut self.dhcp, &mut self.gre);
            }
            StoreEvent::MasterState(u) => {
                self.cmu.on_master_state(u, now);
                self.dhcp.on_master_state(u, now);
            }
            StoreEvent::InetState(u) => {
                self.gre.on_inet_state(u, now);
                self.dhcp.on_inet_state(u, now);
            }
            StoreEvent::InetConfig(u) => {
                self.dhcp.on_inet_config(u, now);
            }
            StoreEvent::Uplink(u) => {
                self.cmu.on_uplink(u, now);
            }
        }
    }

    /// One reconciliation pass: run every due recalc and emit side effects.
    pub fn poll(&mut self, now: Millis, store: &mut Store) {
        self.cmu.poll(now, store);
        self.dhcp.poll(now, store);
        self.gre.poll(now, store);
        self.mlo.poll(now, &mut self.cmu, &mut self.dhcp, &mut self.gre, store);
    }

    pub fn next_wakeup(&self) -> Option<Millis> {
        [
            self.cmu.next_wakeup(),
            self.dhcp.next_wakeup(),
            self.gre.next_wakeup(),
            self.mlo.next_wakeup(),
        ]
        .into_iter()
        .flatten()
        .min()
    }
}
