//! Desired configuration tree: what the wireless stack should look like.

use std::collections::{BTreeMap, BTreeSet};

use airmesh_work::Millis;
use serde::{Deserialize, Serialize};

use crate::types::{
    AclPolicy, ApMode, Channel, HwAddr, MbssMode, MultiAp, Neigh, Passpoint, Radius, RadarMode,
    RegDomain, Ssid, StaNetwork, VifType, Wpa, WpsCred,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfTree {
    pub phys: BTreeMap<String, ConfPhy>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfPhy {
    pub phy_name: String,
    pub enabled: bool,
    pub tx_chainmask: u32,
    pub radar: RadarMode,
    pub reg_domain: RegDomain,
    pub vifs: BTreeMap<String, ConfVif>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfVif {
    pub vif_name: String,
    pub enabled: bool,
    pub tx_power_dbm: i32,
    pub kind: ConfVifKind,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum ConfVifKind {
    #[default]
    Undefined,
    Ap(Box<ApConf>),
    ApVlan,
    Sta(StaConf),
}

impl ConfVif {
    pub fn vif_type(&self) -> VifType {
        match self.kind {
            ConfVifKind::Undefined => VifType::Undefined,
            ConfVifKind::Ap(_) => VifType::Ap,
            ConfVifKind::ApVlan => VifType::ApVlan,
            ConfVifKind::Sta(_) => VifType::Sta,
        }
    }

    pub fn ap(&self) -> Option<&ApConf> {
        match &self.kind {
            ConfVifKind::Ap(ap) => Some(ap),
            _ => None,
        }
    }

    pub fn ap_mut(&mut self) -> Option<&mut ApConf> {
        match &mut self.kind {
            ConfVifKind::Ap(ap) => Some(ap),
            _ => None,
        }
    }

    pub fn sta(&self) -> Option<&StaConf> {
        match &self.kind {
            ConfVifKind::Sta(sta) => Some(sta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApConf {
    pub bridge_if_name: String,
    pub nas_identifier: String,
    pub ssid: Ssid,
    pub channel: Channel,
    pub beacon_interval_tu: u16,
    pub isolated: bool,
    pub ssid_hidden: bool,
    pub mcast2ucast: bool,
    pub mode: ApMode,
    pub wpa: Wpa,
    pub wps_pbc: bool,
    pub multi_ap: MultiAp,
    pub mbss_mode: MbssMode,
    pub mbss_group: i32,
    pub acl_policy: AclPolicy,
    pub acl: BTreeSet<HwAddr>,
    /// key_id -> passphrase.
    pub psks: BTreeMap<i32, String>,
    pub neighs: BTreeMap<HwAddr, Neigh>,
    pub wps_creds: Vec<WpsCred>,
    pub radius_list: Vec<Radius>,
    pub acct_list: Vec<Radius>,
    pub passpoint: Passpoint,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaConf {
    /// Candidate networks in preference order.
    pub networks: Vec<StaNetwork>,
}

/// A mutator rewrites the desired tree before it is diffed against driver
/// state. Mutators run in registration order; later mutators see earlier
/// mutations.
pub trait ConfMutator {
    fn mutate(&mut self, tree: &mut ConfTree, now: Millis);
}
