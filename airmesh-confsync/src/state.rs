//! Observed driver state: what the wireless stack actually looks like.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::{
    AclPolicy, ApMode, Channel, ChannelState, HwAddr, MbssMode, MultiAp, Neigh, Passpoint, Psk,
    Radius, RadarMode, RegDomain, Ssid, StaLinkStatus, StaNetwork, VifStatus, VifType, Wpa,
    WpsCred,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObservedTree {
    pub phys: BTreeMap<String, PhyInfo>,
}

impl ObservedTree {
    pub fn phy(&self, name: &str) -> Option<&PhyInfo> {
        self.phys.get(name)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhyInfo {
    pub state: PhyState,
    pub vifs: BTreeMap<String, VifState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhyState {
    pub exists: bool,
    pub enabled: bool,
    pub tx_chainmask: u32,
    pub radar: RadarMode,
    pub reg_domain: RegDomain,
    pub channel_states: Vec<ChannelState>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VifState {
    pub status: VifStatus,
    pub vif_type: VifType,
    pub tx_power_dbm: i32,
    pub kind: VifStateKind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub enum VifStateKind {
    #[default]
    Undefined,
    Ap(Box<ApState>),
    ApVlan,
    Sta(StaState),
}

impl VifState {
    pub fn ap(&self) -> Option<&ApState> {
        match &self.kind {
            VifStateKind::Ap(ap) => Some(ap),
            _ => None,
        }
    }

    pub fn sta(&self) -> Option<&StaState> {
        match &self.kind {
            VifStateKind::Sta(sta) => Some(sta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApState {
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
    pub acl: Vec<HwAddr>,
    pub psk_list: Vec<Psk>,
    pub neigh_list: Vec<Neigh>,
    pub wps_cred_list: Vec<WpsCred>,
    pub radius_list: Vec<Radius>,
    pub acct_list: Vec<Radius>,
    pub passpoint: Passpoint,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaState {
    pub link: StaLink,
    pub networks: Vec<StaNetwork>,
}

/// The station's active (or pending) association.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaLink {
    pub status: StaLinkStatus,
    pub bssid: HwAddr,
    pub ssid: Ssid,
    pub wpa: Wpa,
    pub multi_ap: bool,
    pub bridge_if_name: String,
}
