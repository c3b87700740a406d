//! Driver reconfiguration plan: full values plus per-field change masks.
//! The driver may consume either the masks or the whole struct.

use crate::types::{
    AclPolicy, ApMode, Channel, HwAddr, MbssMode, MultiAp, Neigh, Passpoint, Radius, RadarMode,
    RegDomain, Ssid, StaNetwork, VifType, Wpa, WpsCred,
};

#[derive(Debug, Clone, Default)]
pub struct DrvConf {
    pub phy_list: Vec<PhyConfig>,
}

impl DrvConf {
    pub fn any_changed(&self) -> bool {
        self.phy_list
            .iter()
            .any(|p| p.changed || p.vif_list.iter().any(|v| v.changed))
    }

    pub fn phy(&self, name: &str) -> Option<&PhyConfig> {
        self.phy_list.iter().find(|p| p.phy_name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct PhyConfig {
    pub phy_name: String,
    pub enabled: bool,
    pub tx_chainmask: u32,
    pub radar: RadarMode,
    pub reg_domain: RegDomain,

    pub changed: bool,
    pub enabled_changed: bool,
    pub tx_chainmask_changed: bool,
    pub radar_changed: bool,
    pub reg_domain_changed: bool,

    pub vif_list: Vec<VifConfig>,
}

impl PhyConfig {
    pub fn vif(&self, name: &str) -> Option<&VifConfig> {
        self.vif_list.iter().find(|v| v.vif_name == name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VifConfig {
    pub vif_name: String,
    pub enabled: bool,
    pub vif_type: VifType,
    pub tx_power_dbm: i32,

    pub changed: bool,
    pub enabled_changed: bool,
    pub vif_type_changed: bool,
    pub tx_power_dbm_changed: bool,

    pub kind: VifConfigKind,
}

#[derive(Debug, Clone, Default)]
pub enum VifConfigKind {
    #[default]
    Other,
    Ap(Box<ApConfig>),
    Sta(StaConfig),
}

impl VifConfig {
    pub fn ap(&self) -> Option<&ApConfig> {
        match &self.kind {
            VifConfigKind::Ap(ap) => Some(ap),
            _ => None,
        }
    }

    pub fn sta(&self) -> Option<&StaConfig> {
        match &self.kind {
            VifConfigKind::Sta(sta) => Some(sta),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApConfig {
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
    pub psk_list: Vec<crate::types::Psk>,
    pub neigh_list: Vec<Neigh>,
    pub wps_cred_list: Vec<WpsCred>,
    pub radius_list: Vec<Radius>,
    pub acct_list: Vec<Radius>,
    pub passpoint: Passpoint,

    pub ssid_changed: bool,
    pub channel_changed: bool,
    pub beacon_interval_tu_changed: bool,
    pub isolated_changed: bool,
    pub ssid_hidden_changed: bool,
    pub mcast2ucast_changed: bool,
    pub mode_changed: bool,
    pub wpa_changed: bool,
    pub wps_pbc_changed: bool,
    pub multi_ap_changed: bool,
    pub mbss_mode_changed: bool,
    pub mbss_group_changed: bool,
    pub bridge_if_name_changed: bool,
    pub nas_identifier_changed: bool,
    pub acl_policy_changed: bool,
    pub acl_changed: bool,
    pub psk_list_changed: bool,
    pub neigh_list_changed: bool,
    pub wps_cred_list_changed: bool,
    pub radius_list_changed: bool,
    pub acct_list_changed: bool,
    pub passpoint_changed: bool,

    /// The channel change can ride a CSA instead of a full reconfig.
    pub csa_required: bool,

    pub acl_add: Vec<HwAddr>,
    pub acl_del: Vec<HwAddr>,
    pub neigh_add_list: Vec<Neigh>,
    pub neigh_mod_list: Vec<Neigh>,
    pub neigh_del_list: Vec<Neigh>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StaOperation {
    #[default]
    Nop,
    Connect,
    Reconnect,
    Disconnect,
}

#[derive(Debug, Clone, Default)]
pub struct StaConfig {
    pub networks: Vec<StaNetwork>,
    pub network_changed: bool,
    pub operation: StaOperation,
}

/// The driver mux: single writer per reconcile round. Returns whether the
/// request was accepted; acceptance means state reports will eventually
/// follow through the observer path.
pub trait DriverMux {
    fn request_config(&mut self, conf: &DrvConf) -> bool;
}
