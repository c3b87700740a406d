use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Schema constants. Names are preserved for wire compatibility with
/// upstream deployments.
pub const VIF_MODE_STA: &str = "sta";
pub const PORT_STATE_ACTIVE: &str = "active";
pub const IP_SCHEME_DHCP: &str = "dhcp";
pub const IP_SCHEME_NONE: &str = "none";
pub const IF_TYPE_VIF: &str = "vif";
pub const IF_TYPE_GRE: &str = "gre";

/// A table row. Keys rows by interface name; every table here is keyed the
/// same way.
pub trait Row: Clone + PartialEq {
    fn key(&self) -> &str;
}

macro_rules! impl_row {
    ($ty:ty) => {
        impl Row for $ty {
            fn key(&self) -> &str {
                &self.if_name
            }
        }
    };
}

/// Wifi_VIF_State: driver-reported VIF state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiVifState {
    pub if_name: String,
    pub mode: Option<String>,
    pub wds: Option<bool>,
    pub mld_if_name: Option<String>,
}

/// Wifi_Master_State: port-level interface state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiMasterState {
    pub if_name: String,
    pub port_state: Option<String>,
    pub inet_addr: Option<Ipv4Addr>,
}

/// Wifi_Inet_State: L3 interface state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiInetState {
    pub if_name: String,
    pub enabled: Option<bool>,
    pub network: Option<bool>,
    pub ip_assign_scheme: Option<String>,
    pub inet_addr: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub gre_ifname: Option<String>,
    pub gre_local_inet_addr: Option<Ipv4Addr>,
    pub gre_remote_inet_addr: Option<Ipv4Addr>,
}

/// Wifi_Inet_Config: L3 interface configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WifiInetConfig {
    pub if_name: String,
    pub enabled: Option<bool>,
    pub network: Option<bool>,
    pub mtu: Option<u32>,
    pub ip_assign_scheme: Option<String>,
    pub if_type: Option<String>,
    pub gre_ifname: Option<String>,
    pub gre_local_inet_addr: Option<Ipv4Addr>,
    pub gre_remote_inet_addr: Option<Ipv4Addr>,
    pub dhcp_renew: Option<u32>,
}

/// Connection_Manager_Uplink: candidate uplink row with L2/L3 readiness.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionManagerUplink {
    pub if_name: String,
    pub if_type: Option<String>,
    pub has_l2: Option<bool>,
    pub has_l3: Option<bool>,
}

impl_row!(WifiVifState);
impl_row!(WifiMasterState);
impl_row!(WifiInetState);
impl_row!(WifiInetConfig);
impl_row!(ConnectionManagerUplink);
