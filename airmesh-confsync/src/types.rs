//! Shared wireless data types for the desired and observed trees.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HwAddr(pub [u8; 6]);

impl HwAddr {
    pub const ZERO: HwAddr = HwAddr([0; 6]);

    pub fn is_zero(&self) -> bool {
        self.0 == [0; 6]
    }
}

impl fmt::Display for HwAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ssid(pub Vec<u8>);

impl Ssid {
    pub fn from_str(s: &str) -> Self {
        Ssid(s.as_bytes().to_vec())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Operating channel. Struct equality is the comparison unit: any change
/// to width or center is a channel change.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub control_freq_mhz: u32,
    pub center_freq0_mhz: u32,
    pub width_mhz: u32,
}

impl Channel {
    /// Does this channel's span cover the given 20MHz segment?
    pub fn covers_segment(&self, segment_freq_mhz: u32) -> bool {
        if self.control_freq_mhz == 0 {
            return false;
        }
        if self.center_freq0_mhz == 0 || self.width_mhz == 0 {
            return self.control_freq_mhz == segment_freq_mhz;
        }
        let half = self.width_mhz / 2;
        let lo = self.center_freq0_mhz.saturating_sub(half);
        let hi = self.center_freq0_mhz + half;
        (lo..hi).contains(&segment_freq_mhz) || segment_freq_mhz == self.control_freq_mhz
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DfsState {
    NonDfs,
    CacPossible,
    CacInProgress,
    CacCompleted,
    Nol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub channel: Channel,
    pub dfs: DfsState,
}

/// Does the configured channel intersect any segment in the given DFS
/// state?
pub fn channel_intersects_state(states: &[ChannelState], c: &Channel, dfs: DfsState) -> bool {
    states
        .iter()
        .any(|cs| cs.dfs == dfs && c.covers_segment(cs.channel.control_freq_mhz))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadarMode {
    #[default]
    Unsupported,
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegDomain {
    pub country: [u8; 2],
    pub revision: i32,
}

/// Crypto settings. `group_rekey_seconds` is excluded from comparisons
/// because drivers may not echo it back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wpa {
    pub wpa: bool,
    pub rsn: bool,
    pub pairwise_ccmp: bool,
    pub pairwise_tkip: bool,
    pub akm_psk: bool,
    pub akm_sae: bool,
    pub pmf: bool,
    pub group_rekey_seconds: u32,
}

impl Wpa {
    pub fn eq_ignoring_rekey(&self, other: &Wpa) -> bool {
        let mut a = *self;
        let mut b = *other;
        a.group_rekey_seconds = 0;
        b.group_rekey_seconds = 0;
        a == b
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeaconRate {
    #[default]
    Unspec,
    Abg(u16),
    Ht(u8),
    Vht(u8),
    He(u8),
}

pub const RATE_UNSPEC: u16 = 0;

/// Operating mode and rate sets of an AP.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApMode {
    pub wnm_bss_trans: bool,
    pub rrm_neighbor_report: bool,
    pub wmm_enabled: bool,
    pub wmm_uapsd_enabled: bool,
    pub ht_enabled: bool,
    pub ht_required: bool,
    pub vht_enabled: bool,
    pub vht_required: bool,
    pub he_enabled: bool,
    pub supported_rates: u16,
    pub basic_rates: u16,
    pub beacon_rate: BeaconRate,
    pub mcast_rate: u16,
    pub mgmt_rate: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Psk {
    pub key_id: i32,
    pub psk: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Neigh {
    pub bssid: HwAddr,
    pub bssid_info: u32,
    pub op_class: u8,
    pub channel: u8,
    pub phy_type: u8,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WpsCred {
    pub psk: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Radius {
    pub server: String,
    pub passphrase: String,
    pub port: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passpoint {
    pub hessid: Ssid,
    pub hs20_enabled: bool,
    pub adv_wan_status: bool,
    pub adv_wan_symmetric: bool,
    pub adv_wan_at_capacity: bool,
    pub osen: bool,
    pub asra: bool,
    pub ant: i32,
    pub venue_group: i32,
    pub venue_type: i32,
    pub anqp_domain_id: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AclPolicy {
    #[default]
    None,
    AllowList,
    DenyList,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultiAp {
    pub fronthaul_bss: bool,
    pub backhaul_bss: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MbssMode {
    #[default]
    None,
    Transmitting,
    NonTransmitting,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VifType {
    #[default]
    Undefined,
    Ap,
    ApVlan,
    Sta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VifStatus {
    #[default]
    Unknown,
    Enabled,
    Disabled,
    Broken,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StaLinkStatus {
    #[default]
    Unknown,
    Connected,
    Connecting,
    Disconnected,
}

/// A station-side network candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaNetwork {
    pub bssid: HwAddr,
    pub ssid: Ssid,
    pub psk: String,
    pub wpa: Wpa,
    pub multi_ap: bool,
    pub bridge_if_name: String,
}

impl StaNetwork {
    /// Identity compare used for the network-list symmetric difference;
    /// rekey timing is driver detail, not identity.
    pub fn is_identical(&self, other: &StaNetwork) -> bool {
        self.bssid == other.bssid
            && self.ssid == other.ssid
            && self.psk == other.psk
            && self.wpa.eq_ignoring_rekey(&other.wpa)
            && self.multi_ap == other.multi_ap
            && self.bridge_if_name == other.bridge_if_name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_covers_its_own_control_freq() {
        let c = Channel {
            control_freq_mhz: 5260,
            center_freq0_mhz: 5290,
            width_mhz: 80,
        };
        assert!(c.covers_segment(5260));
        assert!(c.covers_segment(5300));
        assert!(!c.covers_segment(5500));
    }

    #[test]
    fn wpa_compare_ignores_rekey() {
        let a = Wpa {
            rsn: true,
            pairwise_ccmp: true,
            akm_psk: true,
            group_rekey_seconds: 3600,
            ..Default::default()
        };
        let mut b = a;
        b.group_rekey_seconds = 0;
        assert!(a.eq_ignoring_rekey(&b));
        b.akm_sae = true;
        assert!(!a.eq_ignoring_rekey(&b));
    }
}
