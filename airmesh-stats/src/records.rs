//! Report record shapes. Collection stamps monotonic time; the publisher
//! converts to wall clock when a report is drained.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadioType {
    #[default]
    Unspec,
    Band2G,
    Band5G,
    Band5GL,
    Band5GU,
    Band6G,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanType {
    #[default]
    Unspec,
    OnChan,
    OffChan,
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatsType {
    #[default]
    Unspec,
    Survey,
    Neighbor,
    Client,
    Device,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SurveyRecord {
    pub timestamp_ms: u64,
    pub channel: u32,
    pub duration_ms: u32,
    pub busy_percent: u32,
    pub busy_tx_percent: u32,
    pub busy_rx_percent: u32,
    pub busy_self_percent: u32,
    pub noise_floor_dbm: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NeighborRecord {
    pub timestamp_ms: u64,
    pub bssid: String,
    pub ssid: String,
    pub channel: u32,
    pub rssi_dbm: i32,
    pub width_mhz: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    pub timestamp_ms: u64,
    pub mac: String,
    pub ssid: String,
    pub snr_db: u32,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    pub num_connects: u32,
    pub num_disconnects: u32,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThermalRecord {
    pub timestamp_ms: u64,
    /// (radio type, tx chainmask) pairs observed at sample time.
    pub radio_txchainmasks: Vec<(RadioType, u32)>,
    pub fan_rpm: i32,
    pub fan_duty_cycle: i32,
    pub thermal_state: i32,
    pub target_rpm: i32,
}

/// One drained report, ready for publishing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub report_type: String,
    pub entry_id: String,
    pub radio_type: RadioType,
    pub scan_type: ScanType,
    pub stats_type: StatsType,
    /// Wall-clock stamp applied at publish time.
    pub timestamp_ms: u64,
    pub surveys: Vec<SurveyRecord>,
    pub neighbors: Vec<NeighborRecord>,
    pub clients: Vec<ClientRecord>,
    pub thermal: Vec<ThermalRecord>,
}
