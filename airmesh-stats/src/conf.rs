//! The stats scheduler: a keyed registry of sampling entries.

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, info, warn};

use crate::entry::{Entry, EntryParams, ProcessOp};
use crate::records::{
    ClientRecord, NeighborRecord, RadioType, Report, ScanType, StatsType, SurveyRecord,
    ThermalRecord,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanDecision {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy)]
struct BandInfo {
    radio_type: RadioType,
    tx_chainmask: u32,
}

pub fn freq_to_chan(freq_mhz: u32) -> u32 {
    match freq_mhz {
        2412..=2472 => (freq_mhz - 2407) / 5,
        2484 => 14,
        5000..=5925 => (freq_mhz - 5000) / 5,
        5955..=7115 => (freq_mhz - 5950) / 5,
        _ => 0,
    }
}

#[derive(Default)]
pub struct StatsConf {
    entries: BTreeMap<String, Entry>,
    bands: BTreeMap<String, BandInfo>,
    oper_freq: BTreeMap<String, u32>,
    queue: VecDeque<Report>,
    sent: u32,
}

impl StatsConf {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage new parameters for an entry; the next run adopts them.
    pub fn configure(&mut self, id: &str, mut params: EntryParams) {
        params.valid = true;
        let entry = self
            .entries
            .entry(id.to_string())
            .or_insert_with(|| Entry::new(id));
        entry.params_next = params;
    }

    /// Mark an entry for removal on the next run.
    pub fn invalidate(&mut self, id: &str) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.params_next = EntryParams::default();
        }
    }

    pub fn has_entry(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.entries.get(id).map(|e| e.running).unwrap_or(false)
    }

    /// Phy -> band binding from observed phy state. `Unspec` removes the
    /// band (phy disappeared or lost its radio assignment).
    pub fn set_band(&mut self, phy_name: &str, radio_type: RadioType, tx_chainmask: u32) {
        if radio_type == RadioType::Unspec {
            self.bands.remove(phy_name);
            return;
        }
        self.bands.insert(
            phy_name.to_string(),
            BandInfo {
                radio_type,
                tx_chainmask,
            },
        );
    }

    pub fn set_oper_freq(&mut self, phy_name: &str, freq_mhz: u32) {
        if freq_mhz == 0 {
            self.oper_freq.remove(phy_name);
        } else {
            self.oper_freq.insert(phy_name.to_string(), freq_mhz);
        }
    }

    fn radio_type_of(&self, phy_name: &str) -> RadioType {
        self.bands
            .get(phy_name)
            .map(|b| b.radio_type)
            .unwrap_or(RadioType::Unspec)
    }

    fn entry_accepts(&self, entry: &Entry, phy_name: &str, freq_mhz: u32) -> bool {
        if !entry.running {
            return false;
        }
        if self.radio_type_of(phy_name) != entry.params.radio_type {
            return false;
        }
        let oper = self.oper_freq.get(phy_name).copied();
        let freq_ok = match entry.params.scan_type {
            ScanType::Full => true,
            ScanType::OnChan => oper == Some(freq_mhz),
            ScanType::OffChan => oper != Some(freq_mhz),
            ScanType::Unspec => false,
        };
        if !freq_ok {
            return false;
        }
        let chan = freq_to_chan(freq_mhz);
        entry.params.channels.is_empty() || entry.params.channels.contains(&chan)
    }

    /// Sample ingestion from the raw stats source. Every matching entry
    /// gets its own copy of the record.
    pub fn push_survey(&mut self, phy_name: &str, freq_mhz: u32, now: f64, rec: SurveyRecord) {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.params.stats_type == StatsType::Survey)
            .filter(|e| self.entry_accepts(e, phy_name, freq_mhz))
            .map(|e| e.id.clone())
            .collect();
        for id in ids {
            if let Some(e) = self.entries.get_mut(&id) {
                e.surveys.push(rec);
                e.last_sub_reported_at = now;
            }
        }
    }

    pub fn push_neighbor(&mut self, phy_name: &str, freq_mhz: u32, now: f64, rec: NeighborRecord) {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.params.stats_type == StatsType::Neighbor)
            .filter(|e| self.entry_accepts(e, phy_name, freq_mhz))
            .map(|e| e.id.clone())
            .collect();
        for id in ids {
            if let Some(e) = self.entries.get_mut(&id) {
                e.neighbors.push(rec.clone());
                e.last_sub_reported_at = now;
            }
        }
    }

    pub fn push_client(&mut self, phy_name: &str, freq_mhz: u32, now: f64, rec: ClientRecord) {
        let ids: Vec<String> = self
            .entries
            .values()
            .filter(|e| e.params.stats_type == StatsType::Client)
            .filter(|e| self.entry_accepts(e, phy_name, freq_mhz))
            .map(|e| e.id.clone())
            .collect();
        for id in ids {
            if let Some(e) = self.entries.get_mut(&id) {
                e.clients.push(rec.clone());
                e.last_sub_reported_at = now;
            }
        }
    }

    /// Channel-utilization feedback for the off-channel scan holdoff.
    pub fn report_util(&mut self, id: &str, util_percent: u32) {
        if let Some(e) = self.entries.get_mut(id) {
            debug!(entry = %id, util_percent, "stats: util");
            e.last_util = util_percent;
        }
    }

    /// Gate an off-channel scan against observed utilization: a busy
    /// channel defers scans up to the holdoff delay, after which the scan
    /// goes ahead regardless.
    pub fn scan_filter(&mut self, id: &str, now: f64) -> ScanDecision {
        let e = match self.entries.get_mut(id) {
            Some(e) => e,
            None => return ScanDecision::Allow,
        };
        let threshold = e.params.holdoff_busy_threshold;
        let not_configured = threshold == 0;
        let can_scan = e.last_util < threshold;
        let needs_delay = !not_configured && !can_scan;

        if needs_delay {
            let first_deny = e.scan_delayed_until == 0.0;
            let expired = e.scan_delayed_until <= now;
            if first_deny {
                e.scan_delayed_until = now + e.params.holdoff_delay_seconds as f64;
                info!(entry = %id, "stats: scan: starting delay");
                ScanDecision::Deny
            } else if expired {
                e.scan_delayed_until = 0.0;
                info!(entry = %id, "stats: scan: forcing delayed scan due to timeout");
                ScanDecision::Allow
            } else {
                debug!(entry = %id, "stats: scan: continuing delay");
                ScanDecision::Deny
            }
        } else {
            if e.scan_delayed_until != 0.0 {
                e.scan_delayed_until = 0.0;
                info!(entry = %id, "stats: scan: resetting delay");
            }
            ScanDecision::Allow
        }
    }

    fn device_sample(entry: &mut Entry, bands: &BTreeMap<String, BandInfo>, now: f64, now_real_ms: u64) {
        let (poll, _) = entry.sub_timings();
        if poll <= 0.0 || entry.device_poll_at <= 0.0 || now < entry.device_poll_at {
            return;
        }
        while entry.device_poll_at <= now {
            entry.device_poll_at += poll;
        }
        let rec = ThermalRecord {
            timestamp_ms: now_real_ms,
            radio_txchainmasks: bands
                .values()
                .map(|b| (b.radio_type, b.tx_chainmask))
                .collect(),
            fan_rpm: -1,
            fan_duty_cycle: -1,
            thermal_state: -1,
            target_rpm: -1,
        };
        debug!(entry = %entry.id, "stats: device sample");
        entry.thermal.push(rec);
        entry.last_sub_reported_at = now;
    }

    fn entry_report(entry: &mut Entry, queue: &mut VecDeque<Report>, now: f64, now_real_ms: u64) {
        if entry.report_at <= 0.0 || entry.report_at > now {
            return;
        }
        if !entry.is_ready(now) {
            return;
        }

        let mut report = Report {
            report_type: "raw".to_string(),
            entry_id: entry.id.clone(),
            radio_type: entry.params.radio_type,
            scan_type: entry.params.scan_type,
            stats_type: entry.params.stats_type,
            timestamp_ms: now_real_ms,
            ..Default::default()
        };
        match entry.params.stats_type {
            StatsType::Survey => report.surveys = std::mem::take(&mut entry.surveys),
            StatsType::Neighbor => report.neighbors = std::mem::take(&mut entry.neighbors),
            StatsType::Client => report.clients = std::mem::take(&mut entry.clients),
            StatsType::Device => report.thermal = std::mem::take(&mut entry.thermal),
            StatsType::Unspec => return,
        }
        queue.push_back(report);

        if entry.params.report_limit != 0 && entry.report_counter < entry.params.report_limit {
            entry.report_counter += 1;
        }
        if entry.params.report_seconds > 0.0 {
            entry.report_at =
                ((now / entry.params.report_seconds).floor() + 1.0) * entry.params.report_seconds;
        } else {
            warn!(entry = %entry.id, "stats: report interval unset");
            entry.report_at = 0.0;
        }
        entry.underrun = 0;
    }

    /// One scheduler tick: adopt parameter changes, take due device
    /// samples, emit due reports.
    pub fn run(&mut self, now_mono: f64, now_real_ms: u64) {
        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            let op = match self.entries.get_mut(&id) {
                Some(e) => {
                    // Device polling happens regardless of what the
                    // parameter delta decides, even for entries about to
                    // be freed.
                    if e.params.stats_type == StatsType::Device {
                        Self::device_sample(e, &self.bands, now_mono, now_real_ms);
                    }
                    e.process_op()
                }
                None => continue,
            };
            match op {
                ProcessOp::Nop => (),
                ProcessOp::Stop => {
                    if let Some(e) = self.entries.get_mut(&id) {
                        e.stop();
                    }
                }
                ProcessOp::Free => {
                    if let Some(mut e) = self.entries.remove(&id) {
                        e.stop();
                        info!(entry = %id, "stats: entry freed");
                    }
                }
                ProcessOp::Start => {
                    if let Some(e) = self.entries.get_mut(&id) {
                        e.stop();
                        e.start(now_mono);
                    }
                }
            }
        }

        let ids: Vec<String> = self.entries.keys().cloned().collect();
        for id in ids {
            if let Some(e) = self.entries.get_mut(&id) {
                Self::entry_report(e, &mut self.queue, now_mono, now_real_ms);
            }
        }
    }

    pub fn pending_reports(&self) -> usize {
        self.queue.len()
    }

    pub fn drain_reports(&mut self) -> Vec<Report> {
        let drained: Vec<Report> = self.queue.drain(..).collect();
        self.sent += drained.len() as u32;
        drained
    }

    pub fn reports_sent(&self) -> u32 {
        self.sent
    }

    /// Next time the scheduler needs to run; 0 means "right away"
    /// (parameter deltas pending).
    pub fn next_at(&self) -> Option<f64> {
        let mut at: Option<f64> = None;
        for e in self.entries.values() {
            if e.params.changed(&e.params_next) {
                return Some(0.0);
            }
            for t in [e.report_at, e.device_poll_at] {
                if t > 0.0 {
                    at = Some(match at {
                        Some(v) => v.min(t),
                        None => t,
                    });
                }
            }
        }
        at
    }
}
