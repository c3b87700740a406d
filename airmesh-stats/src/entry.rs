//! Per-entry parameters and lifecycle.

use tracing::{debug, info};

use crate::records::{ClientRecord, NeighborRecord, StatsType, SurveyRecord, ThermalRecord};
use crate::records::{RadioType, ScanType};

pub const MAX_UNDERRUN: u32 = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EntryParams {
    pub channels: Vec<u32>,
    pub radio_type: RadioType,
    pub scan_type: ScanType,
    pub stats_type: StatsType,
    pub sample_seconds: f64,
    pub report_seconds: f64,
    pub report_limit: u32,
    pub holdoff_busy_threshold: u32,
    pub holdoff_delay_seconds: u32,
    pub dwell_time_msec: u32,
    pub valid: bool,
}

impl EntryParams {
    pub fn changed(&self, other: &EntryParams) -> bool {
        self != other
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessOp {
    Nop,
    Stop,
    Free,
    Start,
}

#[derive(Debug)]
pub struct Entry {
    pub(crate) id: String,
    pub(crate) params: EntryParams,
    pub(crate) params_next: EntryParams,
    pub(crate) running: bool,
    pub(crate) scan_active: bool,
    pub(crate) report_counter: u32,
    pub(crate) underrun: u32,
    pub(crate) last_util: u32,
    pub(crate) scan_delayed_until: f64,
    pub(crate) device_poll_at: f64,
    pub(crate) report_at: f64,
    pub(crate) last_sub_reported_at: f64,
    pub(crate) surveys: Vec<SurveyRecord>,
    pub(crate) neighbors: Vec<NeighborRecord>,
    pub(crate) clients: Vec<ClientRecord>,
    pub(crate) thermal: Vec<ThermalRecord>,
}

impl Entry {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            params: EntryParams::default(),
            params_next: EntryParams::default(),
            running: false,
            scan_active: false,
            report_counter: 0,
            underrun: 0,
            last_util: 0,
            scan_delayed_until: 0.0,
            device_poll_at: 0.0,
            report_at: 0.0,
            last_sub_reported_at: 0.0,
            surveys: Vec::new(),
            neighbors: Vec::new(),
            clients: Vec::new(),
            thermal: Vec::new(),
        }
    }

    /// Minimum record count a report is worth emitting with. Surveys are
    /// appended per sample so their count is known; the keyed types only
    /// need one bucket.
    pub(crate) fn desired_count(&self) -> usize {
        match self.params.stats_type {
            StatsType::Unspec => 0,
            StatsType::Survey => {
                if self.params.sample_seconds > 0.0 {
                    (self.params.report_seconds / self.params.sample_seconds) as usize
                } else {
                    0
                }
            }
            StatsType::Client | StatsType::Device | StatsType::Neighbor => 1,
        }
    }

    /// Poll/report cadence for the raw stats subscription.
    pub(crate) fn sub_timings(&self) -> (f64, f64) {
        let (mut poll, report) = match self.params.stats_type {
            // Survey samples are appended on a list, not aggregated into
            // keyed buckets, so they report at sampling cadence.
            StatsType::Survey => (self.params.sample_seconds, self.params.sample_seconds),
            StatsType::Client | StatsType::Neighbor | StatsType::Device => {
                (self.params.sample_seconds, self.params.report_seconds)
            }
            StatsType::Unspec => (0.0, 0.0),
        };
        if poll == 0.0 {
            poll = report;
        }
        (poll, report)
    }

    pub(crate) fn record_count(&self) -> usize {
        self.surveys.len() + self.neighbors.len() + self.clients.len() + self.thermal.len()
    }

    /// Decide what to do about a parameter delta. Mirrors the settle-first
    /// decision table: unchanged running entries are left alone, invalid
    /// next-params free the entry, exhausted report limits stop it.
    pub(crate) fn process_op(&mut self) -> ProcessOp {
        let changed = self.params.changed(&self.params_next);
        self.params = self.params_next.clone();

        let limit_reached =
            self.params.report_limit != 0 && self.report_counter >= self.params.report_limit;

        let processed = !changed && !limit_reached && self.params.valid;
        if processed {
            return ProcessOp::Nop;
        }
        if !self.params_next.valid {
            return ProcessOp::Free;
        }
        if self.params.radio_type == RadioType::Unspec {
            debug!(entry = %self.id, "stats: radio type unspecified");
            return ProcessOp::Stop;
        }
        if limit_reached {
            if !self.running {
                return ProcessOp::Nop;
            }
            return ProcessOp::Stop;
        }
        match self.params.stats_type {
            StatsType::Unspec => ProcessOp::Stop,
            _ => ProcessOp::Start,
        }
    }

    pub(crate) fn start(&mut self, now: f64) {
        let (poll, report) = self.sub_timings();
        info!(
            entry = %self.id,
            stats_type = ?self.params.stats_type,
            radio = ?self.params.radio_type,
            scan = ?self.params.scan_type,
            "stats: entry starting"
        );
        self.running = true;
        match self.params.stats_type {
            StatsType::Device => {
                if poll > 0.0 {
                    self.device_poll_at = ((now / poll).floor() + 1.0) * poll;
                }
                if report > 0.0 && self.params.report_seconds > 0.0 {
                    self.report_at =
                        ((now / self.params.report_seconds).floor() + 1.0) * self.params.report_seconds;
                }
            }
            _ => {
                self.scan_active = self.params.scan_type == ScanType::OffChan && poll > 0.0;
                if self.scan_active {
                    self.last_util = 0;
                    self.scan_delayed_until = 0.0;
                }
                if self.params.report_seconds > 0.0 {
                    self.report_at =
                        ((now / self.params.report_seconds).floor() + 1.0) * self.params.report_seconds;
                }
            }
        }
    }

    pub(crate) fn stop(&mut self) {
        if self.running {
            info!(entry = %self.id, "stats: entry stopping");
        }
        self.running = false;
        self.scan_active = false;
        self.report_at = 0.0;
        self.device_poll_at = 0.0;
        self.surveys.clear();
        self.neighbors.clear();
        self.clients.clear();
        self.thermal.clear();
    }

    /// Is the entry ready to report, or should the tick be nudged? The raw
    /// stats subscription and the report timer are not ordered against
    /// each other, so a report tick can land just before the data does.
    pub(crate) fn is_ready(&mut self, now: f64) -> bool {
        let age_seconds = now - self.last_sub_reported_at;
        let sample_seconds = if self.params.sample_seconds > 0.0 {
            self.params.sample_seconds
        } else {
            self.params.report_seconds
        };
        let max_age_seconds = sample_seconds * 2.0;
        let desired = self.desired_count();
        let actual = self.record_count();
        let offset = (sample_seconds - age_seconds).abs();
        let postpone = actual < desired && offset < (age_seconds / 4.0);
        let underrun = age_seconds > max_age_seconds;

        if postpone {
            debug!(entry = %self.id, age_seconds, offset, "stats: postponing report");
            self.report_at += offset;
            return false;
        }
        if underrun {
            self.underrun += 1;
            if self.underrun < MAX_UNDERRUN {
                self.report_at += 0.010;
                return false;
            }
            debug!(entry = %self.id, "stats: report underrun");
        }
        true
    }
}
