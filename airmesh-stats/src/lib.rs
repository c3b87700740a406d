//! Wireless stats scheduler.
//!
//! A keyed registry of sampling entries, each describing what to collect
//! (survey / neighbor / client / device), where (radio band, channel list,
//! on/off channel) and how often (sample and report intervals, report
//! limit). Samples stream in from the raw stats source, get filtered per
//! entry, and are drained into reports on a fixed cadence. Off-channel
//! scans are gated by channel utilization with a bounded holdoff.

pub mod conf;
pub mod entry;
pub mod records;
pub mod sink;

pub use conf::{freq_to_chan, ScanDecision, StatsConf};
pub use entry::EntryParams;
pub use records::{
    ClientRecord, NeighborRecord, RadioType, Report, ScanType, StatsType, SurveyRecord,
    ThermalRecord,
};
pub use sink::{publish_pending, MemorySink, ReportSink, SinkError, UnixSink};
