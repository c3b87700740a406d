//! Report publishing: length-prefixed JSON blobs to an out-of-process
//! collector over a unix socket, or an in-memory sink for tests.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::conf::StatsConf;
use crate::records::Report;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("encode failed: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait ReportSink {
    fn publish(&mut self, report: &Report) -> Result<(), SinkError>;
}

/// Collects published reports in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub reports: Vec<Report>,
}

impl ReportSink for MemorySink {
    fn publish(&mut self, report: &Report) -> Result<(), SinkError> {
        self.reports.push(report.clone());
        Ok(())
    }
}

/// Streams reports to a unix-socket collector as u32-length-prefixed JSON
/// frames.
pub struct UnixSink {
    stream: UnixStream,
}

impl UnixSink {
    pub fn connect(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let stream = UnixStream::connect(path)?;
        Ok(Self { stream })
    }
}

impl ReportSink for UnixSink {
    fn publish(&mut self, report: &Report) -> Result<(), SinkError> {
        let blob = serde_json::to_vec(report)?;
        self.stream.write_all(&(blob.len() as u32).to_be_bytes())?;
        self.stream.write_all(&blob)?;
        Ok(())
    }
}

/// Drain the scheduler's queue into a sink. A failed publish re-queues
/// nothing; the next reporting round regenerates fresher data anyway.
pub fn publish_pending(conf: &mut StatsConf, sink: &mut dyn ReportSink) -> usize {
    let reports = conf.drain_reports();
    let mut published = 0;
    for report in &reports {
        match sink.publish(report) {
            Ok(()) => published += 1,
            Err(e) => {
                info!(error = %e, "stats: publish failed, dropping report");
            }
        }
    }
    if published > 0 {
        debug!(published, "stats: reports published");
    }
    published
}
