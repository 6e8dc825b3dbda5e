use crate::evidence::{CrashEvidence, EvidenceCollector};
use crate::transport::Channel;
use std::io;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectorError {
    /// The target is down, but its evidence archive could not be written.
    #[error("Target crashed ({description}) but its evidence was not saved: {source}")]
    Evidence {
        description: String,
        #[source]
        source: io::Error,
    },
}

/// What a detector concluded about the target after one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashVerdict {
    Alive,
    Crashed(CrashEvidence),
}

impl CrashVerdict {
    pub fn is_crashed(&self) -> bool {
        matches!(self, CrashVerdict::Crashed(_))
    }
}

/// Decides whether the target survived a delivery.
///
/// `is_alive` is supplied by the caller and is the only way a detector learns
/// about the target's state; `channel` is only read for crash evidence.
pub trait CrashDetector: Send {
    fn name(&self) -> &'static str;

    fn is_crashed(
        &mut self,
        channel: &dyn Channel,
        is_alive: &mut dyn FnMut() -> bool,
    ) -> Result<CrashVerdict, DetectorError>;
}

fn package(
    collector: &EvidenceCollector,
    channel: &dyn Channel,
    description: String,
) -> Result<CrashVerdict, DetectorError> {
    log::warn!("{description}");
    match collector.collect(&description, channel.evidence_entries()) {
        Ok(evidence) => Ok(CrashVerdict::Crashed(evidence)),
        Err(source) => Err(DetectorError::Evidence {
            description,
            source,
        }),
    }
}

/// Probes the target right after delivery, retrying a few times before giving up.
#[derive(Debug, Clone)]
pub struct KeepAliveDetector {
    retries: u32,
    retry_delay: Duration,
    collector: EvidenceCollector,
}

impl KeepAliveDetector {
    pub fn new(retries: u32, retry_delay: Duration, collector: EvidenceCollector) -> Self {
        Self {
            retries,
            retry_delay,
            collector,
        }
    }
}

impl CrashDetector for KeepAliveDetector {
    fn name(&self) -> &'static str {
        "KeepAliveDetector"
    }

    fn is_crashed(
        &mut self,
        channel: &dyn Channel,
        is_alive: &mut dyn FnMut() -> bool,
    ) -> Result<CrashVerdict, DetectorError> {
        for attempt in 0..=self.retries {
            if is_alive() {
                return Ok(CrashVerdict::Alive);
            }
            if attempt < self.retries {
                log::debug!(
                    "{} did not answer probe {}/{}",
                    channel.peer(),
                    attempt + 1,
                    self.retries + 1
                );
                thread::sleep(self.retry_delay);
            }
        }
        package(
            &self.collector,
            channel,
            format!(
                "{} unresponsive after {} probes",
                channel.peer(),
                self.retries + 1
            ),
        )
    }
}

/// Keeps probing the target for a whole observation window and reports a crash
/// on the first failed probe. Catches targets that die some time after the input
/// was consumed.
#[derive(Debug, Clone)]
pub struct PollingDetector {
    window: Duration,
    interval: Duration,
    collector: EvidenceCollector,
}

impl PollingDetector {
    pub fn new(window: Duration, interval: Duration, collector: EvidenceCollector) -> Self {
        Self {
            window,
            interval,
            collector,
        }
    }
}

impl CrashDetector for PollingDetector {
    fn name(&self) -> &'static str {
        "PollingDetector"
    }

    fn is_crashed(
        &mut self,
        channel: &dyn Channel,
        is_alive: &mut dyn FnMut() -> bool,
    ) -> Result<CrashVerdict, DetectorError> {
        let started = Instant::now();
        let mut probes = 0u32;
        loop {
            probes += 1;
            if !is_alive() {
                return package(
                    &self.collector,
                    channel,
                    format!(
                        "{} went down {:?} into observation (probe {probes})",
                        channel.peer(),
                        started.elapsed()
                    ),
                );
            }
            if started.elapsed() >= self.window {
                return Ok(CrashVerdict::Alive);
            }
            thread::sleep(self.interval);
        }
    }
}
