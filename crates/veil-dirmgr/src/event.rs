//! Events this crate reports to the control surface.
//!
//! The control-port encoder is an external collaborator; we hand it
//! typed events and let it worry about the wire format.

use crate::docs::{Flavor, IdDigest};

/// Severity of a status event.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Severity {
    /// Informational.
    Notice,
    /// Something the operator should look at.
    Warn,
}

/// An event emitted by the directory manager.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum DirEvent {
    /// A new consensus of some flavor has been installed.
    NewConsensus {
        /// Which flavor was installed.
        flavor: Flavor,
    },
    /// Some router-status entries changed relative to the previous
    /// consensus.
    NetworkStatusChanged {
        /// Identities of the entries that were added or changed.
        changed: Vec<IdDigest>,
    },
    /// A general status message (`CLOCK_SKEW`, `DANGEROUS_VERSION`, ...).
    GeneralStatus {
        /// How loudly to report it.
        severity: Severity,
        /// The status line, already formatted.
        message: String,
    },
    /// A client status message (`CONSENSUS_ARRIVED`, ...).
    ClientStatus {
        /// How loudly to report it.
        severity: Severity,
        /// The status line, already formatted.
        message: String,
    },
}

/// A sink for [`DirEvent`]s, implemented by the host's control-event
/// emitter.
pub trait EventSink {
    /// Deliver one event.
    fn emit(&mut self, event: DirEvent);
}

/// Format a `CLOCK_SKEW` general-status message.
pub(crate) fn clock_skew_message(skew_secs: i64, source: &str) -> String {
    format!("CLOCK_SKEW SKEW={} SOURCE={}", skew_secs, source)
}

/// Return how many seconds `doc_time` is ahead of `now` (negative if
/// behind).
pub(crate) fn skew_seconds(doc_time: std::time::SystemTime, now: std::time::SystemTime) -> i64 {
    match doc_time.duration_since(now) {
        Ok(d) => i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
        Err(e) => -i64::try_from(e.duration().as_secs()).unwrap_or(i64::MAX),
    }
}

/// Format a `DANGEROUS_VERSION` general-status message.
pub(crate) fn dangerous_version_message(version: &str, reason: &str) -> String {
    format!(
        "DANGEROUS_VERSION CURRENT={} REASON={}",
        version, reason
    )
}
