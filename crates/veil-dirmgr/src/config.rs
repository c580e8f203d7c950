//! Types for managing directory configuration.
//!
//! Directory configuration tells us where to keep directory state on
//! disk, which authorities to trust, which consensus flavor to use, and
//! how eagerly to fetch things.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::authority::{default_authorities, Authority};
use crate::docs::{Flavor, IdDigest};
use crate::retry::DownloadSchedule;
use crate::schedule::FetchRole;

/// A three-valued setting that can also be left for us to decide.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoBool {
    /// Let the implementation pick based on the rest of the
    /// configuration.
    Auto,
    /// Forced on.
    Yes,
    /// Forced off.
    No,
}

impl Default for AutoBool {
    fn default() -> Self {
        AutoBool::Auto
    }
}

/// Configuration for when we download directory documents, and how
/// often we retry.
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DownloadScheduleConfig {
    /// Retry configuration for consensus fetches.
    #[serde(default)]
    pub retry_consensus: DownloadSchedule,
    /// Retry configuration for microdescriptor fetches.
    #[serde(default = "default_microdesc_schedule")]
    pub retry_microdescs: DownloadSchedule,
}

/// Return the default download schedule for microdescriptors.
fn default_microdesc_schedule() -> DownloadSchedule {
    DownloadSchedule::new(8, Duration::from_millis(1000), 4)
}

impl Default for DownloadScheduleConfig {
    fn default() -> Self {
        DownloadScheduleConfig {
            retry_consensus: DownloadSchedule::default(),
            retry_microdescs: default_microdesc_schedule(),
        }
    }
}

/// Configuration type for the directory manager.
///
/// Unlike most of our configuration, this is a plain exhaustive struct:
/// it is assembled by the host from its own larger configuration, and
/// if it grows a field the host ought to stop compiling.
#[derive(Debug, Clone)]
#[allow(clippy::exhaustive_structs)]
pub struct DirMgrConfig {
    /// Location for storing and reading our on-disk directory state.
    pub data_dir: PathBuf,

    /// Rules for whether to trust the permissions on `data_dir`.
    pub mistrust: fs_mistrust::Mistrust,

    /// The directory authorities we recognize.
    pub authorities: Vec<Authority>,

    /// Whether to use the microdesc-flavored consensus.
    ///
    /// `Auto` resolves to yes for non-server configurations that are
    /// not fetching every descriptor, unless bridges are in use and
    /// some bridge cannot serve microdescriptors.
    pub use_microdescriptors: AutoBool,

    /// If true, fetch every consensus flavor and every descriptor,
    /// whether we plan to use them or not.
    pub fetch_useless_descriptors: bool,

    /// Enable the legacy v2 status fetch path for non-authorities.
    pub fetch_v2_networkstatus: bool,

    /// True if we reach the network through bridges.
    pub use_bridges: bool,

    /// False if some configured bridge cannot serve microdescriptors.
    pub bridges_can_use_microdescs: bool,

    /// A fallback consensus file to seed bootstrapping from, if any.
    pub fallback_networkstatus_file: Option<PathBuf>,

    /// Whether the fallback consensus may be installed even when it is
    /// obsolete.  On by default, matching the historical behavior.
    pub fallback_accepts_obsolete: bool,

    /// Collapse the early-fetcher download window to start almost
    /// immediately after the consensus stops being fresh.
    pub fetch_dir_info_extra_early: bool,

    /// True if we are running as a relay.
    pub server: bool,

    /// True if we are operating as a directory cache.
    pub cache: bool,

    /// True if we are a directory authority.
    pub authority: bool,

    /// Our own authority identity, when we are one; lets the v2
    /// refresh skip asking ourselves.
    pub own_identity: Option<IdDigest>,

    /// Our own software version, checked against the consensus
    /// recommended-versions list.
    pub software_version: String,

    /// Drop cached v2 status documents older than this.
    pub max_v2_status_age: Duration,

    /// Configuration for retry timing.
    pub schedule: DownloadScheduleConfig,
}

impl Default for DirMgrConfig {
    fn default() -> Self {
        DirMgrConfig {
            data_dir: PathBuf::new(),
            mistrust: fs_mistrust::Mistrust::default(),
            authorities: default_authorities(),
            use_microdescriptors: AutoBool::Auto,
            fetch_useless_descriptors: false,
            fetch_v2_networkstatus: false,
            use_bridges: false,
            bridges_can_use_microdescs: true,
            fallback_networkstatus_file: None,
            fallback_accepts_obsolete: true,
            fetch_dir_info_extra_early: false,
            server: false,
            cache: false,
            authority: false,
            own_identity: None,
            software_version: env!("CARGO_PKG_VERSION").to_string(),
            max_v2_status_age: Duration::from_secs(10 * 24 * 60 * 60),
            schedule: DownloadScheduleConfig::default(),
        }
    }
}

impl DirMgrConfig {
    /// Return a slice of the configured authorities.
    pub fn authorities(&self) -> &[Authority] {
        &self.authorities
    }

    /// Return the consensus flavor this configuration wants to use.
    pub fn usable_flavor(&self) -> Flavor {
        match self.use_microdescriptors {
            AutoBool::Yes => Flavor::Microdesc,
            AutoBool::No => Flavor::Ns,
            AutoBool::Auto => {
                let want_md = !self.server
                    && !self.fetch_useless_descriptors
                    && (!self.use_bridges || self.bridges_can_use_microdescs);
                if want_md {
                    Flavor::Microdesc
                } else {
                    Flavor::Ns
                }
            }
        }
    }

    /// Return true if we should fetch consensuses of flavor `flavor`.
    pub fn we_want_to_fetch_flavor(&self, flavor: Flavor) -> bool {
        flavor == self.usable_flavor() || self.fetch_useless_descriptors || self.cache
    }

    /// Return the download-window role this configuration puts us in.
    pub fn fetch_role(&self) -> FetchRole {
        if self.authority || self.cache {
            FetchRole::EarlyFetching {
                extra_early: self.fetch_dir_info_extra_early,
            }
        } else if self.use_bridges {
            FetchRole::LateFetching
        } else {
            FetchRole::Client
        }
    }
}
