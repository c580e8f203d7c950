//! Deciding *when* to fetch a new consensus.
//!
//! Consensus downloads are spread over a window derived from the
//! current document's lifetime, so that the whole network does not
//! descend on the authorities the moment a consensus stops being
//! fresh.  Different roles get different windows: caches fetch early
//! so that clients can fetch from them later, and bridge users fetch
//! late to blend in.

use std::time::{Duration, SystemTime};

use rand::Rng;
use tracing::{debug, info};

use crate::config::DownloadScheduleConfig;
use crate::docs::{Flavor, Lifetime, PerFlavor};
use crate::retry::DownloadStatus;

/// How often an authority refreshes its v2 status cache.
pub(crate) const V2_AUTHORITY_FETCH_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// How often a non-authority directory cache refreshes its v2 status
/// cache.
pub(crate) const V2_CACHE_FETCH_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Which download window this host uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum FetchRole {
    /// Authorities and caches: fetch soon after freshness ends, so the
    /// rest of the network can fetch from them.
    EarlyFetching {
        /// Collapse the window to start almost immediately.
        extra_early: bool,
    },
    /// Ordinary clients: fetch in the last part of the lifetime.
    Client,
    /// Bridge users: fetch even later, after the client window.
    LateFetching,
}

/// Compute the download window for a consensus with lifetime `lt`, as
/// a start time and an interval length.
///
/// The fetch time should be picked uniformly at random within the
/// window; the window always starts after `fresh_until` and ends
/// before `valid_until`.
pub(crate) fn download_range(lt: &Lifetime, role: FetchRole) -> (SystemTime, Duration) {
    let interval = lt.voting_interval();
    let slop = std::cmp::min(Duration::from_secs(120), interval / 16);

    /// Client window: start 3/4 of an interval after freshness ends,
    /// spread over 7/8 of the time remaining after that.
    fn client_window(lt: &Lifetime, interval: Duration) -> (SystemTime, Duration) {
        let start = lt.fresh_until() + (interval * 3) / 4;
        let remaining = lt
            .valid_until()
            .duration_since(start)
            .unwrap_or(Duration::ZERO);
        (start, (remaining * 7) / 8)
    }

    let (start, dl_interval) = match role {
        FetchRole::EarlyFetching { extra_early } => {
            let start = lt.fresh_until() + slop;
            let dl_interval = if extra_early {
                std::cmp::min(Duration::from_secs(60), interval / 2)
            } else {
                interval / 2
            };
            (start, dl_interval)
        }
        FetchRole::Client => client_window(lt, interval),
        FetchRole::LateFetching => {
            let (client_start, client_dl) = client_window(lt, interval);
            let start = client_start + client_dl + slop;
            let end = lt.valid_until() - slop;
            let dl_interval = end.duration_since(start).unwrap_or(Duration::ZERO);
            (start, dl_interval)
        }
    };

    let dl_interval = std::cmp::max(dl_interval, Duration::from_secs(1));
    debug_assert!(lt.fresh_until() < start);
    debug_assert!(start + dl_interval < lt.valid_until());
    (start, dl_interval)
}

/// Pick a uniformly random fetch time within the download window for
/// `lt`.
pub(crate) fn pick_download_time<R: Rng>(
    lt: &Lifetime,
    role: FetchRole,
    rng: &mut R,
) -> SystemTime {
    let (start, dl_interval) = download_range(lt, role);
    let when = start + rng.gen_range(Duration::ZERO..dl_interval);
    info!(
        "Consensus is fresh until {:?} and valid until {:?}; picked {:?} as the \
         earliest time to replace it",
        time::OffsetDateTime::from(lt.fresh_until()),
        time::OffsetDateTime::from(lt.valid_until()),
        time::OffsetDateTime::from(when),
    );
    when
}

/// Download-scheduling state for one consensus flavor.
#[derive(Clone, Debug)]
pub(crate) struct FlavorSchedule {
    /// When to next try fetching this flavor, if decided.
    pub(crate) next_download_time: Option<SystemTime>,
    /// Retry state for fetches of this flavor.
    pub(crate) dl_status: DownloadStatus,
}

/// All download-scheduling state.
pub(crate) struct Scheduler {
    /// Per-flavor consensus scheduling.
    pub(crate) consensus: PerFlavor<FlavorSchedule>,
    /// When we last attempted a v2 cache refresh, shared across all v2
    /// fetches.
    pub(crate) last_v2_attempt: Option<SystemTime>,
}

impl Scheduler {
    /// Construct scheduling state from the configured retry schedules.
    pub(crate) fn new(cfg: &DownloadScheduleConfig) -> Self {
        let fresh = || FlavorSchedule {
            next_download_time: None,
            dl_status: DownloadStatus::from_schedule(&cfg.retry_consensus),
        };
        Scheduler {
            consensus: PerFlavor {
                ns: fresh(),
                microdesc: fresh(),
            },
            last_v2_attempt: None,
        }
    }

    /// Pick and record the next download time for `flavor`, whose
    /// freshly installed consensus has lifetime `lt`.
    pub(crate) fn schedule_after_install<R: Rng>(
        &mut self,
        flavor: Flavor,
        lt: &Lifetime,
        role: FetchRole,
        rng: &mut R,
    ) {
        let when = pick_download_time(lt, role, rng);
        self.consensus.get_mut(flavor).next_download_time = Some(when);
    }

    /// Record a failed consensus fetch for `flavor`.
    pub(crate) fn note_consensus_failure<R: Rng>(
        &mut self,
        flavor: Flavor,
        now: SystemTime,
        rng: &mut R,
    ) {
        let sched = self.consensus.get_mut(flavor);
        sched.dl_status.note_failure(now, rng);
        debug!(
            "Consensus fetch for {} failed ({} so far); next attempt no sooner than {:?}",
            flavor,
            sched.dl_status.n_failures(),
            time::OffsetDateTime::from(sched.dl_status.next_attempt()),
        );
    }

    /// Record a successful consensus fetch for `flavor`.
    pub(crate) fn note_consensus_success(&mut self, flavor: Flavor) {
        self.consensus.get_mut(flavor).dl_status.note_success();
    }

    /// Return true if a v2 refresh is due at `now`, given the pacing
    /// interval for our role, and record the attempt if so.
    pub(crate) fn v2_attempt_due(&mut self, now: SystemTime, interval: Duration) -> bool {
        let due = match self.last_v2_attempt {
            None => true,
            Some(last) => last + interval <= now,
        };
        if due {
            self.last_v2_attempt = Some(now);
        }
        due
    }
}
