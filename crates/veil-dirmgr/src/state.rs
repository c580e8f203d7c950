//! The consensus store and the install protocol.
//!
//! [`DirMgr::set_current_consensus`] is the single entry point through
//! which consensus bytes become the current consensus: it parses,
//! checks the signature quorum, and then either installs the document,
//! parks it to wait for missing certificates, or rejects it.  The
//! rules run in a fixed order so that cheap rejections (duplicate,
//! stale) happen before signature work, and so that no step can leave
//! the store half-updated.

use std::time::{Duration, SystemTime};

use tracing::{debug, info, trace, warn};

use crate::docs::{Consensus, Flavor, IdDigest};
use crate::event::{DirEvent, Severity};
use crate::names::NicknameMaps;
use crate::quorum::{check_consensus_signatures, QuorumResult};
use crate::storage::consensus_fname;
use crate::{DirMgr, Error, Result, EARLY_CONSENSUS_NOTICE_SKEW};

/// How old a cached consensus may be before we refuse to load it
/// (unless told to accept obsolete documents).
pub(crate) const OLD_ROUTER_DESC_MAX_AGE: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// Options controlling one call to [`DirMgr::set_current_consensus`].
#[derive(Copy, Clone, Debug, Default)]
#[non_exhaustive]
pub struct SetConsensusOptions {
    /// The bytes came from our own disk cache, not the network.
    pub from_cache: bool,
    /// This consensus was parked waiting for certificates and is being
    /// retried; don't re-warn about things we warned about the first
    /// time.
    pub was_waiting_for_certs: bool,
    /// Don't kick off certificate downloads if certificates turn out
    /// to be missing.
    pub dont_download_certs: bool,
    /// Accept the document even if it is long expired.
    pub accept_obsolete: bool,
    /// Fail with [`Error::WrongFlavor`] if the parsed flavor differs
    /// from the requested one, instead of adopting the parsed flavor.
    pub require_flavor: bool,
}

/// What a successful call to [`DirMgr::set_current_consensus`] did.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SetOutcome {
    /// The consensus is now the current one for its flavor.
    Installed,
    /// The consensus is parked, waiting for certificates.
    ParkedForCerts,
    /// The consensus was valid but useless to us; dropped silently.
    Unwanted,
}

/// A consensus parked in the waiting-for-certs slot.
///
/// At most one of these exists per flavor; a newly arriving consensus
/// with a later `valid_after` displaces it.
pub(crate) struct PendingConsensus {
    /// The parsed (but not yet verifiable) consensus.
    pub(crate) consensus: Consensus,
    /// The original document bytes, for re-running the install once
    /// certificates arrive.
    pub(crate) bytes: Vec<u8>,
    /// When we parked it.
    pub(crate) parked_at: SystemTime,
    /// Set once the certificate wait has gone on long enough that the
    /// scheduler may fetch a fresh consensus instead.
    pub(crate) dl_failed: bool,
    /// Whether the original bytes came from our disk cache.
    pub(crate) from_cache: bool,
}

impl DirMgr {
    /// Try to make `bytes` the current consensus for `flavor`.
    ///
    /// Returns `Ok` both for an actual install and for a successful
    /// park into the waiting-for-certs slot; the distinction is in the
    /// [`SetOutcome`].  Errors are split by
    /// [`Error::counts_as_download_failure`] into mild rejections and
    /// hard failures.
    pub fn set_current_consensus(
        &mut self,
        bytes: &[u8],
        flavor_wanted: Flavor,
        opts: SetConsensusOptions,
    ) -> Result<SetOutcome> {
        let now = self.clock.now();

        let mut consensus = self.parser.consensus(bytes).map_err(Error::BadParse)?;

        let flavor = consensus.flavor;
        if flavor != flavor_wanted {
            if opts.require_flavor {
                return Err(Error::WrongFlavor {
                    want: flavor_wanted,
                    got: flavor,
                });
            }
            debug!(
                "Got a {} consensus while looking for {}; considering it anyway",
                flavor, flavor_wanted
            );
        }

        if !self.config.we_want_to_fetch_flavor(flavor) {
            trace!("Dropping {} consensus: we have no use for that flavor", flavor);
            return Ok(SetOutcome::Unwanted);
        }

        if opts.from_cache
            && !opts.accept_obsolete
            && consensus.lifetime.valid_until() < now - OLD_ROUTER_DESC_MAX_AGE
        {
            return Err(Error::ObsoleteConsensus);
        }

        if let Some(current) = self.current.get(flavor).get() {
            if current.digests == consensus.digests {
                return Err(Error::DuplicateConsensus);
            }
            if consensus.lifetime.valid_after() <= current.lifetime.valid_after() {
                return Err(Error::StaleConsensus);
            }
        }

        let tally = check_consensus_signatures(
            &mut consensus,
            &self.config.authorities,
            self.certs.as_ref(),
            self.verifier.as_ref(),
            now,
            !opts.was_waiting_for_certs,
        );
        match tally.result() {
            QuorumResult::Insufficient => {
                return Err(Error::InsufficientSignatures(tally.describe()));
            }
            QuorumResult::NeedCerts => {
                if let Some(parked) = self.waiting.get(flavor) {
                    if parked.consensus.lifetime.valid_after() >= consensus.lifetime.valid_after()
                    {
                        return Err(Error::StaleConsensus);
                    }
                }
                info!(
                    "Not enough certificates to check the {} consensus yet; waiting ({})",
                    flavor,
                    tally.describe()
                );
                if !opts.from_cache {
                    if let Err(e) = self.store.save(consensus_fname(flavor, true), bytes) {
                        warn!("Unable to store unverified consensus: {}", e);
                    }
                }
                if !opts.dont_download_certs {
                    self.certs.fetch_missing(&consensus, now);
                }
                *self.waiting.get_mut(flavor) = Some(PendingConsensus {
                    consensus,
                    bytes: bytes.to_vec(),
                    parked_at: now,
                    dl_failed: false,
                    from_cache: opts.from_cache,
                });
                Ok(SetOutcome::ParkedForCerts)
            }
            QuorumResult::Enough | QuorumResult::AllGood => {
                self.install_consensus(consensus, bytes, flavor, opts, now)
            }
        }
    }

    /// Install a quorum-approved consensus as the current one.
    fn install_consensus(
        &mut self,
        mut consensus: Consensus,
        bytes: &[u8],
        flavor: Flavor,
        opts: SetConsensusOptions,
        now: SystemTime,
    ) -> Result<SetOutcome> {
        let previous = self.current.get(flavor).get();

        if let Some(prev) = &previous {
            copy_forward_router_state(&mut consensus, prev);
        }
        let changed = changed_routerstatuses(previous.as_deref(), &consensus);

        self.current.get(flavor).replace(consensus);
        let installed = self
            .current
            .get(flavor)
            .get()
            .expect("consensus vanished during install");
        info!(
            "Installed a new {} consensus ({} relays), valid after {:?}",
            flavor,
            installed.relays.len(),
            time::OffsetDateTime::from(installed.lifetime.valid_after()),
        );

        self.events.emit(DirEvent::NewConsensus { flavor });
        if !changed.is_empty() {
            self.events.emit(DirEvent::NetworkStatusChanged { changed });
        }
        if !opts.from_cache {
            self.events.emit(DirEvent::ClientStatus {
                severity: Severity::Notice,
                message: "CONSENSUS_ARRIVED".to_string(),
            });
        }

        // A parked consensus that is no newer than the one we just
        // installed is of no further use.
        let evict = matches!(
            self.waiting.get(flavor),
            Some(parked)
                if parked.consensus.lifetime.valid_after() <= installed.lifetime.valid_after()
        );
        if evict {
            *self.waiting.get_mut(flavor) = None;
            if let Err(e) = self.store.delete(consensus_fname(flavor, true)) {
                warn!("Unable to remove unverified consensus: {}", e);
            }
        }

        if installed.is_live(now) {
            self.sched.note_consensus_success(flavor);
        } else {
            self.sched
                .note_consensus_failure(flavor, now, &mut rand::thread_rng());
        }
        self.sched.schedule_after_install(
            flavor,
            &installed.lifetime,
            self.config.fetch_role(),
            &mut rand::thread_rng(),
        );

        if flavor == self.config.usable_flavor() {
            self.nodes.set_consensus(installed.as_ref());
            self.names
                .replace(NicknameMaps::from_consensus(installed.as_ref()));
            self.bandwidth.params_changed(&installed.params);
            self.check_recommended_versions(installed.as_ref());
        }
        if flavor == Flavor::Microdesc {
            self.mdcache.update_listed(installed.as_ref());
        }

        if !opts.from_cache {
            if let Err(e) = self.store.save(consensus_fname(flavor, false), bytes) {
                warn!("Unable to store consensus: {}", e);
            }
        }

        if !opts.was_waiting_for_certs
            && now + EARLY_CONSENSUS_NOTICE_SKEW < installed.lifetime.valid_after()
        {
            let skew =
                crate::event::skew_seconds(installed.lifetime.valid_after(), now);
            warn!(
                "Our clock is {} seconds behind the consensus we just got; \
                 either the authorities' clocks are wrong, or ours is",
                skew
            );
            self.events.emit(DirEvent::GeneralStatus {
                severity: Severity::Warn,
                message: crate::event::clock_skew_message(skew, "CONSENSUS"),
            });
        }

        Ok(SetOutcome::Installed)
    }

    /// Hook to call when new certificates have entered the certificate
    /// store.
    ///
    /// Re-checks every parked consensus; any that can now reach a
    /// quorum is re-fed through the install path.
    pub fn note_certs_arrived(&mut self) {
        let now = self.clock.now();
        for flavor in Flavor::ALL {
            let ready = match self.waiting.get_mut(flavor) {
                Some(parked) => {
                    let tally = check_consensus_signatures(
                        &mut parked.consensus,
                        &self.config.authorities,
                        self.certs.as_ref(),
                        self.verifier.as_ref(),
                        now,
                        false,
                    );
                    matches!(
                        tally.result(),
                        QuorumResult::Enough | QuorumResult::AllGood
                    )
                }
                None => false,
            };
            if !ready {
                continue;
            }
            let parked = self
                .waiting
                .get_mut(flavor)
                .take()
                .expect("parked consensus vanished");
            let opts = SetConsensusOptions {
                from_cache: parked.from_cache,
                was_waiting_for_certs: true,
                dont_download_certs: true,
                ..SetConsensusOptions::default()
            };
            match self.set_current_consensus(&parked.bytes, flavor, opts) {
                Ok(SetOutcome::Installed) => {
                    if let Err(e) = self.store.delete(consensus_fname(flavor, true)) {
                        warn!("Unable to remove unverified consensus: {}", e);
                    }
                }
                Ok(outcome) => {
                    debug!(
                        "Parked {} consensus did not install after certs arrived: {:?}",
                        flavor, outcome
                    );
                }
                Err(e) => {
                    // It was taken out of the slot; nothing more will
                    // come of it.
                    debug!(
                        "Dropping parked {} consensus after certs arrived: {}",
                        flavor, e
                    );
                    if let Err(e) = self.store.delete(consensus_fname(flavor, true)) {
                        warn!("Unable to remove unverified consensus: {}", e);
                    }
                }
            }
        }
    }

    /// Callback from the transport: a consensus fetch failed outright.
    pub fn note_consensus_download_failed(&mut self, flavor: Flavor, status_code: u16) {
        let now = self.clock.now();
        debug!(
            "Consensus fetch for {} failed with status {}",
            flavor, status_code
        );
        self.sched
            .note_consensus_failure(flavor, now, &mut rand::thread_rng());
    }

    /// Note that the relay with the given identity answered a
    /// directory request with a 503.
    pub fn note_relay_dir_503(&mut self, identity: &IdDigest) {
        let now = self.clock.now();
        for flavor in Flavor::ALL {
            let _ignore = self.current.get(flavor).mutate(|c| {
                if let Some(rs) = c.routerstatus_mut(identity) {
                    rs.last_dir_503_at = Some(now);
                }
                Ok(())
            });
        }
    }

    /// Warn (once) if the consensus recommends client versions and
    /// ours is not among them.
    fn check_recommended_versions(&mut self, consensus: &Consensus) {
        if self.warned_dangerous_version || consensus.client_versions.is_empty() {
            return;
        }
        let version = self.config.software_version.clone();
        if consensus.client_versions.iter().any(|v| v == &version) {
            return;
        }
        warn!(
            "This version ({}) is not listed as recommended in the consensus",
            version
        );
        self.events.emit(DirEvent::GeneralStatus {
            severity: Severity::Warn,
            message: crate::event::dangerous_version_message(&version, "UNRECOMMENDED"),
        });
        self.warned_dangerous_version = true;
    }
}

/// Copy forward per-router ancillary state from the previous consensus:
/// the last-503 stamp always, and the descriptor download status when
/// the descriptor digest is unchanged.
fn copy_forward_router_state(new: &mut Consensus, prev: &Consensus) {
    let mut i = 0;
    for rs in &mut new.relays {
        while i < prev.relays.len() && prev.relays[i].identity < rs.identity {
            i += 1;
        }
        if i < prev.relays.len() && prev.relays[i].identity == rs.identity {
            let old = &prev.relays[i];
            rs.last_dir_503_at = old.last_dir_503_at;
            if rs.desc_digest == old.desc_digest {
                rs.dl_status = old.dl_status.clone();
            }
        }
    }
}

/// Return the identities of every router status that is new or changed
/// relative to `prev`.
fn changed_routerstatuses(prev: Option<&Consensus>, new: &Consensus) -> Vec<IdDigest> {
    let Some(prev) = prev else {
        return new.relays.iter().map(|rs| rs.identity).collect();
    };
    let mut changed = Vec::new();
    let mut i = 0;
    for rs in &new.relays {
        while i < prev.relays.len() && prev.relays[i].identity < rs.identity {
            i += 1;
        }
        let same = i < prev.relays.len() && prev.relays[i].identity == rs.identity && {
            let old = &prev.relays[i];
            old.desc_digest == rs.desc_digest
                && old.flags == rs.flags
                && old.addr == rs.addr
                && old.or_port == rs.or_port
                && old.dir_port == rs.dir_port
        };
        if !same {
            changed.push(rs.identity);
        }
    }
    changed
}
