#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]

pub mod authority;
pub mod config;
mod docid;
mod docs;
mod err;
mod event;
mod external;
mod getinfo;
mod mdcache;
mod names;
mod quorum;
mod retry;
mod schedule;
mod shared_ref;
mod state;
mod storage;
mod vstatus;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, trace, warn};

use crate::docid::MAX_MD_PER_REQUEST;
use crate::schedule::{Scheduler, V2_AUTHORITY_FETCH_INTERVAL, V2_CACHE_FETCH_INTERVAL};
use crate::shared_ref::SharedMutArc as SharedRef;
use crate::state::PendingConsensus;
use crate::storage::{consensus_fname, Store};
use crate::vstatus::V2StatusCache;

pub use authority::{Authority, AuthorityBuilder};
pub use config::{AutoBool, DirMgrConfig, DownloadScheduleConfig};
pub use docid::{FetchPurpose, Resource};
pub use docs::{
    Consensus, DescDigest, DigestAlg, DocDigests, Flavor, IdDigest, KeyDigest, Lifetime, MdDigest,
    NetParams, PerFlavor, ProtoCaps, RelayFlags, RouterStatus, Voter, VoterSignature,
};
pub use err::{Error, ParseError, Result};
pub use event::{DirEvent, EventSink, Severity};
pub use external::{
    BandwidthListener, Cert, CertStore, DocParser, NodeList, ParsedMd, ParsedV2Status,
    SignatureVerifier, SystemClock, Transport, WallClock,
};
pub use mdcache::{Microdesc, MicrodescCache, SavedLocation};
pub use names::NicknameMaps;
pub use quorum::{QuorumResult, QuorumTally};
pub use retry::{DownloadSchedule, DownloadStatus, RetryDelay};
pub use schedule::FetchRole;
pub use shared_ref::SharedMutArc;
pub use state::{SetConsensusOptions, SetOutcome};
pub use vstatus::V2Status;

/// How far in the future a document's times may be before we reject it
/// as clock skew.
pub const NETWORKSTATUS_ALLOW_SKEW: Duration = Duration::from_secs(86400);

/// How long a router listed in a v2 status document is considered
/// usable by the clients that still read those documents.
pub const V2_NETWORKSTATUS_ROUTER_LIFETIME: Duration = Duration::from_secs(10800);

/// How long a consensus must have been valid before a directory cache
/// should serve it.
pub const CONSENSUS_MIN_SECONDS_BEFORE_CACHING: Duration = Duration::from_secs(120);

/// How long we wait for certificates for a parked consensus before
/// allowing a fresh consensus fetch instead.
pub const DELAY_WHILE_FETCHING_CERTS: Duration = Duration::from_secs(1200);

/// Number of consensus fetch failures after which the retry schedule
/// plateaus.
pub const CONSENSUS_NETWORKSTATUS_MAX_DL_TRIES: u32 = 8;

/// How long past expiry a consensus is still "reasonably live".
pub const REASONABLY_LIVE_TIME: Duration = Duration::from_secs(86400);

/// How far ahead of our clock a consensus's valid-after may be before
/// we mention clock skew.
pub const EARLY_CONSENSUS_NOTICE_SKEW: Duration = Duration::from_secs(60);

/// How long an unlisted microdescriptor stays cached before cleaning
/// removes it.
pub const TOLERATE_MICRODESC_AGE: Duration = Duration::from_secs(604800);

/// The external collaborators a [`DirMgr`] drives.
///
/// Like [`DirMgrConfig`], this is an exhaustive struct assembled by
/// the host; growing a field here is deliberately a compile error for
/// hosts.
#[allow(clippy::exhaustive_structs)]
pub struct Externals {
    /// Parses document bytes into the types in this crate.
    pub parser: Arc<dyn DocParser>,
    /// Holds authority signing-key certificates.
    pub certs: Box<dyn CertStore>,
    /// Verifies raw signatures.
    pub verifier: Arc<dyn SignatureVerifier>,
    /// Fetches documents from the directory network.
    pub transport: Box<dyn Transport>,
    /// Consumes installed directory information.
    pub nodes: Box<dyn NodeList>,
    /// Receives control events.
    pub events: Box<dyn EventSink>,
    /// Receives traffic-shaping parameter updates.
    pub bandwidth: Box<dyn BandwidthListener>,
    /// Tells the time.
    pub clock: Box<dyn WallClock>,
}

/// The consensus directory subsystem.
///
/// One `DirMgr` owns all directory state for a host: the current
/// consensus per flavor, the waiting-for-certs slots, the
/// microdescriptor cache, the nickname maps, the v2 status cache, and
/// the download scheduler.  All mutation happens through `&mut self`
/// on the host's main task; the only things shared out are
/// [`Arc`]-snapshots of installed documents.
pub struct DirMgr {
    /// Configuration for this directory manager.
    ///
    /// Public so that tests and hosts can inspect it; replacing it on
    /// a live manager is not supported.
    pub(crate) config: DirMgrConfig,
    /// Our on-disk state.
    pub(crate) store: Store,
    /// The current consensus, per flavor.
    pub(crate) current: PerFlavor<SharedRef<Consensus>>,
    /// The waiting-for-certs slot, per flavor.
    pub(crate) waiting: PerFlavor<Option<PendingConsensus>>,
    /// The microdescriptor cache.
    pub(crate) mdcache: MicrodescCache,
    /// The legacy v2 status cache.
    pub(crate) v2cache: V2StatusCache,
    /// The nickname maps, rebuilt on installs of the usable flavor.
    pub(crate) names: SharedRef<NicknameMaps>,
    /// Download scheduling state.
    pub(crate) sched: Scheduler,
    /// The external document parser.
    pub(crate) parser: Arc<dyn DocParser>,
    /// The external certificate store.
    pub(crate) certs: Box<dyn CertStore>,
    /// The external signature verifier.
    pub(crate) verifier: Arc<dyn SignatureVerifier>,
    /// The external directory transport.
    pub(crate) transport: Box<dyn Transport>,
    /// The external node list.
    pub(crate) nodes: Box<dyn NodeList>,
    /// The external control-event sink.
    pub(crate) events: Box<dyn EventSink>,
    /// The external traffic-shaping listener.
    pub(crate) bandwidth: Box<dyn BandwidthListener>,
    /// The wall clock.
    pub(crate) clock: Box<dyn WallClock>,
    /// Set once we've warned that our version is unrecommended.
    pub(crate) warned_dangerous_version: bool,
}

impl DirMgr {
    /// Create a new directory manager, opening (and checking
    /// permissions on) its data directory.
    ///
    /// No disk state is loaded yet; call
    /// [`load_from_disk`](DirMgr::load_from_disk) for that.
    pub fn new(config: DirMgrConfig, ext: Externals) -> Result<Self> {
        let store = Store::open(&config.data_dir, &config.mistrust)?;
        let sched = Scheduler::new(&config.schedule);
        Ok(DirMgr {
            config,
            store,
            current: PerFlavor::default(),
            waiting: PerFlavor::default(),
            mdcache: MicrodescCache::new(),
            v2cache: V2StatusCache::new(),
            names: SharedRef::new(),
            sched,
            parser: ext.parser,
            certs: ext.certs,
            verifier: ext.verifier,
            transport: ext.transport,
            nodes: ext.nodes,
            events: ext.events,
            bandwidth: ext.bandwidth,
            clock: ext.clock,
            warned_dangerous_version: false,
        })
    }

    /// Load all persisted directory state from the data directory.
    ///
    /// No single unreadable or unusable file is fatal: we log, skip
    /// it, and re-download later.
    pub fn load_from_disk(&mut self) {
        self.mdcache = MicrodescCache::load(&self.store, self.parser.as_ref());
        self.v2cache =
            V2StatusCache::load(&self.store, self.parser.as_ref(), &self.config.authorities);

        for flavor in Flavor::ALL {
            for unverified in [false, true] {
                let fname = consensus_fname(flavor, unverified);
                let bytes = match self.store.load(fname) {
                    Ok(Some(bytes)) => bytes,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!("Unable to read {}: {}", fname, e);
                        continue;
                    }
                };
                let opts = if unverified {
                    SetConsensusOptions {
                        from_cache: true,
                        was_waiting_for_certs: true,
                        dont_download_certs: true,
                        ..SetConsensusOptions::default()
                    }
                } else {
                    SetConsensusOptions {
                        from_cache: true,
                        ..SetConsensusOptions::default()
                    }
                };
                match self.set_current_consensus(bytes.as_ref(), flavor, opts) {
                    Ok(outcome) => debug!("Loaded {}: {:?}", fname, outcome),
                    Err(e) => info!("Not using cached {}: {}", fname, e),
                }
            }
        }

        self.consider_fallback_consensus();
    }

    /// Install the configured fallback consensus, if we have no better
    /// starting point.
    ///
    /// The fallback is consulted only when we have no cached consensus
    /// for the usable flavor, or when the fallback file is newer than
    /// what we loaded.
    fn consider_fallback_consensus(&mut self) {
        let Some(path) = self.config.fallback_networkstatus_file.clone() else {
            return;
        };
        let usable = self.config.usable_flavor();
        let use_fallback = match self.current.get(usable).get() {
            None => true,
            Some(current) => match std::fs::metadata(&path).and_then(|m| m.modified()) {
                Ok(mtime) => mtime > current.lifetime.valid_after(),
                Err(_) => false,
            },
        };
        if !use_fallback {
            return;
        }
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    "Unable to read fallback consensus {}: {}",
                    path.display(),
                    e
                );
                return;
            }
        };
        let opts = SetConsensusOptions {
            from_cache: true,
            accept_obsolete: self.config.fallback_accepts_obsolete,
            ..SetConsensusOptions::default()
        };
        match self.set_current_consensus(&bytes, usable, opts) {
            Ok(outcome) => info!(
                "Seeded directory from fallback consensus {}: {:?}",
                path.display(),
                outcome
            ),
            Err(e) => warn!(
                "Unable to use fallback consensus {}: {}",
                path.display(),
                e
            ),
        }
    }

    /// One pass of the download scheduler.
    ///
    /// Call this from the host's main loop on a coarse interval (a
    /// second or a few).  Decides what is due and tells the transport
    /// to fetch it; never blocks.
    pub fn tick(&mut self) {
        let now = self.clock.now();

        // Trip the waiting-slot latches for parks that have waited too
        // long for certificates.
        for flavor in Flavor::ALL {
            if let Some(parked) = self.waiting.get_mut(flavor) {
                if !parked.dl_failed && parked.parked_at + DELAY_WHILE_FETCHING_CERTS <= now {
                    debug!(
                        "Giving up waiting for certificates for the parked {} consensus",
                        flavor
                    );
                    parked.dl_failed = true;
                }
            }
        }

        // Consensus fetches, per wanted flavor.
        for flavor in Flavor::ALL {
            if !self.config.we_want_to_fetch_flavor(flavor) {
                continue;
            }
            let live = self
                .current
                .get(flavor)
                .get()
                .map(|c| c.is_live(now))
                .unwrap_or(false);
            let due = if live {
                matches!(
                    self.sched.consensus.get(flavor).next_download_time,
                    Some(when) if when <= now
                )
            } else {
                // With no live consensus, fetch as soon as we may.
                true
            };
            if !due {
                continue;
            }
            let resource = Resource::Consensus { flavor };
            if self
                .transport
                .in_flight(FetchPurpose::Consensus, Some(&resource))
            {
                continue;
            }
            if !self.sched.consensus.get(flavor).dl_status.is_ready(now) {
                continue;
            }
            if let Some(parked) = self.waiting.get(flavor) {
                if !parked.dl_failed && now < parked.parked_at + DELAY_WHILE_FETCHING_CERTS {
                    // Still hoping for certificates; don't fetch a new
                    // consensus over it.
                    continue;
                }
            }
            trace!("Launching a fetch for the {} consensus", flavor);
            self.transport
                .launch_fetch(FetchPurpose::Consensus, &resource);
        }

        // Microdescriptors listed by the consensus we use.
        if self.config.usable_flavor() == Flavor::Microdesc {
            if let Some(consensus) = self.current.get(Flavor::Microdesc).get() {
                if consensus.is_reasonably_live(now)
                    && !self.transport.in_flight(FetchPurpose::Microdescs, None)
                {
                    let missing =
                        self.mdcache
                            .missing_from(&consensus, now, true, &HashSet::new());
                    let parallelism =
                        usize::from(self.config.schedule.retry_microdescs.parallelism());
                    for batch in missing.chunks(MAX_MD_PER_REQUEST).take(parallelism) {
                        trace!("Requesting {} missing microdescriptors", batch.len());
                        self.transport.launch_fetch(
                            FetchPurpose::Microdescs,
                            &Resource::Microdescs(batch.to_vec()),
                        );
                    }
                }
            }
        }

        // Legacy v2 refresh, for caches and anyone who asked for it.
        if self.config.cache || self.config.fetch_v2_networkstatus {
            let interval = if self.config.authority {
                V2_AUTHORITY_FETCH_INTERVAL
            } else {
                V2_CACHE_FETCH_INTERVAL
            };
            if !self.transport.in_flight(FetchPurpose::V2Status, None)
                && self.sched.v2_attempt_due(now, interval)
            {
                if self.config.authority {
                    for auth in self.config.authorities.iter().filter(|a| a.is_v2()) {
                        if Some(*auth.v3ident()) == self.config.own_identity {
                            continue;
                        }
                        self.transport.launch_fetch(
                            FetchPurpose::V2Status,
                            &Resource::V2ByFingerprint(*auth.v3ident()),
                        );
                    }
                } else {
                    self.transport
                        .launch_fetch(FetchPurpose::V2Status, &Resource::V2All);
                }
            }
        }
    }

    /// Periodic housekeeping: clean and maybe compact the
    /// microdescriptor cache, and expire old v2 documents.
    ///
    /// Meant to be driven from the same coarse timer as
    /// [`tick`](DirMgr::tick), much less often.
    pub fn run_periodic_cleanup(&mut self) {
        let now = self.clock.now();
        let have_live = self
            .current
            .get(Flavor::Microdesc)
            .get()
            .map(|c| c.is_live(now))
            .unwrap_or(false);
        // Settle the node reference counters before cleaning decides
        // what is safe to drop.
        self.mdcache.reconcile_node_refs(self.nodes.as_ref());
        self.mdcache
            .clean(now - TOLERATE_MICRODESC_AGE, have_live, false);
        if let Err(e) = self
            .mdcache
            .rebuild_if_needed(&self.store, now, have_live, false)
        {
            warn!("Unable to rebuild microdescriptor cache: {}", e);
        }
        self.v2cache
            .expire(now, self.config.max_v2_status_age, &self.store);
    }

    /// Handle consensus bytes arriving from the transport.
    ///
    /// Wraps [`set_current_consensus`](DirMgr::set_current_consensus)
    /// and records hard failures against the flavor's download
    /// schedule.
    pub fn receive_consensus(&mut self, bytes: &[u8], flavor: Flavor) -> Result<SetOutcome> {
        let outcome = self.set_current_consensus(bytes, flavor, SetConsensusOptions::default());
        if let Err(e) = &outcome {
            if e.counts_as_download_failure() {
                let now = self.clock.now();
                self.sched
                    .note_consensus_failure(flavor, now, &mut rand::thread_rng());
            }
        }
        outcome
    }

    /// Handle microdescriptor bytes arriving from the transport.
    ///
    /// `requested` is the set of digests we asked this server for;
    /// descriptors outside it are rejected, and matched digests are
    /// removed from the set.  Returns how many descriptors were newly
    /// added.
    pub fn receive_microdescs(
        &mut self,
        bytes: &[u8],
        requested: &mut HashSet<MdDigest>,
    ) -> Result<usize> {
        let parsed = self
            .parser
            .microdescs(bytes, false)
            .map_err(Error::BadParse)?;
        let md_consensus = self.current.get(Flavor::Microdesc).get();
        let have_md_consensus = md_consensus.is_some();
        let listed_at = md_consensus
            .map(|c| c.lifetime.valid_after())
            .unwrap_or_else(|| self.clock.now());

        let added = self.mdcache.add_parsed(
            bytes,
            parsed,
            SavedLocation::Nowhere,
            listed_at,
            Some(requested),
            Some(&self.store),
        )?;

        if have_md_consensus && !added.is_empty() {
            // Mark the descriptors' rows as successfully downloaded,
            // and tell the node list about them.
            let _ignore = self.current.get(Flavor::Microdesc).mutate(|c| {
                for digest in &added {
                    if let Some(idx) = c.position_by_descriptor(digest) {
                        c.relays[idx].dl_status.note_success();
                    }
                }
                Ok(())
            });
            if self.config.usable_flavor() == Flavor::Microdesc {
                for digest in &added {
                    self.nodes.add_microdesc(digest);
                }
            }
        }
        Ok(added.len())
    }

    /// Callback from the transport: a microdescriptor fetch failed for
    /// these digests.
    pub fn note_microdescs_download_failed(&mut self, digests: &[MdDigest]) {
        let now = self.clock.now();
        let _ignore = self.current.get(Flavor::Microdesc).mutate(|c| {
            for digest in digests {
                if let Some(idx) = c.position_by_descriptor(digest) {
                    c.relays[idx]
                        .dl_status
                        .note_failure(now, &mut rand::thread_rng());
                }
            }
            Ok(())
        });
    }

    /// Handle a legacy v2 status document arriving from the transport.
    pub fn receive_v2_status(&mut self, bytes: &[u8], requested: bool) -> Result<bool> {
        let now = self.clock.now();
        self.v2cache.handle_status(
            bytes,
            self.parser.as_ref(),
            requested,
            &self.config.authorities,
            now,
            &self.store,
            &mut *self.events,
        )
    }

    /// Return the current consensus for `flavor`, if any.
    pub fn consensus(&self, flavor: Flavor) -> Option<Arc<Consensus>> {
        self.current.get(flavor).get()
    }

    /// Return the current consensus for `flavor` only if it is live
    /// right now.
    pub fn live_consensus(&self, flavor: Flavor) -> Option<Arc<Consensus>> {
        let now = self.clock.now();
        self.current.get(flavor).get().filter(|c| c.is_live(now))
    }

    /// Return the current nickname maps, if a consensus has been
    /// installed.
    pub fn nickname_maps(&self) -> Option<Arc<NicknameMaps>> {
        self.names.get()
    }

    /// Return a view of the microdescriptor cache.
    pub fn microdesc_cache(&self) -> &MicrodescCache {
        &self.mdcache
    }

    /// Return a mutable view of the microdescriptor cache, for the
    /// node list's reference-count upkeep.
    pub fn microdesc_cache_mut(&mut self) -> &mut MicrodescCache {
        &mut self.mdcache
    }

    /// Iterate over the cached v2 status documents.
    pub fn v2_statuses(&self) -> impl Iterator<Item = &V2Status> {
        self.v2cache.iter()
    }
}

#[cfg(test)]
pub(crate) mod test {
    #![allow(clippy::unwrap_used)]
    //! Shared fakes and fixtures for the whole crate's tests.

    use super::*;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::net::IpAddr;
    use std::rc::Rc;
    use std::time::{SystemTime, UNIX_EPOCH};
    use tempfile::TempDir;

    /// Shorthand: a SystemTime `secs` seconds past the epoch.
    pub(crate) fn t(secs: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs)
    }

    /// The fake signing key for the authority with identity `id`.
    pub(crate) fn auth_signing_key(id: &IdDigest) -> Vec<u8> {
        [id.as_bytes().as_slice(), b"-signing-key"].concat()
    }

    /// The fake signing-key digest for the authority with identity
    /// `id`.
    pub(crate) fn auth_sk_digest(id: &IdDigest) -> KeyDigest {
        let mut d = *id.as_bytes();
        d[19] ^= 0xFF;
        d
    }

    /// Produce the fake signature that `MockVerifier` accepts for
    /// `key` over `digest`.
    pub(crate) fn sign(key: &[u8], digest: &[u8]) -> Vec<u8> {
        [b"sig:".as_slice(), key, b":".as_slice(), digest].concat()
    }

    /// A verifier that accepts exactly the signatures `sign` makes.
    pub(crate) struct MockVerifier;

    impl SignatureVerifier for MockVerifier {
        fn verify(&self, signing_key: &[u8], signature: &[u8], digest: &[u8]) -> bool {
            signature == sign(signing_key, digest).as_slice()
        }
    }

    /// Make `n` test authorities with identities `[1;20]`, `[2;20]`,
    /// ..., all v2-capable.
    pub(crate) fn make_authorities(n: usize) -> Vec<Authority> {
        (0..n)
            .map(|i| {
                let id = IdDigest::from([u8::try_from(i).unwrap() + 1; 20]);
                Authority::builder()
                    .name(format!("auth{}", i))
                    .v3ident(id)
                    .v2(true)
                    .build()
                    .unwrap()
            })
            .collect()
    }

    /// A certificate store whose contents tests can edit mid-run
    /// through a shared handle.
    #[derive(Clone, Default)]
    pub(crate) struct MockCertStore {
        /// The certificates we hold.
        certs: Rc<RefCell<Vec<Cert>>>,
        /// Authorities whose cert downloads look hopeless.
        uncertain: Rc<RefCell<HashSet<IdDigest>>>,
        /// How many times `fetch_missing` was called.
        fetch_calls: Rc<Cell<usize>>,
    }

    impl MockCertStore {
        /// Add a (fake) certificate for `auth`, expiring at `expires`.
        pub(crate) fn add_cert_for(&self, auth: &Authority, expires: SystemTime) {
            let id = *auth.v3ident();
            self.certs.borrow_mut().push(Cert {
                identity: id,
                signing_key_digest: auth_sk_digest(&id),
                signing_key: auth_signing_key(&id),
                expires,
            });
        }

        /// Mark cert downloads for `id` as failing.
        pub(crate) fn mark_uncertain(&self, id: &IdDigest) {
            self.uncertain.borrow_mut().insert(*id);
        }

        /// Drop every certificate.
        pub(crate) fn clear(&self) {
            self.certs.borrow_mut().clear();
        }

        /// How many times was `fetch_missing` called?
        pub(crate) fn fetch_missing_calls(&self) -> usize {
            self.fetch_calls.get()
        }
    }

    impl CertStore for MockCertStore {
        fn lookup(&self, identity: &IdDigest, signing_key_digest: &KeyDigest) -> Option<Cert> {
            self.certs
                .borrow()
                .iter()
                .find(|c| &c.identity == identity && &c.signing_key_digest == signing_key_digest)
                .cloned()
        }
        fn dl_looks_uncertain(&self, identity: &IdDigest) -> bool {
            self.uncertain.borrow().contains(identity)
        }
        fn fetch_missing(&mut self, _consensus: &Consensus, _now: SystemTime) {
            self.fetch_calls.set(self.fetch_calls.get() + 1);
        }
    }

    /// A parser for the test document formats.
    ///
    /// Consensuses are not parsed at all: tests register the parsed
    /// value under its exact byte string.  Microdescriptors and v2
    /// statuses use trivial line formats that really get parsed, so
    /// the disk round-trip paths are exercised.
    #[derive(Clone, Default)]
    pub(crate) struct MockParser {
        /// Registered consensuses, keyed by their exact bytes.
        consensuses: Rc<RefCell<HashMap<Vec<u8>, Consensus>>>,
    }

    impl MockParser {
        /// Make a new empty parser.
        pub(crate) fn new() -> Self {
            MockParser::default()
        }

        /// Teach the parser that `bytes` parse into `consensus`.
        pub(crate) fn register(&self, bytes: Vec<u8>, consensus: Consensus) {
            self.consensuses.borrow_mut().insert(bytes, consensus);
        }
    }

    impl DocParser for MockParser {
        fn consensus(&self, input: &[u8]) -> std::result::Result<Consensus, ParseError> {
            self.consensuses
                .borrow()
                .get(input)
                .cloned()
                .ok_or_else(|| ParseError::new("not a registered consensus"))
        }
        fn microdescs(
            &self,
            input: &[u8],
            allow_annotations: bool,
        ) -> std::result::Result<Vec<ParsedMd>, ParseError> {
            parse_md_lines(input, allow_annotations)
        }
        fn v2_status(&self, input: &[u8]) -> std::result::Result<ParsedV2Status, ParseError> {
            let text =
                std::str::from_utf8(input).map_err(|_| ParseError::new("v2 doc not utf-8"))?;
            let mut words = text.trim_end().split(' ');
            match (words.next(), words.next(), words.next()) {
                (Some("v2"), Some(hexid), Some(secs)) => {
                    let identity = IdDigest::from_hex(hexid)
                        .ok_or_else(|| ParseError::new("bad v2 identity"))?;
                    let secs: u64 = secs
                        .parse()
                        .map_err(|_| ParseError::new("bad v2 timestamp"))?;
                    Ok(ParsedV2Status {
                        identity,
                        published_on: t(secs),
                    })
                }
                _ => Err(ParseError::new("not a v2 status")),
            }
        }
    }

    /// Parse the test microdescriptor line format.
    ///
    /// Entries are lines of `md <hex digest> <payload>`; each may be
    /// preceded by a `@last-listed <time>` annotation line.  Bodies
    /// are whole `md` lines including the newline.
    fn parse_md_lines(
        input: &[u8],
        allow_annotations: bool,
    ) -> std::result::Result<Vec<ParsedMd>, ParseError> {
        let mut out = Vec::new();
        let mut pending_listed = None;
        let mut off = 0_usize;
        for line in input.split_inclusive(|b| *b == b'\n') {
            let line_start = off;
            off += line.len();
            let text = std::str::from_utf8(line)
                .map_err(|_| ParseError::new("microdescs not utf-8"))?;
            let trimmed = text.trim_end_matches('\n');
            if trimmed.is_empty() {
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("@last-listed ") {
                if !allow_annotations {
                    return Err(ParseError::new("unexpected annotation"));
                }
                pending_listed = crate::mdcache::parse_listed_time(rest);
                continue;
            }
            if let Some(rest) = trimmed.strip_prefix("md ") {
                let hexpart = rest
                    .split(' ')
                    .next()
                    .ok_or_else(|| ParseError::new("truncated md line"))?;
                let bytes =
                    hex::decode(hexpart).map_err(|_| ParseError::new("bad md digest hex"))?;
                let digest: MdDigest = bytes
                    .try_into()
                    .map_err(|_| ParseError::new("md digest is not 32 bytes"))?;
                out.push(ParsedMd {
                    digest,
                    off: line_start,
                    len: line.len(),
                    last_listed: pending_listed.take(),
                });
                continue;
            }
            return Err(ParseError::new("unrecognized line in microdescs"));
        }
        Ok(out)
    }

    /// Build one test microdescriptor entry with digest `[tag; 32]`
    /// and a payload of `payload_len` filler bytes.
    pub(crate) fn md_entry(tag: u8, payload_len: usize) -> Vec<u8> {
        format!("md {} {}\n", hex::encode([tag; 32]), "x".repeat(payload_len)).into_bytes()
    }

    /// Parse test microdescriptor bytes with annotations allowed.
    pub(crate) fn parse_mds(input: &[u8]) -> Vec<ParsedMd> {
        parse_md_lines(input, true).unwrap()
    }

    /// Build a test v2 status document.
    pub(crate) fn v2_doc(id: &IdDigest, published_secs: u64) -> Vec<u8> {
        format!("v2 {} {}\n", id.to_hex(), published_secs).into_bytes()
    }

    /// A transport that records launches and lets tests fake
    /// in-flight requests.
    #[derive(Clone, Default)]
    pub(crate) struct MockTransport {
        /// Every fetch that was launched.
        pub(crate) launched: Rc<RefCell<Vec<(FetchPurpose, Resource)>>>,
        /// Requests tests claim are in flight.
        pub(crate) inflight: Rc<RefCell<Vec<(FetchPurpose, Resource)>>>,
    }

    impl MockTransport {
        /// Was a consensus fetch for `flavor` launched?
        pub(crate) fn launched_consensus(&self, flavor: Flavor) -> bool {
            self.launched
                .borrow()
                .iter()
                .any(|(p, r)| *p == FetchPurpose::Consensus
                    && matches!(r, Resource::Consensus { flavor: f } if *f == flavor))
        }

        /// How many fetches with `purpose` were launched?
        pub(crate) fn n_launched(&self, purpose: FetchPurpose) -> usize {
            self.launched
                .borrow()
                .iter()
                .filter(|(p, _)| *p == purpose)
                .count()
        }

        /// Forget every recorded launch.
        pub(crate) fn clear(&self) {
            self.launched.borrow_mut().clear();
        }
    }

    impl Transport for MockTransport {
        fn launch_fetch(&mut self, purpose: FetchPurpose, resource: &Resource) {
            self.launched.borrow_mut().push((purpose, resource.clone()));
        }
        fn in_flight(&self, purpose: FetchPurpose, resource: Option<&Resource>) -> bool {
            self.inflight.borrow().iter().any(|(p, r)| {
                *p == purpose && resource.map(|want| want == r).unwrap_or(true)
            })
        }
    }

    /// A node list that records what it was told.
    #[derive(Clone, Default)]
    pub(crate) struct MockNodes {
        /// How many times `set_consensus` ran.
        pub(crate) consensus_count: Rc<Cell<usize>>,
        /// Every digest passed to `add_microdesc`.
        pub(crate) md_added: Rc<RefCell<Vec<MdDigest>>>,
        /// What `referenced_microdescs` should answer.
        pub(crate) referenced: Rc<RefCell<Vec<MdDigest>>>,
        /// Canned answers for `list_by_purpose`.
        purpose_rows: Rc<RefCell<HashMap<String, Vec<String>>>>,
    }

    impl MockNodes {
        /// Add a canned `ns/purpose/` row.
        pub(crate) fn add_purpose_row(&self, purpose: &str, row: &str) {
            self.purpose_rows
                .borrow_mut()
                .entry(purpose.to_string())
                .or_default()
                .push(row.to_string());
        }
    }

    impl NodeList for MockNodes {
        fn set_consensus(&mut self, _consensus: &Consensus) {
            self.consensus_count.set(self.consensus_count.get() + 1);
        }
        fn add_microdesc(&mut self, digest: &MdDigest) {
            self.md_added.borrow_mut().push(*digest);
        }
        fn referenced_microdescs(&self) -> Vec<MdDigest> {
            self.referenced.borrow().clone()
        }
        fn list_by_purpose(&self, purpose: &str) -> Vec<String> {
            self.purpose_rows
                .borrow()
                .get(purpose)
                .cloned()
                .unwrap_or_default()
        }
    }

    /// An event sink that remembers everything.
    #[derive(Clone, Default)]
    pub(crate) struct EventLog {
        /// Every event emitted.
        events: Rc<RefCell<Vec<DirEvent>>>,
    }

    impl EventLog {
        /// Does any status event message contain `needle`?
        pub(crate) fn contains(&self, needle: &str) -> bool {
            self.events.borrow().iter().any(|e| match e {
                DirEvent::GeneralStatus { message, .. }
                | DirEvent::ClientStatus { message, .. } => message.contains(needle),
                _ => false,
            })
        }

        /// Total number of events seen.
        pub(crate) fn len(&self) -> usize {
            self.events.borrow().len()
        }

        /// Number of `NewConsensus` events seen.
        pub(crate) fn count_new_consensus(&self) -> usize {
            self.events
                .borrow()
                .iter()
                .filter(|e| matches!(e, DirEvent::NewConsensus { .. }))
                .count()
        }
    }

    impl EventSink for EventLog {
        fn emit(&mut self, event: DirEvent) {
            self.events.borrow_mut().push(event);
        }
    }

    /// A bandwidth listener that counts calls.
    #[derive(Clone, Default)]
    pub(crate) struct MockBandwidth {
        /// How many times parameters changed.
        pub(crate) calls: Rc<Cell<usize>>,
    }

    impl BandwidthListener for MockBandwidth {
        fn params_changed(&mut self, _params: &NetParams<i32>) {
            self.calls.set(self.calls.get() + 1);
        }
    }

    /// A settable clock.
    #[derive(Clone)]
    pub(crate) struct TestClock {
        /// The current fake time.
        now: Rc<Cell<SystemTime>>,
    }

    impl Default for TestClock {
        fn default() -> Self {
            TestClock {
                now: Rc::new(Cell::new(t(1_000_000))),
            }
        }
    }

    impl TestClock {
        /// Set the fake time.
        pub(crate) fn set(&self, now: SystemTime) {
            self.now.set(now);
        }
    }

    impl WallClock for TestClock {
        fn now(&self) -> SystemTime {
            self.now.get()
        }
    }

    /// Make the content digests for a test consensus.
    fn digests_for(va_secs: u64, flavor: Flavor) -> DocDigests {
        let mut digests = DocDigests::default();
        match flavor {
            Flavor::Microdesc => {
                let mut d = [0x51_u8; 32];
                d[..8].copy_from_slice(&va_secs.to_be_bytes());
                digests.sha256 = Some(d);
            }
            Flavor::Ns => {
                let mut d = [0x52_u8; 20];
                d[..8].copy_from_slice(&va_secs.to_be_bytes());
                digests.sha1 = Some(d);
            }
        }
        digests
    }

    /// A descriptor digest derived from a relay id byte and a
    /// valid-after time.
    fn desc32(id_byte: u8, va_secs: u64) -> [u8; 32] {
        let mut d = [id_byte; 32];
        d[24..].copy_from_slice(&va_secs.to_be_bytes());
        d
    }

    /// Build one relay row.
    fn relay_row(
        nickname: &str,
        identity: [u8; 20],
        desc_digest: DescDigest,
        flags: RelayFlags,
    ) -> RouterStatus {
        let addr: IpAddr = "203.0.113.5".parse().unwrap();
        RouterStatus {
            identity: IdDigest::from(identity),
            desc_digest,
            nickname: nickname.to_string(),
            addr,
            or_port: 9001,
            dir_port: 9030,
            flags,
            protocaps: ProtoCaps::from_bits(0b111),
            dl_status: DownloadStatus::default(),
            last_dir_503_at: None,
        }
    }

    /// Build a consensus signed (validly) by every one of `voters`.
    ///
    /// The lifetime is one hour fresh and three hours valid, starting
    /// at `va_secs`; the relay list has three fixed rows.
    pub(crate) fn signed_consensus(
        voters: &[Authority],
        va_secs: u64,
        flavor: Flavor,
    ) -> Consensus {
        let lifetime = Lifetime::new(
            t(va_secs),
            t(va_secs + 3600),
            t(va_secs + 3 * 3600),
        )
        .unwrap();
        let digests = digests_for(va_secs, flavor);
        let alg = match flavor {
            Flavor::Microdesc => DigestAlg::Sha256,
            Flavor::Ns => DigestAlg::Sha1,
        };
        let doc_digest = digests.get(alg).unwrap().to_vec();

        let mut consensus = Consensus::new(flavor, lifetime, digests);
        for auth in voters {
            let id = *auth.v3ident();
            consensus.voters.push(Voter {
                identity: id,
                nickname: auth.name().to_string(),
                address: "198.51.100.1".to_string(),
                contact: String::new(),
                signatures: vec![VoterSignature {
                    alg,
                    identity: id,
                    signing_key_digest: auth_sk_digest(&id),
                    signature: sign(&auth_signing_key(&id), &doc_digest),
                    good_signature: false,
                    bad_signature: false,
                }],
            });
        }
        consensus.relays = vec![
            relay_row(
                "alpha",
                [0x10; 20],
                DescDigest::Sha256(desc32(0x10, va_secs)),
                RelayFlags::RUNNING
                    | RelayFlags::VALID
                    | RelayFlags::FAST
                    | RelayFlags::NAMED
                    | RelayFlags::GUARD,
            ),
            relay_row(
                "beta",
                [0x20; 20],
                DescDigest::Sha256(desc32(0x20, va_secs)),
                RelayFlags::RUNNING | RelayFlags::UNNAMED,
            ),
            relay_row(
                "gamma",
                [0x30; 20],
                DescDigest::Sha256(desc32(0x30, va_secs)),
                RelayFlags::RUNNING | RelayFlags::V2DIR,
            ),
        ];
        consensus.params.set("circwindow".to_string(), 1000);
        consensus.client_versions = vec![env!("CARGO_PKG_VERSION").to_string()];
        consensus
    }

    /// Build a microdesc-flavored consensus with the given
    /// `(nickname, identity, flags)` rows.
    pub(crate) fn consensus_with_relays(
        rows: &[(&str, [u8; 20], RelayFlags)],
    ) -> Consensus {
        let lifetime = Lifetime::new(t(1000), t(4600), t(11800)).unwrap();
        let mut consensus =
            Consensus::new(Flavor::Microdesc, lifetime, digests_for(1000, Flavor::Microdesc));
        let mut relays: Vec<RouterStatus> = rows
            .iter()
            .map(|(nickname, identity, flags)| {
                relay_row(
                    nickname,
                    *identity,
                    DescDigest::Sha256([identity[0]; 32]),
                    *flags,
                )
            })
            .collect();
        relays.sort_by(|a, b| a.identity.cmp(&b.identity));
        consensus.relays = relays;
        consensus
    }

    /// Build a microdesc-flavored consensus with explicit descriptor
    /// digests.
    pub(crate) fn consensus_with_md_relays(
        rows: &[([u8; 20], DescDigest, RelayFlags)],
    ) -> Consensus {
        let lifetime = Lifetime::new(t(1000), t(4600), t(11800)).unwrap();
        let mut consensus =
            Consensus::new(Flavor::Microdesc, lifetime, digests_for(1000, Flavor::Microdesc));
        let mut relays: Vec<RouterStatus> = rows
            .iter()
            .enumerate()
            .map(|(i, (identity, desc, flags))| {
                relay_row(&format!("relay{}", i), *identity, *desc, *flags)
            })
            .collect();
        relays.sort_by(|a, b| a.identity.cmp(&b.identity));
        consensus.relays = relays;
        consensus
    }

    /// A [`DirMgr`] wired to fakes, plus handles to all of them.
    pub(crate) struct TestMgr {
        /// The directory manager under test.
        pub(crate) mgr: DirMgr,
        /// Shared handle to the certificate store.
        pub(crate) certs: MockCertStore,
        /// Shared handle to the parser.
        pub(crate) parser: MockParser,
        /// Shared handle to the transport.
        pub(crate) transport: MockTransport,
        /// Shared handle to the node list.
        pub(crate) nodes: MockNodes,
        /// Shared handle to the event log.
        pub(crate) events: EventLog,
        /// Shared handle to the bandwidth listener.
        pub(crate) bandwidth: MockBandwidth,
        /// Shared handle to the clock.
        pub(crate) clock: TestClock,
        /// The data directory, kept alive for the fixture's lifetime.
        pub(crate) tempdir: Rc<TempDir>,
    }

    impl TestMgr {
        /// Register `consensus` with the parser under fabricated bytes
        /// and return those bytes.
        pub(crate) fn register_consensus(&self, consensus: &Consensus) -> Vec<u8> {
            let digest_hex = match (&consensus.digests.sha256, &consensus.digests.sha1) {
                (Some(d), _) => hex::encode(d),
                (None, Some(d)) => hex::encode(d),
                (None, None) => "nodigest".to_string(),
            };
            let bytes = format!("consensus/{}/{}\n", consensus.flavor, digest_hex).into_bytes();
            self.parser.register(bytes.clone(), consensus.clone());
            bytes
        }
    }

    /// Build a [`TestMgr`] with default (client, microdesc-flavored)
    /// configuration and the given authorities.
    pub(crate) fn new_mgr(authorities: &[Authority]) -> TestMgr {
        let tempdir = Rc::new(TempDir::new().unwrap());
        new_mgr_at(authorities, tempdir)
    }

    /// Build a [`TestMgr`] over an existing data directory.
    pub(crate) fn new_mgr_at(authorities: &[Authority], tempdir: Rc<TempDir>) -> TestMgr {
        let certs = MockCertStore::default();
        let parser = MockParser::new();
        let transport = MockTransport::default();
        let nodes = MockNodes::default();
        let events = EventLog::default();
        let bandwidth = MockBandwidth::default();
        let clock = TestClock::default();

        let config = DirMgrConfig {
            data_dir: tempdir.path().into(),
            mistrust: fs_mistrust::Mistrust::new_dangerously_trust_everyone(),
            authorities: authorities.to_vec(),
            ..DirMgrConfig::default()
        };
        let mgr = DirMgr::new(
            config,
            Externals {
                parser: Arc::new(parser.clone()),
                certs: Box::new(certs.clone()),
                verifier: Arc::new(MockVerifier),
                transport: Box::new(transport.clone()),
                nodes: Box::new(nodes.clone()),
                events: Box::new(events.clone()),
                bandwidth: Box::new(bandwidth.clone()),
                clock: Box::new(clock.clone()),
            },
        )
        .unwrap();

        TestMgr {
            mgr,
            certs,
            parser,
            transport,
            nodes,
            events,
            bandwidth,
            clock,
            tempdir,
        }
    }

    /// Rebuild a fixture over the same data directory and parser, as
    /// if the process had restarted.
    pub(crate) fn reopen(fixture: TestMgr) -> TestMgr {
        let TestMgr {
            mgr,
            certs,
            parser,
            transport,
            nodes,
            events,
            bandwidth,
            clock,
            tempdir,
        } = fixture;
        let authorities = mgr.config.authorities.clone();
        drop(mgr);

        let config = DirMgrConfig {
            data_dir: tempdir.path().into(),
            mistrust: fs_mistrust::Mistrust::new_dangerously_trust_everyone(),
            authorities,
            ..DirMgrConfig::default()
        };
        let mgr = DirMgr::new(
            config,
            Externals {
                parser: Arc::new(parser.clone()),
                certs: Box::new(certs.clone()),
                verifier: Arc::new(MockVerifier),
                transport: Box::new(transport.clone()),
                nodes: Box::new(nodes.clone()),
                events: Box::new(events.clone()),
                bandwidth: Box::new(bandwidth.clone()),
                clock: Box::new(clock.clone()),
            },
        )
        .unwrap();

        TestMgr {
            mgr,
            certs,
            parser,
            transport,
            nodes,
            events,
            bandwidth,
            clock,
            tempdir,
        }
    }

    mod mgr_tests {
        use super::*;
        use crate::state::SetConsensusOptions;

        #[test]
        fn tick_launches_consensus_fetch() {
            let authorities = make_authorities(3);
            let mut fixture = new_mgr(&authorities);
            fixture.clock.set(t(1_000_000));

            // No consensus at all: the usable flavor is fetched, and
            // only that one.
            fixture.mgr.tick();
            assert!(fixture.transport.launched_consensus(Flavor::Microdesc));
            assert!(!fixture.transport.launched_consensus(Flavor::Ns));

            // A request already in flight suppresses relaunching.
            fixture.transport.clear();
            fixture.transport.inflight.borrow_mut().push((
                FetchPurpose::Consensus,
                Resource::Consensus {
                    flavor: Flavor::Microdesc,
                },
            ));
            fixture.mgr.tick();
            assert!(!fixture.transport.launched_consensus(Flavor::Microdesc));

            // Backoff also suppresses.
            fixture.transport.inflight.borrow_mut().clear();
            fixture.mgr.note_consensus_download_failed(Flavor::Microdesc, 404);
            fixture.mgr.tick();
            assert!(!fixture.transport.launched_consensus(Flavor::Microdesc));
        }

        #[test]
        fn tick_respects_next_download_time() {
            let authorities = make_authorities(3);
            let mut fixture = new_mgr(&authorities);
            fixture.clock.set(t(1_000_100));
            for auth in &authorities[..2] {
                fixture.certs.add_cert_for(auth, t(99_000_000));
            }

            let consensus = signed_consensus(&authorities, 1_000_000, Flavor::Microdesc);
            let bytes = fixture.register_consensus(&consensus);
            fixture
                .mgr
                .set_current_consensus(&bytes, Flavor::Microdesc, SetConsensusOptions::default())
                .unwrap();
            fixture.transport.clear();

            // Live consensus, scheduled time in the future: no fetch.
            fixture.mgr.tick();
            assert!(!fixture.transport.launched_consensus(Flavor::Microdesc));

            // Jump past the scheduled time (but stay inside the
            // lifetime): fetch.
            let next = fixture
                .mgr
                .sched
                .consensus
                .get(Flavor::Microdesc)
                .next_download_time
                .unwrap();
            fixture.clock.set(next + Duration::from_secs(1));
            fixture.mgr.tick();
            assert!(fixture.transport.launched_consensus(Flavor::Microdesc));
        }

        #[test]
        fn tick_fetches_missing_microdescs() {
            let authorities = make_authorities(3);
            let mut fixture = new_mgr(&authorities);
            fixture.clock.set(t(1_000_100));
            for auth in &authorities[..2] {
                fixture.certs.add_cert_for(auth, t(99_000_000));
            }

            let consensus = signed_consensus(&authorities, 1_000_000, Flavor::Microdesc);
            let bytes = fixture.register_consensus(&consensus);
            fixture
                .mgr
                .set_current_consensus(&bytes, Flavor::Microdesc, SetConsensusOptions::default())
                .unwrap();
            fixture.transport.clear();

            fixture.mgr.tick();
            let launched = fixture.transport.launched.borrow();
            let md_batches: Vec<_> = launched
                .iter()
                .filter(|(p, _)| *p == FetchPurpose::Microdescs)
                .collect();
            assert_eq!(md_batches.len(), 1);
            match &md_batches[0].1 {
                Resource::Microdescs(digests) => assert_eq!(digests.len(), 3),
                other => panic!("unexpected resource {:?}", other),
            }
        }

        #[test]
        fn received_microdescs_feed_cache_and_nodes() {
            let authorities = make_authorities(3);
            let mut fixture = new_mgr(&authorities);
            fixture.clock.set(t(1_000_100));
            for auth in &authorities[..2] {
                fixture.certs.add_cert_for(auth, t(99_000_000));
            }

            let consensus = signed_consensus(&authorities, 1_000_000, Flavor::Microdesc);
            let bytes = fixture.register_consensus(&consensus);
            fixture
                .mgr
                .set_current_consensus(&bytes, Flavor::Microdesc, SetConsensusOptions::default())
                .unwrap();

            // Receive the first relay's descriptor; ask for the first
            // two.
            let wanted: Vec<MdDigest> = consensus
                .relays
                .iter()
                .filter_map(|rs| rs.desc_digest.as_md_digest().copied())
                .collect();
            let body = {
                let mut b = format!("md {} payload\n", hex::encode(wanted[0]));
                b.push_str("md ");
                b.push_str(&hex::encode([0xCC; 32]));
                b.push_str(" unwanted\n");
                b.into_bytes()
            };
            let mut requested: HashSet<MdDigest> =
                [wanted[0], wanted[1]].into_iter().collect();
            let n = fixture.mgr.receive_microdescs(&body, &mut requested).unwrap();
            assert_eq!(n, 1);

            // The unrequested descriptor was dropped; the request set
            // still wants the second digest.
            assert_eq!(requested.len(), 1);
            assert!(requested.contains(&wanted[1]));
            assert!(fixture.mgr.microdesc_cache().lookup(&wanted[0]).is_some());
            assert!(fixture.mgr.microdesc_cache().lookup(&[0xCC; 32]).is_none());
            assert_eq!(fixture.nodes.md_added.borrow().as_slice(), &[wanted[0]]);

            // The missing list no longer includes the received one.
            fixture.transport.clear();
            fixture.mgr.tick();
            let launched = fixture.transport.launched.borrow();
            let md_req = launched
                .iter()
                .find(|(p, _)| *p == FetchPurpose::Microdescs)
                .cloned();
            match md_req {
                Some((_, Resource::Microdescs(digests))) => {
                    assert_eq!(digests.len(), 2);
                    assert!(!digests.contains(&wanted[0]));
                }
                other => panic!("unexpected launch {:?}", other),
            }
        }

        #[test]
        fn v2_refresh_for_caches() {
            let authorities = make_authorities(3);
            let mut fixture = new_mgr(&authorities);
            fixture.mgr.config.cache = true;
            fixture.clock.set(t(1_000_000));

            fixture.mgr.tick();
            assert_eq!(fixture.transport.n_launched(FetchPurpose::V2Status), 1);

            // Not due again within the hour.
            fixture.transport.clear();
            fixture.clock.set(t(1_000_000 + 600));
            fixture.mgr.tick();
            assert_eq!(fixture.transport.n_launched(FetchPurpose::V2Status), 0);

            fixture.clock.set(t(1_000_000 + 3600));
            fixture.mgr.tick();
            assert_eq!(fixture.transport.n_launched(FetchPurpose::V2Status), 1);
        }

        #[test]
        fn v2_refresh_for_authorities() {
            let authorities = make_authorities(4);
            let mut fixture = new_mgr(&authorities);
            fixture.mgr.config.cache = true;
            fixture.mgr.config.authority = true;
            fixture.mgr.config.own_identity = Some(*authorities[0].v3ident());
            fixture.clock.set(t(1_000_000));

            fixture.mgr.tick();
            // One per-fingerprint fetch per *other* v2 authority.
            assert_eq!(fixture.transport.n_launched(FetchPurpose::V2Status), 3);
        }

        #[test]
        fn reload_round_trip() {
            let authorities = make_authorities(3);
            let mut fixture = new_mgr(&authorities);
            fixture.clock.set(t(1_000_100));
            for auth in &authorities[..2] {
                fixture.certs.add_cert_for(auth, t(99_000_000));
            }

            let consensus = signed_consensus(&authorities, 1_000_000, Flavor::Microdesc);
            let bytes = fixture.register_consensus(&consensus);
            fixture
                .mgr
                .set_current_consensus(&bytes, Flavor::Microdesc, SetConsensusOptions::default())
                .unwrap();

            // Restart: the persisted consensus is loaded and
            // installed again.
            let mut fixture = reopen(fixture);
            fixture.clock.set(t(1_000_200));
            assert!(fixture.mgr.consensus(Flavor::Microdesc).is_none());
            fixture.mgr.load_from_disk();
            let cur = fixture.mgr.consensus(Flavor::Microdesc).unwrap();
            assert_eq!(cur.lifetime.valid_after(), t(1_000_000));
        }

        #[test]
        fn fallback_consensus_seed() {
            let authorities = make_authorities(3);
            let mut fixture = new_mgr(&authorities);
            for auth in &authorities[..2] {
                fixture.certs.add_cert_for(auth, t(99_000_000));
            }

            // A long-expired consensus sits in the fallback file.
            let consensus = signed_consensus(&authorities, 1_000_000, Flavor::Microdesc);
            let bytes = fixture.register_consensus(&consensus);
            let path = fixture.tempdir.path().join("fallback-consensus");
            std::fs::write(&path, &bytes).unwrap();
            fixture.mgr.config.fallback_networkstatus_file = Some(path.clone());

            // Far in the future, the fallback is obsolete but (by
            // default) still accepted as a seed.
            fixture.clock.set(t(9_000_000));
            fixture.mgr.load_from_disk();
            assert!(fixture.mgr.consensus(Flavor::Microdesc).is_some());
            assert!(fixture.mgr.live_consensus(Flavor::Microdesc).is_none());

            // With the gate turned off, the fallback is rejected.
            let mut fixture2 = reopen(fixture);
            fixture2.clock.set(t(9_000_000));
            fixture2.mgr.config.fallback_networkstatus_file = Some(path);
            fixture2.mgr.config.fallback_accepts_obsolete = false;
            // Remove what the first run persisted, so only the
            // fallback could seed us.
            fixture2.mgr.store.delete("cached-microdesc-consensus").unwrap();
            fixture2.mgr.load_from_disk();
            assert!(fixture2.mgr.consensus(Flavor::Microdesc).is_none());
        }

        #[test]
        fn bandwidth_and_nodes_notified_on_install() {
            let authorities = make_authorities(3);
            let mut fixture = new_mgr(&authorities);
            fixture.clock.set(t(1_000_100));
            for auth in &authorities[..2] {
                fixture.certs.add_cert_for(auth, t(99_000_000));
            }

            let consensus = signed_consensus(&authorities, 1_000_000, Flavor::Microdesc);
            let bytes = fixture.register_consensus(&consensus);
            fixture
                .mgr
                .set_current_consensus(&bytes, Flavor::Microdesc, SetConsensusOptions::default())
                .unwrap();

            assert_eq!(fixture.nodes.consensus_count.get(), 1);
            assert_eq!(fixture.bandwidth.calls.get(), 1);

            // Our version is listed as recommended, so no warning.
            assert!(!fixture.events.contains("DANGEROUS_VERSION"));
        }

        #[test]
        fn unrecommended_version_warns_once() {
            let authorities = make_authorities(3);
            let mut fixture = new_mgr(&authorities);
            fixture.clock.set(t(1_000_100));
            for auth in &authorities[..2] {
                fixture.certs.add_cert_for(auth, t(99_000_000));
            }

            let mut consensus = signed_consensus(&authorities, 1_000_000, Flavor::Microdesc);
            consensus.client_versions = vec!["99.9.9".to_string()];
            let bytes = fixture.register_consensus(&consensus);
            fixture
                .mgr
                .set_current_consensus(&bytes, Flavor::Microdesc, SetConsensusOptions::default())
                .unwrap();
            assert!(fixture.events.contains("DANGEROUS_VERSION"));

            // A second install does not warn again.
            let before = fixture.events.len();
            let mut newer = signed_consensus(&authorities, 1_003_600, Flavor::Microdesc);
            newer.client_versions = vec!["99.9.9".to_string()];
            let bytes = fixture.register_consensus(&newer);
            fixture.clock.set(t(1_003_700));
            fixture
                .mgr
                .set_current_consensus(&bytes, Flavor::Microdesc, SetConsensusOptions::default())
                .unwrap();
            let dangerous_after: usize = fixture.events.len() - before;
            // Events were emitted for the install, but no second
            // DANGEROUS_VERSION among them.
            assert!(dangerous_after >= 1);
            let all = fixture.events.events.borrow();
            let n_dangerous = all
                .iter()
                .filter(|e| matches!(e, DirEvent::GeneralStatus { message, .. } if message.contains("DANGEROUS_VERSION")))
                .count();
            assert_eq!(n_dangerous, 1);
        }
    }
}
