//! The microdescriptor cache.
//!
//! Microdescriptors live in two files: a main cache file
//! (`cached-microdescs`), which we map into memory and reference
//! bodies from in place, and an append-only journal
//! (`cached-microdescs.new`) that newly downloaded descriptors are
//! written to.  When the journal gets large relative to the amount of
//! live data, we compact: rewrite the main file with only the
//! surviving descriptors, truncate the journal, and rebind every body
//! to its new offset.
//!
//! Each on-disk entry is optionally preceded by a
//! `@last-listed <time>` annotation recording when a consensus last
//! referenced the descriptor; that is what lets us expire descriptors
//! that no consensus mentions any more.

use std::collections::{HashMap, HashSet};
use std::time::SystemTime;

use time::format_description::FormatItem;
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, info, trace, warn};

use crate::docs::{Consensus, MdDigest};
use crate::external::{DocParser, NodeList, ParsedMd};
use crate::storage::{LoadedBytes, Store, MD_CACHE_FNAME, MD_JOURNAL_FNAME};
use crate::{Result, TOLERATE_MICRODESC_AGE};

/// Rebuild is never worthwhile while the journal is smaller than this.
const JOURNAL_REBUILD_MIN: u64 = 16 * 1024;

/// The time format used in `@last-listed` annotations.
const LISTED_TIME_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Render `t` the way `@last-listed` annotations spell times.
pub(crate) fn format_listed_time(t: SystemTime) -> String {
    OffsetDateTime::from(t)
        .format(&LISTED_TIME_FORMAT)
        .expect("fixed time format failed")
}

/// Parse a time in the `@last-listed` spelling.
pub(crate) fn parse_listed_time(s: &str) -> Option<SystemTime> {
    PrimitiveDateTime::parse(s, &LISTED_TIME_FORMAT)
        .ok()
        .map(|p| p.assume_utc().into())
}

/// Where a cached microdescriptor's body currently lives on disk.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum SavedLocation {
    /// In the main cache file.
    InCache,
    /// In the append journal.
    InJournal,
    /// Not saved anywhere.
    Nowhere,
}

/// A microdescriptor body: either owned bytes, or a span within the
/// mapped main cache file.
#[derive(Debug)]
enum MdBody {
    /// Bytes held in memory.
    Owned(Box<[u8]>),
    /// A span of the mapped main cache file.
    InCacheFile {
        /// Byte offset of the body within the file.
        off: usize,
        /// Length of the body.
        len: usize,
    },
}

/// One cached microdescriptor.
#[derive(Debug)]
pub struct Microdesc {
    /// The descriptor's digest, which is also its map key.
    digest: MdDigest,
    /// Where the body bytes are.
    body: MdBody,
    /// The last time a consensus listed this descriptor.
    last_listed: SystemTime,
    /// Which file, if any, holds the body.
    saved_location: SavedLocation,
    /// True while this descriptor is the value for its key in the map.
    held_in_map: bool,
    /// How many external nodes currently point at this descriptor.
    held_by_nodes: u32,
    /// If set, skip this descriptor when rewriting the cache file.
    no_save: bool,
}

impl Microdesc {
    /// Return this descriptor's digest.
    pub fn digest(&self) -> &MdDigest {
        &self.digest
    }

    /// Return the last time a consensus listed this descriptor.
    pub fn last_listed(&self) -> SystemTime {
        self.last_listed
    }

    /// Return which file, if any, holds this descriptor's body.
    pub fn saved_location(&self) -> SavedLocation {
        self.saved_location
    }

    /// Return how many external nodes point at this descriptor.
    pub fn held_by_nodes(&self) -> u32 {
        self.held_by_nodes
    }

    /// Return true while this descriptor is present in the cache map.
    pub fn held_in_map(&self) -> bool {
        self.held_in_map
    }

    /// Return the length of the body in bytes.
    pub fn body_len(&self) -> usize {
        match &self.body {
            MdBody::Owned(b) => b.len(),
            MdBody::InCacheFile { len, .. } => *len,
        }
    }

    /// Return the body's offset in the main cache file, if it lives
    /// there.
    pub fn cache_offset(&self) -> Option<usize> {
        match &self.body {
            MdBody::InCacheFile { off, .. } => Some(*off),
            MdBody::Owned(_) => None,
        }
    }
}

/// The in-memory index over both microdescriptor files.
pub struct MicrodescCache {
    /// Every cached descriptor, keyed by digest.
    map: HashMap<MdDigest, Microdesc>,
    /// The mapped contents of the main cache file, if loaded.
    cache_bytes: Option<LoadedBytes>,
    /// Length of the main cache file.
    cache_len: u64,
    /// Length of the journal file.
    journal_len: u64,
    /// How many on-disk bytes belong to dropped or superseded entries.
    bytes_dropped: u64,
    /// Total body bytes ever offered to `add_parsed` (statistics only).
    total_len_seen: u64,
    /// Total number of descriptors ever offered (statistics only).
    n_seen: u32,
    /// Whether new descriptors get appended to the journal.
    journaling: bool,
}

impl MicrodescCache {
    /// Create a new empty cache that journals new descriptors.
    pub(crate) fn new() -> Self {
        MicrodescCache {
            map: HashMap::new(),
            cache_bytes: None,
            cache_len: 0,
            journal_len: 0,
            bytes_dropped: 0,
            total_len_seen: 0,
            n_seen: 0,
            journaling: true,
        }
    }

    /// Load the cache from disk, tolerating unreadable or unparseable
    /// files: worst case we start with an empty cache and re-download.
    pub(crate) fn load(store: &Store, parser: &dyn DocParser) -> Self {
        let mut cache = MicrodescCache::new();

        match store.load(MD_CACHE_FNAME) {
            Ok(Some(bytes)) => match parser.microdescs(bytes.as_ref(), true) {
                Ok(entries) => {
                    cache.cache_len = bytes.as_ref().len() as u64;
                    for e in entries {
                        cache.insert_loaded(&e, None, SavedLocation::InCache);
                    }
                    cache.cache_bytes = Some(bytes);
                    debug!(
                        "Loaded {} microdescriptors from the cache file",
                        cache.map.len()
                    );
                }
                Err(e) => warn!("Ignoring unparseable microdescriptor cache: {}", e),
            },
            Ok(None) => {}
            Err(e) => warn!("Unable to read microdescriptor cache: {}", e),
        }

        match store.load(MD_JOURNAL_FNAME) {
            Ok(Some(bytes)) => {
                cache.journal_len = bytes.as_ref().len() as u64;
                match parser.microdescs(bytes.as_ref(), true) {
                    Ok(entries) => {
                        let n_before = cache.map.len();
                        for e in entries {
                            cache.insert_loaded(&e, Some(bytes.as_ref()), SavedLocation::InJournal);
                        }
                        debug!(
                            "Loaded {} microdescriptors from the journal",
                            cache.map.len() - n_before
                        );
                    }
                    Err(e) => warn!("Ignoring unparseable microdescriptor journal: {}", e),
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Unable to read microdescriptor journal: {}", e),
        }

        cache
    }

    /// Helper: insert one descriptor found while loading a file.
    ///
    /// With `input` set, the body is copied out of it (journal
    /// entries); otherwise the body is referenced in place in the main
    /// cache file.
    fn insert_loaded(&mut self, e: &ParsedMd, input: Option<&[u8]>, location: SavedLocation) {
        let listed = e.last_listed.unwrap_or(SystemTime::UNIX_EPOCH);
        if let Some(existing) = self.map.get_mut(&e.digest) {
            existing.last_listed = existing.last_listed.max(listed);
            // The duplicate's on-disk bytes are reclaimable.
            self.bytes_dropped += e.len as u64;
            return;
        }
        let body = match input {
            Some(input) => {
                let Some(bytes) = input.get(e.off..e.off + e.len) else {
                    warn!("Parser returned an out-of-range body span; dropping entry");
                    return;
                };
                MdBody::Owned(bytes.into())
            }
            None => MdBody::InCacheFile {
                off: e.off,
                len: e.len,
            },
        };
        self.map.insert(
            e.digest,
            Microdesc {
                digest: e.digest,
                body,
                last_listed: listed,
                saved_location: location,
                held_in_map: true,
                held_by_nodes: 0,
                no_save: false,
            },
        );
    }

    /// Add a batch of freshly parsed descriptors.
    ///
    /// `input` is the buffer `parsed` refers into.  Descriptors we
    /// already have get a `last_listed` bump and their new body
    /// dropped.  If `requested` is given, any descriptor not in the
    /// set is rejected as a protocol violation, and accepted digests
    /// are removed from the set.  Returns the digests actually added.
    pub(crate) fn add_parsed(
        &mut self,
        input: &[u8],
        parsed: Vec<ParsedMd>,
        location: SavedLocation,
        listed_at: SystemTime,
        mut requested: Option<&mut HashSet<MdDigest>>,
        store: Option<&Store>,
    ) -> Result<Vec<MdDigest>> {
        let mut added = Vec::new();
        for e in &parsed {
            if let Some(req) = requested.as_deref_mut() {
                if !req.remove(&e.digest) {
                    warn!(
                        "Received a microdescriptor we did not ask for: {}",
                        hex::encode(e.digest)
                    );
                    continue;
                }
            }
            self.total_len_seen += e.len as u64;
            self.n_seen += 1;

            if let Some(existing) = self.map.get_mut(&e.digest) {
                existing.last_listed = existing.last_listed.max(listed_at);
                self.bytes_dropped += e.len as u64;
                continue;
            }

            let Some(body) = input.get(e.off..e.off + e.len) else {
                warn!("Parser returned an out-of-range body span; dropping entry");
                continue;
            };

            let mut location = location;
            if self.journaling {
                if let Some(store) = store {
                    let mut entry = format!("@last-listed {}\n", format_listed_time(listed_at))
                        .into_bytes();
                    entry.extend_from_slice(body);
                    self.journal_len = store.append(MD_JOURNAL_FNAME, &entry)?;
                    location = SavedLocation::InJournal;
                }
            }

            self.map.insert(
                e.digest,
                Microdesc {
                    digest: e.digest,
                    body: MdBody::Owned(body.into()),
                    last_listed: listed_at,
                    saved_location: location,
                    held_in_map: true,
                    held_by_nodes: 0,
                    no_save: false,
                },
            );
            added.push(e.digest);
        }
        trace!(
            "Added {}/{} microdescriptors ({} seen so far, {} bytes)",
            added.len(),
            parsed.len(),
            self.n_seen,
            self.total_len_seen
        );
        Ok(added)
    }

    /// Look up a descriptor by digest.
    pub fn lookup(&self, digest: &MdDigest) -> Option<&Microdesc> {
        self.map.get(digest)
    }

    /// Return the number of cached descriptors.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Return true if the cache holds nothing.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Return the current journal length in bytes.
    pub fn journal_len(&self) -> u64 {
        self.journal_len
    }

    /// Return how many on-disk bytes are known to be reclaimable.
    pub fn bytes_dropped(&self) -> u64 {
        self.bytes_dropped
    }

    /// Return the body bytes of `md`.
    ///
    /// `md` must have come from this cache's map.
    pub fn body<'a>(&'a self, md: &'a Microdesc) -> &'a [u8] {
        match &md.body {
            MdBody::Owned(b) => b,
            MdBody::InCacheFile { off, len } => match &self.cache_bytes {
                Some(bytes) => &bytes.as_ref()[*off..off + len],
                None => {
                    debug_assert!(false, "body said InCacheFile but no cache file is mapped");
                    &[]
                }
            },
        }
    }

    /// Bump `last_listed` for every descriptor `consensus` references.
    pub(crate) fn update_listed(&mut self, consensus: &Consensus) {
        let listed_at = consensus.lifetime.valid_after();
        for rs in &consensus.relays {
            if let Some(d) = rs.desc_digest.as_md_digest() {
                if let Some(md) = self.map.get_mut(d) {
                    md.last_listed = md.last_listed.max(listed_at);
                }
            }
        }
    }

    /// Remove every descriptor whose `last_listed` precedes `cutoff`.
    ///
    /// Does nothing unless we have a live microdesc consensus or
    /// `force` is set: right after a long downtime every entry looks
    /// stale, and deleting them all would only force a re-download.
    pub(crate) fn clean(&mut self, cutoff: SystemTime, have_live_consensus: bool, force: bool) {
        if !have_live_consensus && !force {
            debug!("Not cleaning microdescriptor cache: no live consensus");
            return;
        }
        let mut remove = Vec::new();
        for (digest, md) in &self.map {
            if md.last_listed >= cutoff {
                continue;
            }
            if md.held_by_nodes != 0 {
                // Removing it now would strand those references; keep
                // the entry until the node list lets go of it.
                debug!(
                    "Keeping stale microdescriptor {}: {} node references",
                    hex::encode(digest),
                    md.held_by_nodes
                );
                continue;
            }
            remove.push(*digest);
        }
        for digest in remove {
            if let Some(mut md) = self.map.remove(&digest) {
                md.held_in_map = false;
                if md.saved_location != SavedLocation::Nowhere {
                    self.bytes_dropped += md.body_len() as u64;
                }
            }
        }
    }

    /// Return true if the journal and drop counters justify a rewrite
    /// of the main cache file.
    fn should_rebuild(&self) -> bool {
        self.journal_len >= JOURNAL_REBUILD_MIN
            && (self.bytes_dropped > (self.journal_len + self.cache_len) / 3
                || self.journal_len > self.cache_len / 2)
    }

    /// Compact the cache if it is worthwhile (or if `force` is set).
    ///
    /// Cleans first, then rewrites the main cache file with every
    /// surviving descriptor, rebinds bodies to their new offsets,
    /// truncates the journal, and resets the drop counters.  Returns
    /// true if a rewrite happened.
    pub(crate) fn rebuild_if_needed(
        &mut self,
        store: &Store,
        now: SystemTime,
        have_live_consensus: bool,
        force: bool,
    ) -> Result<bool> {
        if !force && !self.should_rebuild() {
            return Ok(false);
        }
        self.clean(now - TOLERATE_MICRODESC_AGE, have_live_consensus, force);

        // Entries we never save must not keep pointing into the file
        // we are about to replace.
        let unsaved: Vec<MdDigest> = self
            .map
            .iter()
            .filter(|(_, md)| md.no_save)
            .map(|(digest, _)| *digest)
            .collect();
        for digest in unsaved {
            let owned: Option<Box<[u8]>> = {
                let md = self.map.get(&digest).expect("digest vanished from map");
                match &md.body {
                    MdBody::InCacheFile { .. } => Some(self.body(md).into()),
                    MdBody::Owned(_) => None,
                }
            };
            if let Some(md) = self.map.get_mut(&digest) {
                if let Some(owned) = owned {
                    md.body = MdBody::Owned(owned);
                }
                md.saved_location = SavedLocation::Nowhere;
            }
        }

        // Lay the survivors out in digest order, so that rebuilds are
        // deterministic.
        let mut digests: Vec<MdDigest> = self.map.keys().copied().collect();
        digests.sort_unstable();

        let mut contents: Vec<u8> = Vec::new();
        let mut placed: Vec<(MdDigest, usize, usize)> = Vec::new();
        for digest in &digests {
            let md = self.map.get(digest).expect("digest vanished from map");
            if md.no_save {
                continue;
            }
            let annotation = format!("@last-listed {}\n", format_listed_time(md.last_listed));
            contents.extend_from_slice(annotation.as_bytes());
            let off = contents.len();
            let body = self.body(md);
            let len = body.len();
            contents.extend_from_slice(body);
            placed.push((*digest, off, len));
        }

        store.save(MD_CACHE_FNAME, &contents)?;
        // Unmap the old file before mapping its replacement.
        self.cache_bytes = None;
        self.cache_bytes = store.load(MD_CACHE_FNAME)?;
        self.cache_len = contents.len() as u64;

        for (digest, off, len) in placed {
            if let Some(md) = self.map.get_mut(&digest) {
                md.body = MdBody::InCacheFile { off, len };
                md.saved_location = SavedLocation::InCache;
            }
        }

        store.save(MD_JOURNAL_FNAME, b"")?;
        self.journal_len = 0;
        self.bytes_dropped = 0;
        info!(
            "Rebuilt microdescriptor cache: {} descriptors, {} bytes",
            self.map.len(),
            self.cache_len
        );
        Ok(true)
    }

    /// List the descriptor digests that `consensus` references but the
    /// cache lacks.
    ///
    /// With `only_ready`, digests whose download status is backing off
    /// are omitted.  Digests in `skip` and all-zero placeholders are
    /// never returned.
    pub(crate) fn missing_from(
        &self,
        consensus: &Consensus,
        now: SystemTime,
        only_ready: bool,
        skip: &HashSet<MdDigest>,
    ) -> Vec<MdDigest> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for rs in &consensus.relays {
            let Some(d) = rs.desc_digest.as_md_digest() else {
                continue;
            };
            if rs.desc_digest.is_zero()
                || self.map.contains_key(d)
                || skip.contains(d)
                || !seen.insert(*d)
            {
                continue;
            }
            if only_ready && !rs.dl_status.is_ready(now) {
                continue;
            }
            missing.push(*d);
        }
        missing
    }

    /// Note that one more node points at `digest`.
    pub fn note_node_acquired(&mut self, digest: &MdDigest) {
        if let Some(md) = self.map.get_mut(digest) {
            md.held_by_nodes += 1;
        }
    }

    /// Note that one node no longer points at `digest`.
    pub fn note_node_released(&mut self, digest: &MdDigest) {
        if let Some(md) = self.map.get_mut(digest) {
            if md.held_by_nodes == 0 {
                warn!(
                    "BUG: released a node reference on {} that was never acquired",
                    hex::encode(digest)
                );
                debug_assert!(false);
            } else {
                md.held_by_nodes -= 1;
            }
        }
    }

    /// Mark a descriptor so that compaction never writes it to the
    /// main cache file (for descriptors the host must not persist).
    pub fn mark_no_save(&mut self, digest: &MdDigest) {
        if let Some(md) = self.map.get_mut(digest) {
            md.no_save = true;
        }
    }

    /// Recompute every `held_by_nodes` counter from the node list's
    /// actual references.
    pub(crate) fn reconcile_node_refs(&mut self, nodes: &dyn NodeList) {
        let mut counts: HashMap<MdDigest, u32> = HashMap::new();
        for d in nodes.referenced_microdescs() {
            *counts.entry(d).or_insert(0) += 1;
        }
        for (digest, md) in &mut self.map {
            md.held_by_nodes = counts.get(digest).copied().unwrap_or(0);
        }
    }

    /// Test-only: disable writing new descriptors to the journal.
    #[cfg(test)]
    pub(crate) fn set_journaling(&mut self, journaling: bool) {
        self.journaling = journaling;
    }
}
