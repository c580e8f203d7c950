//! The legacy per-authority ("v2") status cache.
//!
//! Directory caches keep one v2 status document per trusted v2
//! authority, so that old clients can still bootstrap from us.  We
//! never use these documents ourselves; we just store, serve, and
//! expire them.

use std::time::SystemTime;

use tracing::{debug, warn};

use crate::authority::Authority;
use crate::docs::IdDigest;
use crate::event::{DirEvent, EventSink, Severity};
use crate::external::DocParser;
use crate::storage::Store;
use crate::{Error, Result, NETWORKSTATUS_ALLOW_SKEW};

/// One cached v2 status document.
#[derive(Clone, Debug)]
pub struct V2Status {
    /// The authority that published the document.
    identity: IdDigest,
    /// The publication time the document claims.
    published_on: SystemTime,
    /// When we received it (clamped to our own clock).
    received_at: SystemTime,
    /// The raw document.
    bytes: Vec<u8>,
}

impl V2Status {
    /// Return the identity of the publishing authority.
    pub fn identity(&self) -> &IdDigest {
        &self.identity
    }

    /// Return the document's claimed publication time.
    pub fn published_on(&self) -> SystemTime {
        self.published_on
    }

    /// Return when we received the document.
    pub fn received_at(&self) -> SystemTime {
        self.received_at
    }

    /// Return the raw document bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// The in-memory v2 status list, sorted by publication time for
/// deterministic iteration.
pub struct V2StatusCache {
    /// The cached documents.
    docs: Vec<V2Status>,
}

impl V2StatusCache {
    /// Create an empty cache.
    pub(crate) fn new() -> Self {
        V2StatusCache { docs: Vec::new() }
    }

    /// Load cached v2 documents from the `cached-status` directory.
    ///
    /// Files that can't be read or parsed, or that belong to
    /// authorities we no longer recognize, are skipped with a warning.
    pub(crate) fn load(store: &Store, parser: &dyn DocParser, authorities: &[Authority]) -> Self {
        let mut cache = V2StatusCache::new();
        let names = match store.list_v2() {
            Ok(names) => names,
            Err(e) => {
                warn!("Unable to list v2 status directory: {}", e);
                return cache;
            }
        };
        for name in names {
            let bytes = match store.load_v2(&name) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Unable to read v2 status {}: {}", name, e);
                    continue;
                }
            };
            let parsed = match parser.v2_status(bytes.as_ref()) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("Ignoring unparseable v2 status {}: {}", name, e);
                    continue;
                }
            };
            if !is_v2_authority(authorities, &parsed.identity) {
                debug!(
                    "Ignoring cached v2 status from unrecognized authority {}",
                    parsed.identity
                );
                continue;
            }
            cache.docs.push(V2Status {
                identity: parsed.identity,
                published_on: parsed.published_on,
                received_at: parsed.published_on,
                bytes: bytes.as_ref().to_vec(),
            });
        }
        cache.sort();
        cache
    }

    /// Handle a v2 status document arriving from the network.
    ///
    /// Returns `Ok(true)` if the document was kept, `Ok(false)` if it
    /// was an uninteresting older copy.
    pub(crate) fn handle_status(
        &mut self,
        bytes: &[u8],
        parser: &dyn DocParser,
        requested: bool,
        authorities: &[Authority],
        now: SystemTime,
        store: &Store,
        events: &mut dyn EventSink,
    ) -> Result<bool> {
        let parsed = parser.v2_status(bytes).map_err(Error::BadParse)?;

        if parsed.published_on > now + NETWORKSTATUS_ALLOW_SKEW {
            warn!(
                "v2 status from {} claims to be published far in the future; \
                 our clock may be wrong",
                parsed.identity
            );
            events.emit(DirEvent::GeneralStatus {
                severity: Severity::Warn,
                message: crate::event::clock_skew_message(
                    crate::event::skew_seconds(parsed.published_on, now),
                    "NETWORKSTATUS",
                ),
            });
            return Err(Error::ClockSkew);
        }
        if !requested {
            return Err(Error::Unwanted("v2 status we didn't request"));
        }
        if !is_v2_authority(authorities, &parsed.identity) {
            return Err(Error::Unwanted("v2 status from unrecognized authority"));
        }

        if let Some(existing) = self.docs.iter().position(|d| d.identity == parsed.identity) {
            if self.docs[existing].published_on >= parsed.published_on {
                debug!(
                    "Dropping v2 status from {}: not newer than the one we have",
                    parsed.identity
                );
                return Ok(false);
            }
            self.docs.remove(existing);
        }

        store.save_v2(&parsed.identity.to_hex(), bytes)?;
        self.docs.push(V2Status {
            identity: parsed.identity,
            published_on: parsed.published_on,
            received_at: now,
            bytes: bytes.to_vec(),
        });
        self.sort();
        Ok(true)
    }

    /// Remove (from memory and disk) every document older than
    /// `max_age`.
    pub(crate) fn expire(&mut self, now: SystemTime, max_age: std::time::Duration, store: &Store) {
        let cutoff = now - max_age;
        let mut keep = Vec::new();
        for doc in self.docs.drain(..) {
            if doc.published_on < cutoff {
                if let Err(e) = store.delete_v2(&doc.identity.to_hex()) {
                    warn!("Unable to remove expired v2 status: {}", e);
                }
                debug!("Expired v2 status from {}", doc.identity);
            } else {
                keep.push(doc);
            }
        }
        self.docs = keep;
    }

    /// Iterate over the cached documents, oldest publication first.
    pub fn iter(&self) -> impl Iterator<Item = &V2Status> {
        self.docs.iter()
    }

    /// Return the number of cached documents.
    pub fn len(&self) -> usize {
        self.docs.len()
    }

    /// Return true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Restore the sort order: by publication time, then identity.
    fn sort(&mut self) {
        self.docs
            .sort_by(|a, b| (a.published_on, a.identity).cmp(&(b.published_on, b.identity)));
    }
}

/// Return true if `identity` belongs to a recognized v2 authority.
fn is_v2_authority(authorities: &[Authority], identity: &IdDigest) -> bool {
    authorities
        .iter()
        .any(|a| a.is_v2() && a.v3ident() == identity)
}
