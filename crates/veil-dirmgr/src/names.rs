//! The `named` and `unnamed` nickname maps.
//!
//! Authorities may bind a nickname to one identity (`Named`) or assert
//! that a nickname belongs to somebody other than its bearer
//! (`Unnamed`).  We rebuild both maps from scratch on every install of
//! the usable consensus flavor; lookups are case-insensitive.

use std::collections::{HashMap, HashSet};

use crate::docs::{Consensus, IdDigest};

/// Nickname maps derived from the current consensus.
#[derive(Clone, Debug, Default)]
pub struct NicknameMaps {
    /// Map from lowercased nickname to the identity it is bound to.
    named: HashMap<String, IdDigest>,
    /// Lowercased nicknames asserted to belong to somebody else.
    unnamed: HashSet<String>,
}

impl NicknameMaps {
    /// Build fresh maps by scanning the router-status list of
    /// `consensus`.
    pub fn from_consensus(consensus: &Consensus) -> Self {
        let mut maps = NicknameMaps::default();
        for rs in &consensus.relays {
            let lc = rs.nickname.to_lowercase();
            if rs.is_named() {
                maps.named.insert(lc, rs.identity);
            } else if rs.is_unnamed() && !maps.named.contains_key(&lc) {
                // Keep the maps disjoint even if a document tries to
                // claim a nickname both ways.
                maps.unnamed.insert(lc);
            }
        }
        // A nickname bound by a later row must not linger in unnamed.
        maps.unnamed.retain(|n| !maps.named.contains_key(n));
        maps
    }

    /// Return the identity bound to `nickname`, if the authorities have
    /// bound it.
    pub fn lookup_named(&self, nickname: &str) -> Option<&IdDigest> {
        self.named.get(&nickname.to_lowercase())
    }

    /// Return true if the authorities assert that `nickname` belongs to
    /// somebody other than its bearer.
    pub fn is_unnamed(&self, nickname: &str) -> bool {
        self.unnamed.contains(&nickname.to_lowercase())
    }

    /// Return the number of bound nicknames.
    pub fn n_named(&self) -> usize {
        self.named.len()
    }

    /// Return the number of disavowed nicknames.
    pub fn n_unnamed(&self) -> usize {
        self.unnamed.len()
    }
}
