//! Identifiers for the things we fetch from the directory network.
//!
//! The transport suppresses duplicate requests keyed on a
//! `(FetchPurpose, Resource)` pair; these are those keys.

use crate::docs::{Flavor, IdDigest, MdDigest};

/// The broad purpose of a directory fetch.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum FetchPurpose {
    /// Fetching a consensus document.
    Consensus,
    /// Fetching authority signing-key certificates.
    Certificates,
    /// Fetching microdescriptors.
    Microdescs,
    /// Fetching a legacy v2 status document.
    V2Status,
}

/// The specific resource a fetch is for.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Resource {
    /// The latest consensus of one flavor.
    Consensus {
        /// Which flavor to ask for.
        flavor: Flavor,
    },
    /// A batch of microdescriptors, by digest.
    Microdescs(Vec<MdDigest>),
    /// One v2 authority's status document, requested by fingerprint.
    V2ByFingerprint(IdDigest),
    /// Every v2 status document a directory has.
    V2All,
}

/// How many microdescriptor digests to put in a single request.
pub(crate) const MAX_MD_PER_REQUEST: usize = 500;
