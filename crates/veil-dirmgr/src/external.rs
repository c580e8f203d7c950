//! Narrow traits for the collaborators this crate consumes.
//!
//! The directory manager core never parses document bytes, touches raw
//! cryptography, opens network connections, or re-projects nodes; it
//! drives all of that through the interfaces here.  Hosts supply
//! implementations when constructing a [`DirMgr`](crate::DirMgr);
//! tests supply fakes.

use std::time::SystemTime;

use crate::docid::{FetchPurpose, Resource};
use crate::docs::{Consensus, IdDigest, KeyDigest, MdDigest, NetParams};
use crate::err::ParseError;

/// One microdescriptor found by the parser in a larger input.
///
/// Bodies are described as spans into the input so that callers backed
/// by a memory-mapped file can keep them in place.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug)]
pub struct ParsedMd {
    /// Digest of the body, which is also the descriptor's primary key.
    pub digest: MdDigest,
    /// Offset of the body within the parsed input.
    pub off: usize,
    /// Length of the body in bytes.
    pub len: usize,
    /// The `@last-listed` annotation preceding the body, if any.
    pub last_listed: Option<SystemTime>,
}

/// The header fields we need from a legacy v2 status document.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug)]
pub struct ParsedV2Status {
    /// Identity digest of the authority that published the document.
    pub identity: IdDigest,
    /// When the authority claims to have published it.
    pub published_on: SystemTime,
}

/// The external document parser.
///
/// Implementations turn raw bytes into the structured types in
/// [`crate::docs`]; this crate treats the wire formats themselves as
/// opaque.
pub trait DocParser {
    /// Parse a consensus document.
    ///
    /// The parser must populate the content digests, the lifetime, the
    /// voter list with signatures, and the router-status list sorted
    /// ascending by identity digest.
    fn consensus(&self, input: &[u8]) -> std::result::Result<Consensus, ParseError>;

    /// Parse a sequence of microdescriptors, optionally preceded by
    /// `@last-listed` annotations.
    fn microdescs(
        &self,
        input: &[u8],
        allow_annotations: bool,
    ) -> std::result::Result<Vec<ParsedMd>, ParseError>;

    /// Parse the header of a legacy v2 status document.
    fn v2_status(&self, input: &[u8]) -> std::result::Result<ParsedV2Status, ParseError>;
}

/// An authority signing-key certificate, as held by the external
/// certificate store.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug)]
pub struct Cert {
    /// Identity digest of the authority this certificate belongs to.
    pub identity: IdDigest,
    /// Digest of the signing key the certificate carries.
    pub signing_key_digest: KeyDigest,
    /// The signing key itself, in whatever encoding the verifier
    /// expects.
    pub signing_key: Vec<u8>,
    /// When this certificate expires.
    pub expires: SystemTime,
}

/// The external certificate store.
pub trait CertStore {
    /// Look up a certificate by authority identity and signing-key
    /// digest.
    fn lookup(&self, identity: &IdDigest, signing_key_digest: &KeyDigest) -> Option<Cert>;

    /// Return true if recent attempts to download a certificate for
    /// `identity` have been failing.
    fn dl_looks_uncertain(&self, identity: &IdDigest) -> bool;

    /// Begin fetching whatever certificates `consensus` needs that we
    /// don't have.
    fn fetch_missing(&mut self, consensus: &Consensus, now: SystemTime);
}

/// A raw-public-key signature verifier.
///
/// Hoisting this behind a trait keeps the core free of cryptographic
/// primitives, and lets hosts offload verification to a worker pool:
/// the result is applied on the main task either way.
pub trait SignatureVerifier {
    /// Return true if `signature` is a valid signature over `digest`
    /// made with `signing_key`.
    fn verify(&self, signing_key: &[u8], signature: &[u8], digest: &[u8]) -> bool;
}

/// The directory transport.
///
/// `launch_fetch` is fire-and-forget: responses and failures come back
/// into the core through [`DirMgr`](crate::DirMgr) methods.
pub trait Transport {
    /// Begin fetching `resource` for `purpose`.
    fn launch_fetch(&mut self, purpose: FetchPurpose, resource: &Resource);

    /// Return true if a fetch with this purpose (and, if given, this
    /// resource) is already in progress.
    fn in_flight(&self, purpose: FetchPurpose, resource: Option<&Resource>) -> bool;
}

/// The node list that consumes installed directory information.
pub trait NodeList {
    /// Re-project nodes from a newly installed consensus.
    fn set_consensus(&mut self, consensus: &Consensus);

    /// Note that a new microdescriptor has entered the cache.
    fn add_microdesc(&mut self, digest: &MdDigest);

    /// Return the digests of every microdescriptor a node currently
    /// points at, for reference-counter reconciliation.
    fn referenced_microdescs(&self) -> Vec<MdDigest>;

    /// Return formatted status rows for every router with the given
    /// purpose (used by the `ns/purpose/` GETINFO path).
    fn list_by_purpose(&self, purpose: &str) -> Vec<String>;
}

/// A consumer of traffic-shaping parameters derived from the consensus.
pub trait BandwidthListener {
    /// Rescale rate limits from a new parameter set and poke any
    /// connection token buckets that depend on them.
    fn params_changed(&mut self, params: &NetParams<i32>);
}

/// The wall clock.
///
/// Production code uses [`SystemClock`]; tests substitute a settable
/// clock so that scheduling decisions are deterministic.
pub trait WallClock {
    /// Return the current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// A [`WallClock`] backed by [`SystemTime::now`].
#[derive(Clone, Copy, Debug, Default)]
#[non_exhaustive]
pub struct SystemClock;

impl WallClock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
