//! Data model for parsed directory documents.
//!
//! The parser itself lives outside this crate; it hands us fully
//! structured values of the types declared here.  Everything in this
//! module is "dumb data" plus a few accessors: validation and
//! installation rules live in [`crate::quorum`] and [`crate::state`].

use std::cell::OnceCell;
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};

use bitflags::bitflags;

use crate::retry::DownloadStatus;
use crate::REASONABLY_LIVE_TIME;

/// The digest of a microdescriptor body, which is also its primary key.
pub type MdDigest = [u8; 32];

/// The digest of an authority signing key.
pub type KeyDigest = [u8; 20];

/// A 20-byte identity digest for a relay or a directory authority.
#[derive(Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct IdDigest([u8; 20]);

impl IdDigest {
    /// An all-zero identity digest, used as a placeholder in some
    /// documents.
    pub const ZERO: IdDigest = IdDigest([0_u8; 20]);

    /// Construct an `IdDigest` from a 20-byte slice, or return None if the
    /// length is wrong.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        b.try_into().ok().map(IdDigest)
    }

    /// Construct an `IdDigest` from a 40-character hex string.
    ///
    /// Accepts upper- and lowercase hex.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        Self::from_bytes(&bytes)
    }

    /// Return a reference to the bytes of this digest.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Return this digest, encoded as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl From<[u8; 20]> for IdDigest {
    fn from(b: [u8; 20]) -> IdDigest {
        IdDigest(b)
    }
}

impl serde::Serialize for IdDigest {
    fn serialize<S: serde::Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for IdDigest {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        IdDigest::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom("expected a 40-character hex identity digest"))
    }
}

impl std::fmt::Display for IdDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "${}", self.to_hex())
    }
}

impl std::fmt::Debug for IdDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "IdDigest({})", self.to_hex())
    }
}

/// A digest algorithm that may be used to sign a consensus.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum DigestAlg {
    /// 160-bit SHA-1, used by the `ns` flavor.
    Sha1,
    /// 256-bit SHA-256, used by the `microdesc` flavor.
    Sha256,
}

impl DigestAlg {
    /// Return the length in bytes of a digest made with this algorithm.
    pub fn digest_len(self) -> usize {
        match self {
            DigestAlg::Sha1 => 20,
            DigestAlg::Sha256 => 32,
        }
    }

    /// Return the name of this algorithm as it appears in documents.
    pub fn name(self) -> &'static str {
        match self {
            DigestAlg::Sha1 => "sha1",
            DigestAlg::Sha256 => "sha256",
        }
    }
}

/// The content digests of a consensus document, one per supported
/// algorithm.
///
/// The parser computes these over the signed portion of the document;
/// signature verification compares a decrypted digest against the entry
/// for the signature's algorithm.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DocDigests {
    /// The SHA-1 digest of the document, if computed.
    pub sha1: Option<[u8; 20]>,
    /// The SHA-256 digest of the document, if computed.
    pub sha256: Option<[u8; 32]>,
}

impl DocDigests {
    /// Return the digest for `alg`, if we have one.
    pub fn get(&self, alg: DigestAlg) -> Option<&[u8]> {
        match alg {
            DigestAlg::Sha1 => self.sha1.as_ref().map(|d| &d[..]),
            DigestAlg::Sha256 => self.sha256.as_ref().map(|d| &d[..]),
        }
    }
}

/// The lifetime of a consensus document.
///
/// Describes when the document may safely be used, and when a
/// replacement is expected to exist.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Lifetime {
    /// Time at which the document becomes valid.
    valid_after: SystemTime,
    /// Time after which there is expected to be a better version of
    /// this consensus.
    fresh_until: SystemTime,
    /// Time after which this consensus is expired.
    ///
    /// (Clients will keep using an expired consensus for a while, if no
    /// better one can be found.)
    valid_until: SystemTime,
}

impl Lifetime {
    /// Construct a new Lifetime, or return None if the times are not
    /// correctly ordered.
    pub fn new(
        valid_after: SystemTime,
        fresh_until: SystemTime,
        valid_until: SystemTime,
    ) -> Option<Self> {
        if valid_after <= fresh_until && fresh_until <= valid_until {
            Some(Lifetime {
                valid_after,
                fresh_until,
                valid_until,
            })
        } else {
            None
        }
    }

    /// Return the time when this consensus first becomes valid.
    pub fn valid_after(&self) -> SystemTime {
        self.valid_after
    }

    /// Return the time when this consensus is no longer fresh.
    pub fn fresh_until(&self) -> SystemTime {
        self.fresh_until
    }

    /// Return the time when this consensus is no longer valid.
    pub fn valid_until(&self) -> SystemTime {
        self.valid_until
    }

    /// Return true if this consensus is officially valid at `when`.
    ///
    /// Both endpoints are inclusive.
    pub fn valid_at(&self, when: SystemTime) -> bool {
        self.valid_after <= when && when <= self.valid_until
    }

    /// Return true if this consensus is valid at `when`, or has been
    /// expired for no longer than [`REASONABLY_LIVE_TIME`].
    pub fn reasonably_live_at(&self, when: SystemTime) -> bool {
        self.valid_after <= when && when <= self.valid_until + REASONABLY_LIVE_TIME
    }

    /// Return the interval between this consensus becoming valid and
    /// its expected replacement becoming valid.
    pub fn voting_interval(&self) -> Duration {
        self.fresh_until
            .duration_since(self.valid_after)
            .expect("valid-after must precede fresh-until")
    }
}

/// A recognized flavor of consensus document.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[non_exhaustive]
pub enum Flavor {
    /// The flavor that carries full router summaries inline.
    Ns,
    /// The flavor that references separately-fetched microdescriptors.
    Microdesc,
}

impl Flavor {
    /// Every flavor we recognize, in a fixed order.
    pub const ALL: [Flavor; 2] = [Flavor::Ns, Flavor::Microdesc];

    /// Return the name of this consensus flavor.
    pub fn name(self) -> &'static str {
        match self {
            Flavor::Ns => "ns",
            Flavor::Microdesc => "microdesc",
        }
    }

    /// Try to find the flavor whose name is `name`.
    ///
    /// Unknown names are rejected outright; there is no numeric escape
    /// hatch.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ns" => Some(Flavor::Ns),
            "microdesc" => Some(Flavor::Microdesc),
            _ => None,
        }
    }
}

impl std::fmt::Display for Flavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A fixed-arity record holding one value per consensus flavor.
///
/// We deliberately avoid an array indexed by flavor number: a record
/// makes "we hold this flavor but do not use it" impossible to get
/// wrong with an out-of-range index.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug, Default)]
pub struct PerFlavor<T> {
    /// The value for the `ns` flavor.
    pub ns: T,
    /// The value for the `microdesc` flavor.
    pub microdesc: T,
}

impl<T> PerFlavor<T> {
    /// Return a reference to the value for `flavor`.
    pub fn get(&self, flavor: Flavor) -> &T {
        match flavor {
            Flavor::Ns => &self.ns,
            Flavor::Microdesc => &self.microdesc,
        }
    }

    /// Return a mutable reference to the value for `flavor`.
    pub fn get_mut(&mut self, flavor: Flavor) -> &mut T {
        match flavor {
            Flavor::Ns => &mut self.ns,
            Flavor::Microdesc => &mut self.microdesc,
        }
    }

    /// Iterate over `(flavor, value)` pairs in a fixed order.
    pub fn iter(&self) -> impl Iterator<Item = (Flavor, &T)> {
        [
            (Flavor::Ns, &self.ns),
            (Flavor::Microdesc, &self.microdesc),
        ]
        .into_iter()
    }
}

/// A set of named integer parameters from a consensus.
///
/// These are encoded in the document with a space-separated K=V format;
/// by the time they reach us they are a plain map.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct NetParams<T> {
    /// Map from keys to values.
    params: HashMap<String, T>,
}

impl<T> NetParams<T> {
    /// Create a new empty parameter list.
    pub fn new() -> Self {
        NetParams {
            params: HashMap::new(),
        }
    }

    /// Retrieve a given parameter, if it is present.
    pub fn get<A: AsRef<str>>(&self, k: A) -> Option<&T> {
        self.params.get(k.as_ref())
    }

    /// Return an iterator over all key value pairs in an arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &T)> {
        self.params.iter()
    }

    /// Set or replace the value of a parameter.
    pub fn set(&mut self, k: String, v: T) {
        self.params.insert(k, v);
    }
}

impl NetParams<i32> {
    /// Look up `key`, clamping the result into `low..=high` and falling
    /// back to `default` when the key is absent.
    pub fn get_clamped(&self, key: &str, default: i32, low: i32, high: i32) -> i32 {
        self.get(key).copied().unwrap_or(default).clamp(low, high)
    }
}

impl<K: Into<String>, T> FromIterator<(K, T)> for NetParams<T> {
    fn from_iter<I: IntoIterator<Item = (K, T)>>(i: I) -> Self {
        NetParams {
            params: i.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

bitflags! {
    /// A set of recognized directory flags on a single relay.
    ///
    /// These flags come from a consensus document, and describe what the
    /// authorities believe about the relay.  Flags we didn't recognize
    /// are not represented.
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    pub struct RelayFlags: u16 {
        /// Is this a directory authority?
        const AUTHORITY = (1 << 0);
        /// Is this relay usable for exiting traffic?
        const EXIT = (1 << 1);
        /// Is this relay considered "stable" enough for long-lived
        /// circuits?
        const STABLE = (1 << 2);
        /// Is this relay considered "fast" above a certain threshold?
        const FAST = (1 << 3);
        /// Is this relay currently running?
        const RUNNING = (1 << 4);
        /// Do the authorities bind this relay's nickname to its
        /// identity?
        const NAMED = (1 << 5);
        /// Do the authorities assert that this relay's nickname is bound
        /// to some *other* identity?
        const UNNAMED = (1 << 6);
        /// Is this relay allowed on the network at all?
        const VALID = (1 << 7);
        /// Does this relay support a recognized version of the directory
        /// protocol?
        const V2DIR = (1 << 8);
        /// Is this relay suitable for use as a guard?
        const GUARD = (1 << 9);
        /// Is this relay marked as a bad exit?
        const BAD_EXIT = (1 << 10);
        /// Is this relay marked as an untrustworthy directory?
        const BAD_DIRECTORY = (1 << 11);
        /// Does this relay participate in the hidden-service directory
        /// ring?
        const HSDIR = (1 << 12);
    }
}

impl RelayFlags {
    /// Return the document spelling of every flag that is set, in a
    /// fixed order.
    pub fn document_names(&self) -> Vec<&'static str> {
        /// Flag-to-spelling table, in emission order.
        const NAMES: [(RelayFlags, &str); 13] = [
            (RelayFlags::AUTHORITY, "Authority"),
            (RelayFlags::BAD_DIRECTORY, "BadDirectory"),
            (RelayFlags::BAD_EXIT, "BadExit"),
            (RelayFlags::EXIT, "Exit"),
            (RelayFlags::FAST, "Fast"),
            (RelayFlags::GUARD, "Guard"),
            (RelayFlags::HSDIR, "HSDir"),
            (RelayFlags::NAMED, "Named"),
            (RelayFlags::RUNNING, "Running"),
            (RelayFlags::STABLE, "Stable"),
            (RelayFlags::UNNAMED, "Unnamed"),
            (RelayFlags::V2DIR, "V2Dir"),
            (RelayFlags::VALID, "Valid"),
        ];
        NAMES
            .iter()
            .filter(|(f, _)| self.contains(*f))
            .map(|(_, n)| *n)
            .collect()
    }
}

impl std::str::FromStr for RelayFlags {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "Authority" => RelayFlags::AUTHORITY,
            "Exit" => RelayFlags::EXIT,
            "Stable" => RelayFlags::STABLE,
            "Fast" => RelayFlags::FAST,
            "Running" => RelayFlags::RUNNING,
            "Named" => RelayFlags::NAMED,
            "Unnamed" => RelayFlags::UNNAMED,
            "Valid" => RelayFlags::VALID,
            "V2Dir" => RelayFlags::V2DIR,
            "Guard" => RelayFlags::GUARD,
            "BadExit" => RelayFlags::BAD_EXIT,
            "BadDirectory" => RelayFlags::BAD_DIRECTORY,
            "HSDir" => RelayFlags::HSDIR,
            _ => RelayFlags::empty(),
        })
    }
}

/// A bitset of protocol-version capabilities advertised by a relay.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ProtoCaps(u32);

impl ProtoCaps {
    /// Construct a capability set from its raw bits.
    pub fn from_bits(bits: u32) -> Self {
        ProtoCaps(bits)
    }

    /// Return true if capability bit `bit` is advertised.
    pub fn supports(&self, bit: u8) -> bool {
        bit < 32 && self.0 & (1 << u32::from(bit)) != 0
    }
}

/// The digest of the descriptor a router status refers to.
///
/// Its width depends on the consensus flavor: `ns` rows carry a 20-byte
/// digest of a full descriptor, `microdesc` rows a 32-byte
/// microdescriptor digest.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum DescDigest {
    /// A 20-byte digest of a full descriptor.
    Sha1([u8; 20]),
    /// A 32-byte digest of a microdescriptor.
    Sha256([u8; 32]),
}

impl DescDigest {
    /// Return the bytes of this digest.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            DescDigest::Sha1(d) => &d[..],
            DescDigest::Sha256(d) => &d[..],
        }
    }

    /// Return true if every byte of this digest is zero.
    ///
    /// All-zero digests appear as placeholders and must never be
    /// fetched.
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// Return the microdescriptor digest, if this is one.
    pub fn as_md_digest(&self) -> Option<&MdDigest> {
        match self {
            DescDigest::Sha256(d) => Some(d),
            DescDigest::Sha1(_) => None,
        }
    }
}

/// A single relay's status, as listed in a consensus.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug)]
pub struct RouterStatus {
    /// The relay's identity digest.
    pub identity: IdDigest,
    /// Digest of the descriptor this row refers to.
    pub desc_digest: DescDigest,
    /// Declared nickname.  Not unique unless the `Named` flag binds it.
    pub nickname: String,
    /// Declared IP address.
    pub addr: IpAddr,
    /// Relay (OR) port.
    pub or_port: u16,
    /// Directory port, or 0 if the relay serves no directory.
    pub dir_port: u16,
    /// The directory flags the authorities assigned to this relay.
    pub flags: RelayFlags,
    /// Protocol-version capabilities.
    pub protocaps: ProtoCaps,
    /// Retry state for downloading the descriptor this row refers to.
    pub dl_status: DownloadStatus,
    /// When, if ever, this relay's directory last answered us with a 503.
    pub last_dir_503_at: Option<SystemTime>,
}

impl RouterStatus {
    /// Return true if the authorities bind this relay's nickname.
    pub fn is_named(&self) -> bool {
        self.flags.contains(RelayFlags::NAMED)
    }

    /// Return true if the authorities assert this relay's nickname
    /// belongs to someone else.
    pub fn is_unnamed(&self) -> bool {
        self.flags.contains(RelayFlags::UNNAMED)
    }
}

/// One signature on a consensus, as made by a single voter.
///
/// The two terminal flags are set by signature verification; at most one
/// of them may ever be set.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug)]
pub struct VoterSignature {
    /// The digest algorithm used to make the signature.
    pub alg: DigestAlg,
    /// The identity digest of the authority that claims to have signed.
    pub identity: IdDigest,
    /// Digest of the signing key used.
    pub signing_key_digest: KeyDigest,
    /// The raw signature bytes.
    pub signature: Vec<u8>,
    /// Set once the signature has verified correctly.
    pub good_signature: bool,
    /// Set once the signature has failed verification.
    pub bad_signature: bool,
}

impl VoterSignature {
    /// Return true if this signature has not yet been classified.
    pub fn unclassified(&self) -> bool {
        !self.good_signature && !self.bad_signature
    }
}

/// A single voter (authority) record in a consensus.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug)]
pub struct Voter {
    /// The voter's identity digest.
    pub identity: IdDigest,
    /// The voter's display nickname.
    pub nickname: String,
    /// The voter's published address.
    pub address: String,
    /// Contact information, verbatim from the document.
    pub contact: String,
    /// The signatures this voter placed on the document.
    pub signatures: Vec<VoterSignature>,
}

/// A parsed consensus document.
///
/// Immutable once installed, except for signature classification (which
/// happens before installation) and the lazily-built descriptor-digest
/// index.
#[allow(clippy::exhaustive_structs)]
#[derive(Clone, Debug)]
pub struct Consensus {
    /// Which flavor of consensus this is.
    pub flavor: Flavor,
    /// When this consensus is valid, fresh, and expired.
    pub lifetime: Lifetime,
    /// Content digests of the signed portion, one per algorithm.
    pub digests: DocDigests,
    /// The voters that (claim to have) signed this document.
    pub voters: Vec<Voter>,
    /// Every listed relay, sorted ascending by identity digest.
    pub relays: Vec<RouterStatus>,
    /// Named integer network parameters.
    pub params: NetParams<i32>,
    /// Named bandwidth-weight parameters.
    pub bw_weights: NetParams<i32>,
    /// Software versions the authorities recommend for clients.
    pub client_versions: Vec<String>,
    /// Index from descriptor digest to position in `relays`; built on
    /// first use.
    desc_index: OnceCell<HashMap<Vec<u8>, usize>>,
}

impl Consensus {
    /// Construct a consensus with the given header data and no relays,
    /// voters, or parameters.
    ///
    /// Parsers fill in the remaining public fields after construction.
    pub fn new(flavor: Flavor, lifetime: Lifetime, digests: DocDigests) -> Self {
        Consensus {
            flavor,
            lifetime,
            digests,
            voters: Vec::new(),
            relays: Vec::new(),
            params: NetParams::new(),
            bw_weights: NetParams::new(),
            client_versions: Vec::new(),
            desc_index: OnceCell::new(),
        }
    }

    /// Return true if this consensus is live at `now`.
    pub fn is_live(&self, now: SystemTime) -> bool {
        self.lifetime.valid_at(now)
    }

    /// Return true if this consensus is live at `now`, or expired by no
    /// more than [`REASONABLY_LIVE_TIME`].
    pub fn is_reasonably_live(&self, now: SystemTime) -> bool {
        self.lifetime.reasonably_live_at(now)
    }

    /// Return true if this consensus has been valid for long enough
    /// that a directory cache should serve it.
    pub fn old_enough_to_serve(&self, now: SystemTime) -> bool {
        self.lifetime.valid_after() + crate::CONSENSUS_MIN_SECONDS_BEFORE_CACHING <= now
    }

    /// Look up the router status with the given identity digest.
    ///
    /// The relay list is sorted by identity, so this is a binary search.
    pub fn routerstatus(&self, identity: &IdDigest) -> Option<&RouterStatus> {
        self.relays
            .binary_search_by(|rs| rs.identity.cmp(identity))
            .ok()
            .map(|idx| &self.relays[idx])
    }

    /// Mutable variant of [`Consensus::routerstatus`].
    pub(crate) fn routerstatus_mut(&mut self, identity: &IdDigest) -> Option<&mut RouterStatus> {
        self.relays
            .binary_search_by(|rs| rs.identity.cmp(identity))
            .ok()
            .map(|idx| &mut self.relays[idx])
    }

    /// Look up a router status by the digest of its descriptor.
    ///
    /// The index behind this lookup is built lazily on first use.
    pub fn routerstatus_by_descriptor(&self, digest: &[u8]) -> Option<&RouterStatus> {
        self.position_by_descriptor(digest)
            .map(|idx| &self.relays[idx])
    }

    /// Return the position in `relays` of the row whose descriptor has
    /// the given digest.
    pub(crate) fn position_by_descriptor(&self, digest: &[u8]) -> Option<usize> {
        let index = self.desc_index.get_or_init(|| {
            self.relays
                .iter()
                .enumerate()
                .map(|(idx, rs)| (rs.desc_digest.as_bytes().to_vec(), idx))
                .collect()
        });
        index.get(digest).copied()
    }

    /// Look up `key` in the network parameters, clamping the result into
    /// `low..=high` and falling back to `default` when absent.
    pub fn param(&self, key: &str, default: i32, low: i32, high: i32) -> i32 {
        self.params.get_clamped(key, default, low, high)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// Shorthand for a SystemTime some seconds past the epoch.
    fn t(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn lifetime_ordering() {
        assert!(Lifetime::new(t(10), t(20), t(30)).is_some());
        assert!(Lifetime::new(t(10), t(10), t(10)).is_some());
        assert!(Lifetime::new(t(20), t(10), t(30)).is_none());
        assert!(Lifetime::new(t(10), t(30), t(20)).is_none());
    }

    #[test]
    fn liveness_boundaries() {
        let lt = Lifetime::new(t(1000), t(2000), t(3000)).unwrap();
        // valid_after == now is live; valid_until == now is live.
        assert!(lt.valid_at(t(1000)));
        assert!(lt.valid_at(t(3000)));
        assert!(!lt.valid_at(t(999)));
        assert!(!lt.valid_at(t(3001)));
        // One second past expiry is not live, but reasonably live
        // within a day.
        assert!(lt.reasonably_live_at(t(3001)));
        assert!(lt.reasonably_live_at(t(3000 + 86400)));
        assert!(!lt.reasonably_live_at(t(3001 + 86400)));
    }

    #[test]
    fn flavor_names() {
        assert_eq!(Flavor::Ns.name(), "ns");
        assert_eq!(Flavor::from_name("microdesc"), Some(Flavor::Microdesc));
        assert_eq!(Flavor::from_name("vote"), None);
        assert_eq!(Flavor::ALL.len(), 2);
    }

    #[test]
    fn relay_flags_from_str() {
        let f: RelayFlags = "Guard".parse().unwrap();
        assert_eq!(f, RelayFlags::GUARD);
        let f: RelayFlags = "NoSuchFlag".parse().unwrap();
        assert!(f.is_empty());
    }

    #[test]
    fn clamped_params() {
        let mut p = NetParams::new();
        p.set("circwindow".into(), 100_000);
        assert_eq!(p.get_clamped("circwindow", 1000, 100, 1000), 1000);
        assert_eq!(p.get_clamped("absent", 42, 0, 100), 42);
    }

    #[test]
    fn id_digest_hex() {
        let id = IdDigest::from_hex("27102BC123E7AF1D4741AE047E160C91ADC76B21").unwrap();
        assert_eq!(id.to_hex(), "27102bc123e7af1d4741ae047e160c91adc76b21");
        assert_eq!(
            id.to_string(),
            "$27102bc123e7af1d4741ae047e160c91adc76b21"
        );
        assert!(IdDigest::from_hex("27102b").is_none());
    }

    #[test]
    fn zero_desc_digest() {
        assert!(DescDigest::Sha256([0; 32]).is_zero());
        assert!(!DescDigest::Sha256([1; 32]).is_zero());
    }

    #[test]
    fn serving_age() {
        let lt = Lifetime::new(t(1000), t(2000), t(3000)).unwrap();
        let c = Consensus::new(Flavor::Ns, lt, DocDigests::default());
        assert!(!c.old_enough_to_serve(t(1119)));
        assert!(c.old_enough_to_serve(t(1120)));
    }

    #[test]
    fn protocol_capabilities() {
        let caps = ProtoCaps::from_bits(0b101);
        assert!(caps.supports(0));
        assert!(!caps.supports(1));
        assert!(caps.supports(2));
        assert!(!caps.supports(31));
        assert!(!caps.supports(40));
    }
}
