//! Signature checking and quorum evaluation for consensus documents.
//!
//! A consensus is only as good as the set of recognized authorities
//! that signed it.  The code here classifies every voter's signatures
//! against the certificate store, and decides whether the document is
//! installable now, installable once more certificates arrive, or
//! unsalvageable.

use std::time::SystemTime;

use itertools::Itertools;
use tracing::{debug, warn};

use crate::authority::Authority;
use crate::docs::Consensus;
use crate::external::{CertStore, SignatureVerifier};

/// The verdict of a quorum check.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum QuorumResult {
    /// Every recognized authority signed, and every signature checked
    /// out.
    AllGood,
    /// A majority of recognized authorities signed correctly.
    Enough,
    /// Not enough good signatures yet, but fetching missing
    /// certificates could still get us to a majority.
    NeedCerts,
    /// No way to reach a majority, even with more certificates.
    Insufficient,
}

/// Per-voter counts and diagnostics accumulated by a quorum check.
///
/// The verdict is a pure function of these counts; see
/// [`QuorumTally::result`].
#[derive(Clone, Debug, Default)]
pub struct QuorumTally {
    /// How many authorities we recognize in total.
    pub n_authorities: usize,
    /// Voters with at least one verified-good signature.
    pub n_good: usize,
    /// Voters whose signatures all failed verification.
    pub n_bad: usize,
    /// Voters for whom we have no usable certificate yet.
    pub n_missing: usize,
    /// The subset of `n_missing` whose certificate downloads have been
    /// failing.
    pub n_missing_dl_failed: usize,
    /// Voters whose identity we do not recognize as an authority.
    pub n_unknown: usize,
    /// Recognized voters with no checkable signature at all.
    pub n_no_signature: usize,
    /// Nicknames of voters that signed correctly.
    pub good: Vec<String>,
    /// Nicknames of voters whose certificates we still need.
    pub missing: Vec<String>,
    /// Nicknames of voters we do not recognize.
    pub unknown: Vec<String>,
    /// Nicknames of recognized authorities absent from the voter list.
    pub absent: Vec<String>,
}

impl QuorumTally {
    /// Return the number of good signatures required for a majority.
    pub fn quorum(&self) -> usize {
        self.n_authorities / 2 + 1
    }

    /// Decide what this tally means for the consensus.
    pub fn result(&self) -> QuorumResult {
        let q = self.quorum();
        if self.n_authorities > 0 && self.n_good == self.n_authorities {
            QuorumResult::AllGood
        } else if self.n_good >= q {
            QuorumResult::Enough
        } else if self.n_good + self.n_missing >= q
            && self.n_good + self.n_missing - self.n_missing_dl_failed >= q
        {
            QuorumResult::NeedCerts
        } else {
            QuorumResult::Insufficient
        }
    }

    /// Render the tally for a diagnostic message.
    pub fn describe(&self) -> String {
        let list = |v: &[String]| -> String {
            if v.is_empty() {
                "-".to_string()
            } else {
                v.iter().join(",")
            }
        };
        format!(
            "{}/{} good (need {}); signed-ok: {}; missing certs: {}; \
             unrecognized voters: {}; authorities not voting: {}",
            self.n_good,
            self.n_authorities,
            self.quorum(),
            list(&self.good),
            list(&self.missing),
            list(&self.unknown),
            list(&self.absent),
        )
    }
}

/// Check every signature on `consensus` against the certificate store,
/// and tally the voters.
///
/// Signature classification is recorded on the consensus itself (the
/// `good_signature`/`bad_signature` flags); everything else about the
/// document is left alone.  Running the check twice is harmless:
/// already-classified signatures are not re-verified.
///
/// If `verbose` is set, an insufficient or waiting tally is reported at
/// warn level rather than debug.
pub(crate) fn check_consensus_signatures(
    consensus: &mut Consensus,
    authorities: &[Authority],
    certs: &dyn CertStore,
    verifier: &dyn SignatureVerifier,
    now: SystemTime,
    verbose: bool,
) -> QuorumTally {
    let mut tally = QuorumTally {
        n_authorities: authorities.len(),
        ..QuorumTally::default()
    };
    let digests = consensus.digests.clone();

    for voter in &mut consensus.voters {
        let recognized = authorities.iter().any(|a| a.v3ident() == &voter.identity);
        if !recognized {
            tally.n_unknown += 1;
            tally.unknown.push(voter.nickname.clone());
            continue;
        }

        let mut have_good = false;
        let mut have_bad = false;
        let mut n_missing_certs = 0_usize;

        for sig in &mut voter.signatures {
            if sig.identity != voter.identity {
                // Signature claims a different identity than its voter;
                // nothing it could prove would help this voter.
                continue;
            }
            let Some(digest) = digests.get(sig.alg) else {
                // No document digest for this algorithm; uncheckable.
                continue;
            };
            if sig.unclassified() {
                let cert = certs
                    .lookup(&sig.identity, &sig.signing_key_digest)
                    .filter(|c| c.expires > now);
                match cert {
                    Some(cert) => {
                        let ok = digest.len() == sig.alg.digest_len()
                            && verifier.verify(&cert.signing_key, &sig.signature, digest);
                        if ok {
                            sig.good_signature = true;
                        } else {
                            sig.bad_signature = true;
                        }
                    }
                    None => {
                        n_missing_certs += 1;
                        continue;
                    }
                }
            }
            if sig.good_signature {
                have_good = true;
            } else if sig.bad_signature {
                have_bad = true;
            }
        }

        if have_good {
            tally.n_good += 1;
            tally.good.push(voter.nickname.clone());
        } else if have_bad {
            tally.n_bad += 1;
        } else if n_missing_certs > 0 {
            tally.n_missing += 1;
            tally.missing.push(voter.nickname.clone());
            if certs.dl_looks_uncertain(&voter.identity) {
                tally.n_missing_dl_failed += 1;
            }
        } else {
            tally.n_no_signature += 1;
        }
    }

    for auth in authorities {
        if !consensus
            .voters
            .iter()
            .any(|v| &v.identity == auth.v3ident())
        {
            tally.absent.push(auth.name().to_string());
        }
    }

    match tally.result() {
        QuorumResult::AllGood | QuorumResult::Enough => {
            debug!("Consensus signatures: {}", tally.describe());
        }
        _ if verbose => {
            warn!("Consensus signatures: {}", tally.describe());
        }
        _ => {
            debug!("Consensus signatures: {}", tally.describe());
        }
    }

    tally
}
