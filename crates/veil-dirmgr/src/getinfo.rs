//! The GETINFO surface for router-status information.
//!
//! The control port asks us questions with `ns/...` keys; we answer
//! with formatted status rows.  The row format here is our own
//! summary, not a re-serialization of the consensus.

use tracing::warn;

use crate::docs::{IdDigest, RouterStatus};
use crate::{DirMgr, Result};

/// Format one router status as a GETINFO answer fragment.
fn format_status_row(rs: &RouterStatus) -> String {
    format!(
        "r {} {} {} {} {} {}\ns {}\n",
        rs.nickname,
        rs.identity.to_hex(),
        hex::encode(rs.desc_digest.as_bytes()),
        rs.addr,
        rs.or_port,
        rs.dir_port,
        rs.flags.document_names().join(" "),
    )
}

impl DirMgr {
    /// Answer a `ns/...` GETINFO question.
    ///
    /// Returns `Ok(None)` when the key is not recognized, or when it
    /// names an entry we do not have.
    pub fn getinfo(&self, key: &str) -> Result<Option<String>> {
        let Some(consensus) = self.consensus(self.config.usable_flavor()) else {
            // With no consensus at all, there is nothing to answer
            // from; purpose queries still work, since the node list
            // answers those.
            if let Some(purpose) = key.strip_prefix("ns/purpose/") {
                return Ok(Some(self.nodes.list_by_purpose(purpose).join("")));
            }
            return Ok(None);
        };

        if key == "ns/all" {
            let mut out = String::new();
            for rs in &consensus.relays {
                out.push_str(&format_status_row(rs));
            }
            Ok(Some(out))
        } else if let Some(hexid) = key.strip_prefix("ns/id/") {
            let Some(id) = IdDigest::from_hex(hexid) else {
                return Ok(None);
            };
            Ok(consensus.routerstatus(&id).map(format_status_row))
        } else if let Some(nickname) = key.strip_prefix("ns/name/") {
            let Some(maps) = self.nickname_maps() else {
                return Ok(None);
            };
            if maps.is_unnamed(nickname) {
                warn!(
                    "Nickname {} is unnamed; the authorities will not say who owns it",
                    nickname
                );
                return Ok(None);
            }
            let Some(id) = maps.lookup_named(nickname).copied() else {
                return Ok(None);
            };
            Ok(consensus.routerstatus(&id).map(format_status_row))
        } else if let Some(purpose) = key.strip_prefix("ns/purpose/") {
            Ok(Some(self.nodes.list_by_purpose(purpose).join("")))
        } else {
            Ok(None)
        }
    }
}
