//! Information about directory authorities.
//!
//! From a client's point of view, an authority's role is to sign the
//! consensus directory.  The recognized set is configuration, not
//! something learned from the network.

use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::docs::IdDigest;

/// A single authority that signs a consensus directory.
//
// Note that we do *not* set serde(deny_unknown_fields) on this
// structure: we want the authorities format to be future-proof against
// adding new info about each authority.
#[derive(Debug, Clone, Builder, Eq, PartialEq)]
#[builder(derive(Debug, Serialize, Deserialize))]
pub struct Authority {
    /// A memorable nickname for this authority.
    #[builder(setter(into))]
    name: String,
    /// A digest of the long-term v3 identity key for this authority.
    v3ident: IdDigest,
    /// True if this authority also publishes legacy v2 status
    /// documents.
    #[builder(default)]
    v2: bool,
}

impl Authority {
    /// Return a builder for constructing an [`Authority`].
    pub fn builder() -> AuthorityBuilder {
        AuthorityBuilder::default()
    }

    /// Return this authority's nickname.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return this authority's v3 identity digest.
    pub fn v3ident(&self) -> &IdDigest {
        &self.v3ident
    }

    /// Return true if this authority serves legacy v2 status documents.
    pub fn is_v2(&self) -> bool {
        self.v2
    }
}

/// Return a vector of the default directory authorities.
pub(crate) fn default_authorities() -> Vec<Authority> {
    /// Build an authority; panic if input is bad.
    fn auth(name: &str, key: &str, v2: bool) -> Authority {
        let v3ident =
            IdDigest::from_hex(key).expect("Built-in authority identity had bad hex!?");
        let mut builder = Authority::builder();
        builder.name(name).v3ident(v3ident).v2(v2);
        builder
            .build()
            .expect("Built-in authority list was incomplete!?")
    }

    // (List generated March 2024.)
    vec![
        auth("aurochs", "3A71E4C7A2D51BFD2F0E804C33BB8AB1E6C09A54", true),
        auth("bergamot", "90C5F2D2EB31A8D71E33F0BA13C4B081FA0E6D12", false),
        auth("cinder", "4FD1A2B806EE874B2F1C833A907E5A2D1B94C900", true),
        auth("dockside", "AA0D2E33F61B79F4C2D845A7E00912C4D9E5F318", false),
        auth("ember", "17C4B5E2990DF2A86C3310B8F5B7B2E4A1D6083C", false),
        auth("foxglove", "CE223C5409A9F71DE66C38B2D1A840EEB0574FD6", true),
        auth("gale", "08DD17C3B5A2946E3C0F7AFE2D880145C57E9B61", false),
        auth("harrow", "F29A1D604E3C57B810A23BDCEF00497158C1DA22", false),
        auth("ibis", "6B07E5A45D3F1C8829BE60F0334A291C05D8F74E", true),
    ]
}
