//! Pool key derivation.
//!
//! Connections are grouped by [`PoolKey`]. A request only ever receives a
//! connection whose key equals its own, so tunneled and direct connections
//! never mix, and neither do tunnels to different destinations.

use std::fmt;

use burrow_common::Authority;

use crate::metadata::OverrideDestination;

/// Grouping key for pooled upstream connections within one cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PoolKey {
    /// The cluster's own endpoint; distinct from every override
    Default,
    /// A tunnel to a specific destination
    Override(OverrideDestination),
}

impl PoolKey {
    /// Derive the key for a request
    pub fn derive(destination: Option<&OverrideDestination>) -> Self {
        match destination {
            Some(dest) => PoolKey::Override(dest.clone()),
            None => PoolKey::Default,
        }
    }

    /// Where a new raw connection for this key is opened
    pub fn dial_target<'a>(&'a self, endpoint: &'a Authority) -> &'a Authority {
        match self {
            PoolKey::Default => endpoint,
            PoolKey::Override(dest) => dest.authority(),
        }
    }

    pub fn destination(&self) -> Option<&OverrideDestination> {
        match self {
            PoolKey::Default => None,
            PoolKey::Override(dest) => Some(dest),
        }
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKey::Default => f.write_str("default"),
            PoolKey::Override(dest) => write!(f, "override:{}", dest),
        }
    }
}
