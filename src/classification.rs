//! Classification levels and permissions for vaultsearch
//!
//! The classification lattice is a total order; clearance comparisons are
//! non-strict, so a user cleared at a level may read content at exactly
//! that level.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Sensitivity label carried by every chunk and every role.
///
/// Ordering is derived from declaration order:
/// `Unclassified < Confidential < Secret < TopSecret`.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationLevel {
    #[default]
    Unclassified,
    Confidential,
    Secret,
    TopSecret,
}

impl std::fmt::Display for ClassificationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unclassified => write!(f, "UNCLASSIFIED"),
            Self::Confidential => write!(f, "CONFIDENTIAL"),
            Self::Secret => write!(f, "SECRET"),
            Self::TopSecret => write!(f, "TOP_SECRET"),
        }
    }
}

#[derive(Debug, Error)]
#[error("Unknown classification level: {0}")]
pub struct UnknownClassification(String);

impl std::str::FromStr for ClassificationLevel {
    type Err = UnknownClassification;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UNCLASSIFIED" => Ok(Self::Unclassified),
            "CONFIDENTIAL" => Ok(Self::Confidential),
            "SECRET" => Ok(Self::Secret),
            "TOP_SECRET" | "TOPSECRET" => Ok(Self::TopSecret),
            other => Err(UnknownClassification(other.to_string())),
        }
    }
}

/// Actions a role may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Add documents to the store
    Ingest,
    /// Run retrieval queries
    Query,
    /// Read the audit trail
    ViewAudit,
    /// Add or deactivate users
    ManageUsers,
}

impl std::fmt::Display for Permission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ingest => write!(f, "ingest"),
            Self::Query => write!(f, "query"),
            Self::ViewAudit => write!(f, "view_audit"),
            Self::ManageUsers => write!(f, "manage_users"),
        }
    }
}
