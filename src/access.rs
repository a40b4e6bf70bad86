//! Role-based access control for vaultsearch
//!
//! Default-deny everywhere: unknown users, deactivated users and unknown
//! permissions all authorize to false. A user's clearance is the maximum
//! classification over assigned roles; clearance comparison is non-strict,
//! so equality grants access.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::classification::{ClassificationLevel, Permission};
use crate::store::SearchHit;

/// A named role carrying a clearance and a permission set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Role {
    pub name: String,
    pub clearance: ClassificationLevel,
    pub permissions: HashSet<Permission>,
}

impl Role {
    fn new(
        name: &str,
        clearance: ClassificationLevel,
        permissions: impl IntoIterator<Item = Permission>,
    ) -> Self {
        Self {
            name: name.to_string(),
            clearance,
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Full permission set at TOP_SECRET.
    pub fn admin() -> Self {
        Self::new(
            "admin",
            ClassificationLevel::TopSecret,
            [
                Permission::Ingest,
                Permission::Query,
                Permission::ViewAudit,
                Permission::ManageUsers,
            ],
        )
    }

    /// TOP_SECRET analyst: query and audit review.
    pub fn analyst_ts() -> Self {
        Self::new(
            "analyst_ts",
            ClassificationLevel::TopSecret,
            [Permission::Query, Permission::ViewAudit],
        )
    }

    /// SECRET analyst: query only.
    pub fn analyst_s() -> Self {
        Self::new("analyst_s", ClassificationLevel::Secret, [Permission::Query])
    }

    /// CONFIDENTIAL analyst: query only.
    pub fn analyst_c() -> Self {
        Self::new(
            "analyst_c",
            ClassificationLevel::Confidential,
            [Permission::Query],
        )
    }

    /// UNCLASSIFIED operator: ingest and query.
    pub fn operator() -> Self {
        Self::new(
            "operator",
            ClassificationLevel::Unclassified,
            [Permission::Ingest, Permission::Query],
        )
    }
}

/// A system user with assigned roles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    pub roles: Vec<Role>,
    pub active: bool,
}

/// In-memory user registry with permission and clearance checks.
#[derive(Debug, Default)]
pub struct AccessControl {
    users: HashMap<String, User>,
}

impl AccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a user. Replaces an existing entry with the same id.
    pub fn add_user(&mut self, user_id: &str, roles: Vec<Role>) {
        let clearance = roles
            .iter()
            .map(|r| r.clearance)
            .max()
            .unwrap_or_default();
        tracing::info!(user_id, %clearance, roles = roles.len(), "user registered");
        self.users.insert(
            user_id.to_string(),
            User {
                user_id: user_id.to_string(),
                roles,
                active: true,
            },
        );
    }

    /// Deactivate a user; all subsequent checks deny. Returns false for an
    /// unknown id.
    pub fn deactivate(&mut self, user_id: &str) -> bool {
        match self.users.get_mut(user_id) {
            Some(user) => {
                user.active = false;
                tracing::warn!(user_id, "user deactivated");
                true
            }
            None => false,
        }
    }

    /// True only if the user exists, is active, and some role grants the
    /// permission.
    pub fn authorize(&self, user_id: &str, permission: Permission) -> bool {
        let Some(user) = self.users.get(user_id) else {
            return false;
        };
        if !user.active {
            return false;
        }
        user.roles.iter().any(|r| r.permissions.contains(&permission))
    }

    /// Maximum clearance over the user's roles; None for unknown or
    /// inactive users.
    pub fn clearance_of(&self, user_id: &str) -> Option<ClassificationLevel> {
        let user = self.users.get(user_id)?;
        if !user.active {
            return None;
        }
        user.roles.iter().map(|r| r.clearance).max()
    }

    /// Keep hits with `classification <= clearance`, preserving relative
    /// order. Unknown or inactive users get nothing.
    pub fn filter_by_clearance(&self, hits: Vec<SearchHit>, user_id: &str) -> Vec<SearchHit> {
        let Some(clearance) = self.clearance_of(user_id) else {
            return Vec::new();
        };
        hits.into_iter()
            .filter(|h| h.classification <= clearance)
            .collect()
    }
}
