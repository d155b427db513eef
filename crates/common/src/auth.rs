//! Issuer identity and authorization.
//!
//! The engine itself is agnostic about how callers are authenticated; all it
//! needs from an issuer is a stable full identifier and a way to look up the
//! roles the issuer holds toward a given entity. `Issuer` is that seam, and
//! `Auth` is the concrete value most deployments use.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

/// The identity executing a command, plus its authorization data.
///
/// Implementations must be cheap to query; role lookups happen on every
/// command authorization.
pub trait Issuer: Send + Sync + std::fmt::Debug {
    /// Stable full identifier of this issuer, e.g. `"user:42"`.
    fn full_id(&self) -> String;

    /// The roles this issuer holds. When `for_entity` is given, roles the
    /// issuer holds specifically toward that entity are included too.
    fn roles(&self, for_entity: Option<&str>) -> Vec<String>;
}

/// An identity value that serves both authentication and authorization:
/// it identifies what is performing an action and what permissions it has.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    /// The kind of entity this identity represents, e.g. `"user"`, `"cron"`.
    entity_type: String,
    /// The identification of the entity within its kind.
    id: String,
    /// Base roles held everywhere.
    #[serde(default)]
    roles: Vec<String>,
    /// Extra roles granted toward specific entities, keyed by the target's
    /// full id, e.g. `{"Todo:<uuid>": ["owner"]}`.
    #[serde(default)]
    extra_roles: HashMap<String, Vec<String>>,
}

impl Auth {
    /// Creates an identity with base roles only.
    pub fn new(
        entity_type: impl Into<String>,
        id: impl Into<String>,
        roles: Vec<String>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            id: id.into(),
            roles,
            extra_roles: HashMap::new(),
        }
    }

    /// Adds roles this identity holds toward a specific entity.
    pub fn with_extra_roles(
        mut self,
        entity_full_id: impl Into<String>,
        roles: Vec<String>,
    ) -> Self {
        self.extra_roles.insert(entity_full_id.into(), roles);
        self
    }

    /// The kind of entity this identity represents.
    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    /// The entity's id within its kind.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Issuer for Auth {
    fn full_id(&self) -> String {
        format!("{}:{}", self.entity_type, self.id)
    }

    fn roles(&self, for_entity: Option<&str>) -> Vec<String> {
        let extra = for_entity.and_then(|entity| self.extra_roles.get(entity));
        match extra {
            None => self.roles.clone(),
            Some(extra) => {
                let mut all: BTreeSet<&str> = self.roles.iter().map(String::as_str).collect();
                all.extend(extra.iter().map(String::as_str));
                all.into_iter().map(str::to_owned).collect()
            }
        }
    }
}
