use super::error::{AssemblyError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Field values of an entity, keyed by field name.
///
/// An update only carries the fields a source actually emitted; anything not
/// present in the map is left untouched by a merge.
pub type FieldSet = BTreeMap<String, serde_json::Value>;

/// Durable, globally unique identity of an assembled entity.
///
/// Assigned exactly once per [`LocalKey`] and never reused. The identity
/// outlives the entity's content: deleting the entity keeps the mapping.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct StableIdentity(Uuid);

impl StableIdentity {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for StableIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for StableIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StableIdentity {
    type Err = AssemblyError;

    fn from_str(s: &str) -> Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| AssemblyError::Resolution(format!("Invalid stable identity '{}': {}", s, e)))
    }
}

/// Kind of clinical or administrative entity being assembled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Patient,
    Encounter,
    Episode,
    ClinicalEvent,
    Problem,
    Other(String),
}

impl EntityKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Patient => "Patient",
            Self::Encounter => "Encounter",
            Self::Episode => "Episode",
            Self::ClinicalEvent => "ClinicalEvent",
            Self::Problem => "Problem",
            Self::Other(name) => name.as_str(),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = AssemblyError;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AssemblyError::Config("Entity kind must not be empty".to_string()));
        }
        Ok(match trimmed {
            "Patient" => Self::Patient,
            "Encounter" => Self::Encounter,
            "Episode" | "EpisodeOfCare" => Self::Episode,
            "ClinicalEvent" | "Observation" => Self::ClinicalEvent,
            "Problem" | "Condition" => Self::Problem,
            other => Self::Other(other.to_string()),
        })
    }
}

/// The source system's identifier for an entity.
///
/// Unique within a scope and entity type, not across entity types.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalKey {
    pub scope: String,
    pub entity_type: EntityKind,
    pub local_id: String,
}

impl LocalKey {
    pub fn new(scope: impl Into<String>, entity_type: EntityKind, local_id: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            entity_type,
            local_id: local_id.into(),
        }
    }
}

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.scope, self.entity_type, self.local_id)
    }
}

/// Alternate business identifier (e.g. a medical record number).
///
/// Business keys are tracked in both directions: the forward form
/// ([`BusinessKey::local_key`]) answers "which identity owns this key", the
/// reverse association is what migration detection consults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusinessKey {
    pub kind: EntityKind,
    pub system: String,
    pub value: String,
}

impl BusinessKey {
    pub fn new(kind: EntityKind, system: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind,
            system: system.into(),
            value: value.into(),
        }
    }

    pub fn local_key(&self) -> LocalKey {
        LocalKey {
            scope: format!("business:{}", self.system),
            entity_type: self.kind.clone(),
            local_id: self.value.clone(),
        }
    }
}

impl fmt::Display for BusinessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}={}", self.kind, self.system, self.value)
    }
}

/// Position of a record in its source, used to identify manifest entries.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceCoordinate {
    pub file: String,
    pub row: u64,
    pub column: Option<String>,
}

impl SourceCoordinate {
    pub fn new(file: impl Into<String>, row: u64) -> Self {
        Self {
            file: file.into(),
            row,
            column: None,
        }
    }

    pub fn with_column(mut self, column: impl Into<String>) -> Self {
        self.column = Some(column.into());
        self
    }
}

impl fmt::Display for SourceCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.column {
            Some(column) => write!(f, "{}:{}:{}", self.file, self.row, column),
            None => write!(f, "{}:{}", self.file, self.row),
        }
    }
}
