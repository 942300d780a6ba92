//! Source record stream contract.
//!
//! Rows arrive already decoded into typed fields; this crate only consumes
//! them through [`RecordSource::next`].

use crate::core::{BusinessKey, FieldSet, LocalKey, Result, SourceCoordinate};
use async_trait::async_trait;

/// Local keys of the entities a record refers to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordReferences {
    /// Owning entity, typically the patient.
    pub subject: Option<LocalKey>,
    /// Parent for cascade deletion, e.g. the encounter of an observation.
    pub parent: Option<LocalKey>,
}

/// One decoded source row.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceRecord {
    pub coordinate: SourceCoordinate,
    pub local_key: LocalKey,
    pub fields: FieldSet,
    pub references: RecordReferences,
    /// `false` marks the entity deleted upstream.
    pub active: bool,
    pub business_key: Option<BusinessKey>,
}

impl SourceRecord {
    pub fn active(coordinate: SourceCoordinate, local_key: LocalKey) -> Self {
        Self {
            coordinate,
            local_key,
            fields: FieldSet::new(),
            references: RecordReferences::default(),
            active: true,
            business_key: None,
        }
    }

    pub fn inactive(coordinate: SourceCoordinate, local_key: LocalKey) -> Self {
        Self {
            active: false,
            ..Self::active(coordinate, local_key)
        }
    }

    pub fn field(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    pub fn subject(mut self, subject: LocalKey) -> Self {
        self.references.subject = Some(subject);
        self
    }

    pub fn parent(mut self, parent: LocalKey) -> Self {
        self.references.parent = Some(parent);
        self
    }

    pub fn business_key(mut self, business_key: BusinessKey) -> Self {
        self.business_key = Some(business_key);
        self
    }
}

/// Restartable, forward-only cursor over source records.
#[async_trait]
pub trait RecordSource: Send {
    /// Next record, or `None` at the end of the stream.
    async fn next(&mut self) -> Result<Option<SourceRecord>>;

    /// Rewinds to the first record.
    async fn restart(&mut self) -> Result<()>;
}

/// Record source over an in-memory list.
#[derive(Debug, Clone, Default)]
pub struct VecRecordSource {
    records: Vec<SourceRecord>,
    position: usize,
}

impl VecRecordSource {
    pub fn new(records: Vec<SourceRecord>) -> Self {
        Self {
            records,
            position: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.records.len().saturating_sub(self.position)
    }
}

#[async_trait]
impl RecordSource for VecRecordSource {
    async fn next(&mut self) -> Result<Option<SourceRecord>> {
        let record = self.records.get(self.position).cloned();
        if record.is_some() {
            self.position += 1;
        }
        Ok(record)
    }

    async fn restart(&mut self) -> Result<()> {
        self.position = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::EntityKind;
    use serde_json::json;

    fn record(row: u64) -> SourceRecord {
        SourceRecord::active(
            SourceCoordinate::new("encounters.csv", row),
            LocalKey::new("emis", EntityKind::Encounter, row.to_string()),
        )
        .field("class", json!("AMB"))
    }

    #[tokio::test]
    async fn test_vec_source_is_restartable() {
        let mut source = VecRecordSource::new(vec![record(1), record(2)]);
        assert_eq!(source.next().await.unwrap().unwrap().coordinate.row, 1);
        assert_eq!(source.next().await.unwrap().unwrap().coordinate.row, 2);
        assert!(source.next().await.unwrap().is_none());
        assert_eq!(source.remaining(), 0);

        source.restart().await.unwrap();
        assert_eq!(source.remaining(), 2);
        assert_eq!(source.next().await.unwrap().unwrap().coordinate.row, 1);
    }

    #[test]
    fn test_inactive_record_keeps_key() {
        let key = LocalKey::new("emis", EntityKind::Problem, "c1");
        let record = SourceRecord::inactive(SourceCoordinate::new("problems.csv", 3), key.clone());
        assert!(!record.active);
        assert_eq!(record.local_key, key);
    }
}
