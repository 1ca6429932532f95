//! Wire row conversion.

use crate::error::{ModelError, ModelResult};
use crate::ids::{OwnerId, RecordId};
use crate::record::SyncRecord;
use chrono::{DateTime, Utc};
use serde_json::Value;

/// Converts between backend wire rows and [`SyncRecord`]s.
///
/// One codec is registered per record kind. `decode` maps a raw backend row
/// to the envelope; `encode` is the inverse and produces the row upserted to
/// the backend. Implementations must round-trip: decoding an encoded record
/// yields an equal record, so echoed rows keep their digest.
pub trait RecordCodec: Send + Sync {
    /// Decodes a backend wire row.
    fn decode(&self, row: &Value) -> ModelResult<SyncRecord>;

    /// Encodes a record into a backend wire row.
    fn encode(&self, record: &SyncRecord) -> Value;
}

/// The default codec for the standard envelope column layout.
///
/// Columns `id`, `owner_id` (nullable), `updated_at` (RFC 3339) and
/// `deleted` map to the envelope; every other key passes through as a
/// domain field.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvelopeCodec;

const ENVELOPE_COLUMNS: [&str; 4] = ["id", "owner_id", "updated_at", "deleted"];

impl RecordCodec for EnvelopeCodec {
    fn decode(&self, row: &Value) -> ModelResult<SyncRecord> {
        let map = row.as_object().ok_or(ModelError::NotAnObject)?;

        let id = map
            .get("id")
            .ok_or(ModelError::MissingField("id"))?
            .as_str()
            .ok_or(ModelError::WrongType("id"))?;

        let owner_id = match map.get("owner_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(owner)) => Some(OwnerId::new(owner.clone())),
            Some(_) => return Err(ModelError::WrongType("owner_id")),
        };

        let raw_updated = map
            .get("updated_at")
            .ok_or(ModelError::MissingField("updated_at"))?
            .as_str()
            .ok_or(ModelError::WrongType("updated_at"))?;
        let updated_at: DateTime<Utc> = DateTime::parse_from_rfc3339(raw_updated)
            .map_err(|source| ModelError::InvalidTimestamp {
                field: "updated_at",
                source,
            })?
            .with_timezone(&Utc);

        let deleted = match map.get("deleted") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(deleted)) => *deleted,
            Some(_) => return Err(ModelError::WrongType("deleted")),
        };

        let mut fields = serde_json::Map::new();
        for (key, value) in map {
            if !ENVELOPE_COLUMNS.contains(&key.as_str()) {
                fields.insert(key.clone(), value.clone());
            }
        }

        Ok(SyncRecord {
            id: RecordId::new(id),
            owner_id,
            updated_at,
            deleted,
            fields,
        })
    }

    fn encode(&self, record: &SyncRecord) -> Value {
        let mut row = serde_json::Map::new();
        row.insert("id".into(), Value::String(record.id.as_str().to_string()));
        row.insert(
            "owner_id".into(),
            match &record.owner_id {
                Some(owner) => Value::String(owner.as_str().to_string()),
                None => Value::Null,
            },
        );
        row.insert(
            "updated_at".into(),
            Value::String(record.updated_at.to_rfc3339()),
        );
        row.insert("deleted".into(), Value::Bool(record.deleted));
        for (key, value) in &record.fields {
            row.insert(key.clone(), value.clone());
        }
        Value::Object(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn decode_standard_row() {
        let row = json!({
            "id": "note-1",
            "owner_id": "u1",
            "updated_at": "2024-03-01T10:00:00+00:00",
            "deleted": false,
            "title": "groceries",
        });

        let record = EnvelopeCodec.decode(&row).unwrap();
        assert_eq!(record.id, RecordId::new("note-1"));
        assert_eq!(record.owner_id, Some(OwnerId::new("u1")));
        assert!(!record.deleted);
        assert_eq!(record.fields.get("title"), Some(&json!("groceries")));
        assert!(!record.fields.contains_key("id"));
    }

    #[test]
    fn decode_tolerates_null_owner_and_missing_deleted() {
        let row = json!({
            "id": "note-1",
            "owner_id": null,
            "updated_at": "2024-03-01T10:00:00Z",
        });

        let record = EnvelopeCodec.decode(&row).unwrap();
        assert_eq!(record.owner_id, None);
        assert!(!record.deleted);
    }

    #[test]
    fn decode_rejects_malformed_rows() {
        assert!(matches!(
            EnvelopeCodec.decode(&json!("not a row")),
            Err(ModelError::NotAnObject)
        ));
        assert!(matches!(
            EnvelopeCodec.decode(&json!({ "updated_at": "2024-03-01T10:00:00Z" })),
            Err(ModelError::MissingField("id"))
        ));
        assert!(matches!(
            EnvelopeCodec.decode(&json!({ "id": "a", "updated_at": "soon" })),
            Err(ModelError::InvalidTimestamp { field: "updated_at", .. })
        ));
        assert!(matches!(
            EnvelopeCodec.decode(&json!({ "id": "a", "updated_at": "2024-03-01T10:00:00Z", "deleted": "yes" })),
            Err(ModelError::WrongType("deleted"))
        ));
    }

    #[test]
    fn round_trip_preserves_digest() {
        let record = SyncRecord::new("note-1", ts(1_700_000_000))
            .with_owner("u1")
            .with_field("title", json!("groceries"))
            .with_field("priority", json!(3));

        let decoded = EnvelopeCodec.decode(&EnvelopeCodec.encode(&record)).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(decoded.digest(), record.digest());
    }
}
