//! The syncable record envelope.

use crate::ids::{OwnerId, RecordId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// The unit of synchronization.
///
/// A `SyncRecord` carries the envelope columns every syncable kind shares
/// (`id`, `owner_id`, `updated_at`, `deleted`) plus an opaque map of domain
/// fields. `updated_at` is the sole conflict-resolution signal: the record
/// with the greatest mutation timestamp wins, everywhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Record identifier, unique within its kind and owner.
    pub id: RecordId,
    /// Owning user; `None` means not yet claimed by a user.
    pub owner_id: Option<OwnerId>,
    /// UTC mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Soft-delete marker. Deletion is a mutation, not a removal.
    pub deleted: bool,
    /// Opaque domain payload.
    #[serde(default)]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

impl SyncRecord {
    /// Creates a record with no owner and no domain fields.
    pub fn new(id: impl Into<RecordId>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            owner_id: None,
            updated_at,
            deleted: false,
            fields: serde_json::Map::new(),
        }
    }

    /// Sets the owner.
    pub fn with_owner(mut self, owner: impl Into<OwnerId>) -> Self {
        self.owner_id = Some(owner.into());
        self
    }

    /// Sets the soft-delete marker.
    pub fn with_deleted(mut self, deleted: bool) -> Self {
        self.deleted = deleted;
        self
    }

    /// Adds a domain field.
    pub fn with_field(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    /// Returns true if this record's mutation timestamp is strictly after
    /// the other's. Equal timestamps are not "newer": a lesser-or-equal
    /// write must be discarded wherever it is observed.
    pub fn is_newer_than(&self, other: &SyncRecord) -> bool {
        self.updated_at > other.updated_at
    }

    /// Computes the content fingerprint of this record.
    ///
    /// The digest covers every field, so two records have equal digests
    /// iff they are equal. Domain fields hash through their canonical JSON
    /// form (`serde_json` maps serialize with sorted keys).
    pub fn digest(&self) -> RecordDigest {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_str().as_bytes());
        hasher.update([0u8]);
        if let Some(owner) = &self.owner_id {
            hasher.update(owner.as_str().as_bytes());
        }
        hasher.update([0u8]);
        hasher.update(self.updated_at.to_rfc3339().as_bytes());
        hasher.update([u8::from(self.deleted)]);
        hasher.update(serde_json::Value::Object(self.fields.clone()).to_string().as_bytes());
        RecordDigest(hasher.finalize().into())
    }
}

/// Content fingerprint of a [`SyncRecord`].
///
/// Used as record identity in echo-suppression sets and for incoming-queue
/// deduplication: identical deliveries collapse to one digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordDigest([u8; 32]);

impl RecordDigest {
    /// Returns the raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for RecordDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RecordDigest({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// One entry of a backend index: the (id, updated_at) pair the reconciler
/// diffs against local state without fetching full records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    /// Record identifier.
    pub id: RecordId,
    /// UTC mutation timestamp of the backend copy.
    pub updated_at: DateTime<Utc>,
}

impl IndexEntry {
    /// Creates an index entry.
    pub fn new(id: impl Into<RecordId>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn newer_than_is_strict() {
        let a = SyncRecord::new("a", ts(10));
        let b = SyncRecord::new("a", ts(10));
        let c = SyncRecord::new("a", ts(11));
        assert!(!a.is_newer_than(&b));
        assert!(c.is_newer_than(&a));
        assert!(!a.is_newer_than(&c));
    }

    #[test]
    fn digest_covers_all_fields() {
        let base = SyncRecord::new("a", ts(10)).with_owner("u1");
        assert_eq!(base.digest(), base.clone().digest());

        assert_ne!(base.digest(), base.clone().with_deleted(true).digest());
        assert_ne!(
            base.digest(),
            base.clone().with_field("name", "x".into()).digest()
        );
        let other_owner = SyncRecord::new("a", ts(10)).with_owner("u2");
        assert_ne!(base.digest(), other_owner.digest());

        let mut later = base.clone();
        later.updated_at = ts(11);
        assert_ne!(base.digest(), later.digest());
    }

    #[test]
    fn unowned_and_owned_digests_differ() {
        let unowned = SyncRecord::new("a", ts(10));
        let owned = SyncRecord::new("a", ts(10)).with_owner("");
        assert_ne!(unowned.digest(), owned.digest());
    }

    proptest! {
        #[test]
        fn digest_equality_matches_record_equality(
            id_a in "[a-z]{1,8}", id_b in "[a-z]{1,8}",
            secs_a in 0i64..4_000_000, secs_b in 0i64..4_000_000,
            deleted_a: bool, deleted_b: bool,
        ) {
            let a = SyncRecord::new(id_a.as_str(), ts(secs_a)).with_deleted(deleted_a);
            let b = SyncRecord::new(id_b.as_str(), ts(secs_b)).with_deleted(deleted_b);
            prop_assert_eq!(a == b, a.digest() == b.digest());
        }
    }
}
