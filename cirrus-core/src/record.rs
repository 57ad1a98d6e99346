//! Record types: the generic boundary record and the strong entity types
//!
//! The remote store speaks `RemoteRecord`, a type tag plus a key-typed field
//! map. Fetched records are converted into `Topic`, `Note` or `Share` via
//! `ChangedRecord::try_from` before anything else looks at them.

use crate::enums::{DatabaseScope, Permission};
use crate::error::ValidationError;
use crate::identity::{RecordId, Timestamp, UserId, ZoneId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Record type names and field keys understood by the engine.
pub mod schema {
    pub const TOPIC: &str = "Topic";
    pub const NOTE: &str = "Note";
    pub const SHARE: &str = "cloudkit.share";

    pub const TOPIC_NAME: &str = "name";
    pub const NOTE_TITLE: &str = "title";
    pub const NOTE_TOPIC: &str = "topic";
    pub const SHARE_PERMISSION: &str = "currentUserPermission";
}

/// Server-assigned version marker used for optimistic concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordVersion(pub u64);

impl RecordVersion {
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

/// A field value at the remote-store boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldValue {
    String(String),
    Int(i64),
    Reference(RecordId),
    Bytes(Vec<u8>),
}

/// A record as the remote store sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: RecordId,
    pub record_type: String,
    pub fields: BTreeMap<String, FieldValue>,
    /// `None` until the server has accepted the record once.
    pub version: Option<RecordVersion>,
    pub creator: Option<UserId>,
    /// The share record this record is the root of, if shared independently.
    pub share: Option<RecordId>,
    pub parent: Option<RecordId>,
    pub modified_at: Option<Timestamp>,
}

impl RemoteRecord {
    pub fn new(id: RecordId, record_type: impl Into<String>) -> Self {
        Self {
            id,
            record_type: record_type.into(),
            fields: BTreeMap::new(),
            version: None,
            creator: None,
            share: None,
            parent: None,
            modified_at: None,
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(key.into(), value);
        self
    }

    pub fn with_version(mut self, version: RecordVersion) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_creator(mut self, creator: UserId) -> Self {
        self.creator = Some(creator);
        self
    }

    pub fn with_share(mut self, share: RecordId) -> Self {
        self.share = Some(share);
        self
    }

    pub fn with_parent(mut self, parent: RecordId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn string_field(&self, key: &str) -> Option<&str> {
        match self.fields.get(key) {
            Some(FieldValue::String(value)) => Some(value),
            _ => None,
        }
    }

    pub fn reference_field(&self, key: &str) -> Option<&RecordId> {
        match self.fields.get(key) {
            Some(FieldValue::Reference(id)) => Some(id),
            _ => None,
        }
    }

    fn required_string(&self, key: &str) -> Result<String, ValidationError> {
        match self.fields.get(key) {
            Some(FieldValue::String(value)) => Ok(value.clone()),
            Some(_) => Err(ValidationError::InvalidValue {
                field: key.to_string(),
                reason: "expected a string".to_string(),
            }),
            None => Err(ValidationError::RequiredFieldMissing {
                record_type: self.record_type.clone(),
                field: key.to_string(),
            }),
        }
    }

    fn optional_reference(&self, key: &str) -> Result<Option<RecordId>, ValidationError> {
        match self.fields.get(key) {
            Some(FieldValue::Reference(id)) => Ok(Some(id.clone())),
            Some(_) => Err(ValidationError::InvalidValue {
                field: key.to_string(),
                reason: "expected a record reference".to_string(),
            }),
            None => Ok(None),
        }
    }
}

// ============================================================================
// STRONG ENTITY TYPES
// ============================================================================

/// Parent entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: RecordId,
    pub name: String,
    pub version: Option<RecordVersion>,
    pub creator: Option<UserId>,
    pub share: Option<RecordId>,
}

impl Topic {
    /// A local draft that the server has not seen yet.
    pub fn draft(zone: ZoneId, name: impl Into<String>) -> Self {
        Self {
            id: RecordId::generate(zone),
            name: name.into(),
            version: None,
            creator: None,
            share: None,
        }
    }

    pub fn to_remote(&self) -> RemoteRecord {
        RemoteRecord {
            id: self.id.clone(),
            record_type: schema::TOPIC.to_string(),
            fields: BTreeMap::from([(
                schema::TOPIC_NAME.to_string(),
                FieldValue::String(self.name.clone()),
            )]),
            version: self.version,
            creator: self.creator.clone(),
            share: self.share.clone(),
            parent: None,
            modified_at: None,
        }
    }
}

/// Child entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub id: RecordId,
    pub title: String,
    /// Owning topic. `None` puts the note in the orphan bucket.
    pub topic: Option<RecordId>,
    /// Sharing hierarchy parent; mirrors `topic` outside the public scope.
    pub parent: Option<RecordId>,
    pub version: Option<RecordVersion>,
    pub creator: Option<UserId>,
    pub share: Option<RecordId>,
}

impl Note {
    /// A local draft under `topic`.
    ///
    /// The public scope does not support sharing hierarchies, so no parent is
    /// set there.
    pub fn draft(
        zone: ZoneId,
        title: impl Into<String>,
        topic: Option<&RecordId>,
        scope: DatabaseScope,
    ) -> Self {
        let parent = match scope {
            DatabaseScope::Public => None,
            _ => topic.cloned(),
        };
        Self {
            id: RecordId::generate(zone),
            title: title.into(),
            topic: topic.cloned(),
            parent,
            version: None,
            creator: None,
            share: None,
        }
    }

    /// Whether this note is shared on its own rather than through its topic.
    pub fn is_independently_shared(&self) -> bool {
        self.share.is_some()
    }

    pub fn to_remote(&self) -> RemoteRecord {
        let mut fields = BTreeMap::from([(
            schema::NOTE_TITLE.to_string(),
            FieldValue::String(self.title.clone()),
        )]);
        if let Some(topic) = &self.topic {
            fields.insert(
                schema::NOTE_TOPIC.to_string(),
                FieldValue::Reference(topic.clone()),
            );
        }
        RemoteRecord {
            id: self.id.clone(),
            record_type: schema::NOTE.to_string(),
            fields,
            version: self.version,
            creator: self.creator.clone(),
            share: self.share.clone(),
            parent: self.parent.clone(),
            modified_at: None,
        }
    }
}

/// Share metadata: which record is shared and what the current user may do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    pub id: RecordId,
    pub version: Option<RecordVersion>,
    /// `None` when the current user is not a participant.
    pub participant_permission: Option<Permission>,
}

/// A fetched record after conversion to its strong type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangedRecord {
    Topic(Topic),
    Note(Note),
    Share(Share),
}

impl ChangedRecord {
    pub fn id(&self) -> &RecordId {
        match self {
            ChangedRecord::Topic(topic) => &topic.id,
            ChangedRecord::Note(note) => &note.id,
            ChangedRecord::Share(share) => &share.id,
        }
    }
}

impl TryFrom<RemoteRecord> for ChangedRecord {
    type Error = ValidationError;

    fn try_from(record: RemoteRecord) -> Result<Self, Self::Error> {
        match record.record_type.as_str() {
            schema::TOPIC => Ok(ChangedRecord::Topic(Topic {
                name: record.required_string(schema::TOPIC_NAME)?,
                id: record.id,
                version: record.version,
                creator: record.creator,
                share: record.share,
            })),
            schema::NOTE => Ok(ChangedRecord::Note(Note {
                title: record.required_string(schema::NOTE_TITLE)?,
                topic: record.optional_reference(schema::NOTE_TOPIC)?,
                id: record.id,
                parent: record.parent,
                version: record.version,
                creator: record.creator,
                share: record.share,
            })),
            schema::SHARE => {
                let participant_permission = match record.string_field(schema::SHARE_PERMISSION) {
                    Some(raw) => Some(raw.parse::<Permission>().map_err(|reason| {
                        ValidationError::InvalidValue {
                            field: schema::SHARE_PERMISSION.to_string(),
                            reason,
                        }
                    })?),
                    None => None,
                };
                Ok(ChangedRecord::Share(Share {
                    id: record.id,
                    version: record.version,
                    participant_permission,
                }))
            }
            _ => Err(ValidationError::UnknownRecordType {
                record_type: record.record_type,
            }),
        }
    }
}

impl From<&Share> for RemoteRecord {
    fn from(share: &Share) -> Self {
        let mut record = RemoteRecord::new(share.id.clone(), schema::SHARE);
        record.version = share.version;
        if let Some(permission) = share.participant_permission {
            record = record.with_field(
                schema::SHARE_PERMISSION,
                FieldValue::String(permission.to_string()),
            );
        }
        record
    }
}
