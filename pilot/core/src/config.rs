use crate::{
    error::{Result, ValidationError},
    validation::{is_dns1123_label, is_message_name},
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Configuration content: a message schema name plus the message body.
///
/// Stores handle content opaquely; the descriptor registered for the type
/// knows how to decode, validate and key it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub name: String,
    pub value: serde_json::Value,
}

/// A typed message with a stable schema name.
pub trait MessageType: Serialize + DeserializeOwned {
    const NAME: &'static str;
}

/// A message that can be stored as configuration.
pub trait Spec: MessageType {
    /// The identity of the object, unique per type within a store.
    fn key(&self) -> String;

    fn validate(&self) -> Result<(), ValidationError>;
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("expected a {expected} message, got {actual}")]
    Mismatch {
        expected: &'static str,
        actual: String,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Static metadata for one configuration type.
#[derive(Clone)]
pub struct Schema {
    /// Short kebab-case name, e.g. `route-rule`.
    pub ty: &'static str,
    pub plural: &'static str,
    pub message_name: &'static str,

    /// Internal types are derived from other sources; they may be listed and
    /// watched but not mutated directly.
    pub internal: bool,

    validate: fn(&Message) -> Result<(), ValidationError>,
    key: fn(&Message) -> Result<String, ValidationError>,
}

/// A set of schemas.
#[derive(Clone, Debug, Default)]
pub struct Descriptor(Vec<Schema>);

/// An opaque token assigned by a store on every write. Only equality is
/// meaningful.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

/// A stored configuration object.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub ty: String,
    pub key: String,
    pub revision: Revision,
    pub content: Message,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    Added,
    Updated,
    Deleted,
}

pub type ConfigHandler = Arc<dyn Fn(&Config, Event) + Send + Sync>;

/// CRUD access to configuration objects with optimistic concurrency.
///
/// Lists are sorted by key. Returned objects are snapshots; mutating them has
/// no effect on the store.
pub trait ConfigStore: Send + Sync {
    fn descriptor(&self) -> &Descriptor;

    fn get(&self, ty: &str, key: &str) -> Option<(Message, Revision)>;

    /// Lists all objects of a type. Unknown types yield an empty list.
    fn list(&self, ty: &str) -> Result<Vec<Config>>;

    /// Creates an object. The type is inferred from the message name.
    fn post(&self, content: Message) -> Result<Revision>;

    /// Replaces an object if its current revision equals `revision`.
    fn put(&self, content: Message, revision: &Revision) -> Result<Revision>;

    fn delete(&self, ty: &str, key: &str) -> Result<()>;
}

/// A config store backed by a local mirror that notifies handlers as the
/// mirror changes.
#[async_trait::async_trait]
pub trait ConfigStoreCache: ConfigStore {
    /// Handlers are append-only and are invoked from the sync task.
    fn register_event_handler(&self, ty: &str, handler: ConfigHandler);

    /// True once the initial list has been copied into the mirror.
    fn has_synced(&self) -> bool;

    /// Drives synchronization until shutdown is signaled.
    async fn run(&self, shutdown: drain::Watch);
}

// === impl Message ===

impl Message {
    pub fn encode<T: MessageType>(spec: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            name: T::NAME.to_string(),
            value: serde_json::to_value(spec)?,
        })
    }

    pub fn decode<T: MessageType>(&self) -> Result<T, DecodeError> {
        if self.name != T::NAME {
            return Err(DecodeError::Mismatch {
                expected: T::NAME,
                actual: self.name.clone(),
            });
        }
        Ok(T::deserialize(&self.value)?)
    }
}

// === impl Schema ===

impl Schema {
    pub fn of<T: Spec>(ty: &'static str, plural: &'static str) -> Self {
        Self {
            ty,
            plural,
            message_name: T::NAME,
            internal: false,
            validate: validate_spec::<T>,
            key: key_spec::<T>,
        }
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    pub fn validate(&self, content: &Message) -> Result<(), ValidationError> {
        if content.name != self.message_name {
            return Err(format!(
                "mismatched message type {:?} for {}",
                content.name, self.ty
            )
            .into());
        }
        (self.validate)(content)
    }

    pub fn key(&self, content: &Message) -> Result<String, ValidationError> {
        (self.key)(content)
    }
}

fn validate_spec<T: Spec>(content: &Message) -> Result<(), ValidationError> {
    let spec = content
        .decode::<T>()
        .map_err(|e| ValidationError::new(e.to_string()))?;
    spec.validate()
}

fn key_spec<T: Spec>(content: &Message) -> Result<String, ValidationError> {
    let spec = content
        .decode::<T>()
        .map_err(|e| ValidationError::new(e.to_string()))?;
    Ok(spec.key())
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("ty", &self.ty)
            .field("plural", &self.plural)
            .field("message_name", &self.message_name)
            .field("internal", &self.internal)
            .finish()
    }
}

// === impl Descriptor ===

impl Descriptor {
    pub fn new(schemas: impl IntoIterator<Item = Schema>) -> Self {
        Self(schemas.into_iter().collect())
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Schema> {
        self.0.iter()
    }

    pub fn types(&self) -> Vec<&'static str> {
        self.0.iter().map(|s| s.ty).collect()
    }

    pub fn get(&self, ty: &str) -> Option<&Schema> {
        self.0.iter().find(|s| s.ty == ty)
    }

    pub fn get_by_message_name(&self, name: &str) -> Option<&Schema> {
        self.0.iter().find(|s| s.message_name == name)
    }

    /// Checks that type names are DNS-1123 labels, that message names are
    /// well-formed, and that neither repeats.
    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        for (i, schema) in self.0.iter().enumerate() {
            if !is_dns1123_label(schema.ty) {
                errs.push(format!("invalid type name: {:?}", schema.ty));
            }
            if !is_dns1123_label(schema.plural) {
                errs.push(format!("invalid plural name: {:?}", schema.plural));
            }
            if !is_message_name(schema.message_name) {
                errs.push(format!("invalid message name: {:?}", schema.message_name));
            }
            let earlier = &self.0[..i];
            if earlier.iter().any(|s| s.ty == schema.ty) {
                errs.push(format!("duplicate type: {:?}", schema.ty));
            }
            if earlier.iter().any(|s| s.message_name == schema.message_name) {
                errs.push(format!("duplicate message name: {:?}", schema.message_name));
            }
        }
        errs.into_result()
    }
}

impl FromIterator<Schema> for Descriptor {
    fn from_iter<T: IntoIterator<Item = Schema>>(iter: T) -> Self {
        Self::new(iter)
    }
}

impl<'a> IntoIterator for &'a Descriptor {
    type Item = &'a Schema;
    type IntoIter = std::slice::Iter<'a, Schema>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// === impl Revision ===

impl Revision {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Revision {
    fn from(rev: String) -> Self {
        Self(rev)
    }
}

impl From<&str> for Revision {
    fn from(rev: &str) -> Self {
        Self(rev.to_string())
    }
}

impl From<u64> for Revision {
    fn from(rev: u64) -> Self {
        Self(rev.to_string())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// === impl Event ===

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "add",
            Self::Updated => "update",
            Self::Deleted => "delete",
        })
    }
}
