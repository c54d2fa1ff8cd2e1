use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use pilot_core::{Config, ConfigStore, Descriptor, Error, Message, Result, Revision, Schema};
use std::collections::BTreeMap;
use tracing::debug;

/// An in-process config store.
///
/// Revisions come from a single counter shared by all types, so every write
/// yields a revision distinct from every earlier one.
#[derive(Debug)]
pub struct MemoryStore {
    descriptor: Descriptor,
    state: RwLock<State>,
}

#[derive(Debug, Default)]
struct State {
    revision: u64,
    by_type: HashMap<&'static str, BTreeMap<String, Entry>>,
}

#[derive(Clone, Debug)]
struct Entry {
    content: Message,
    revision: Revision,
}

// === impl MemoryStore ===

impl MemoryStore {
    pub fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            state: RwLock::new(State::default()),
        }
    }

    /// Looks up the mutable schema for a message and returns it with the
    /// validated key.
    fn check(&self, content: &Message) -> Result<(&Schema, String)> {
        let schema = self
            .descriptor
            .get_by_message_name(&content.name)
            .ok_or_else(|| Error::UnknownType(content.name.clone()))?;
        if schema.internal {
            return Err(Error::UnknownType(schema.ty.to_string()));
        }
        schema
            .validate(content)
            .map_err(|e| Error::validation(schema.ty, e))?;
        let key = schema
            .key(content)
            .map_err(|e| Error::validation(schema.ty, e))?;
        Ok((schema, key))
    }
}

impl ConfigStore for MemoryStore {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn get(&self, ty: &str, key: &str) -> Option<(Message, Revision)> {
        let state = self.state.read();
        let entry = state.by_type.get(ty)?.get(key)?;
        Some((entry.content.clone(), entry.revision.clone()))
    }

    fn list(&self, ty: &str) -> Result<Vec<Config>> {
        let state = self.state.read();
        let Some(entries) = state.by_type.get(ty) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .iter()
            .map(|(key, entry)| Config {
                ty: ty.to_string(),
                key: key.clone(),
                revision: entry.revision.clone(),
                content: entry.content.clone(),
            })
            .collect())
    }

    fn post(&self, content: Message) -> Result<Revision> {
        let (schema, key) = self.check(&content)?;

        let mut state = self.state.write();
        state.revision += 1;
        let revision = Revision::from(state.revision);
        let entries = state.by_type.entry(schema.ty).or_default();
        if entries.contains_key(&key) {
            return Err(Error::already_exists(schema.ty, key));
        }
        debug!(r#type = schema.ty, %key, %revision, "Created");
        entries.insert(
            key,
            Entry {
                content,
                revision: revision.clone(),
            },
        );
        Ok(revision)
    }

    fn put(&self, content: Message, revision: &Revision) -> Result<Revision> {
        let (schema, key) = self.check(&content)?;

        let mut state = self.state.write();
        state.revision += 1;
        let next = Revision::from(state.revision);
        let entry = state
            .by_type
            .get_mut(schema.ty)
            .and_then(|entries| entries.get_mut(&key))
            .ok_or_else(|| Error::not_found(schema.ty, &key))?;
        if entry.revision != *revision {
            return Err(Error::RevisionMismatch {
                ty: schema.ty.to_string(),
                key,
                expected: revision.to_string(),
                actual: entry.revision.to_string(),
            });
        }
        debug!(r#type = schema.ty, %key, revision = %next, "Updated");
        entry.content = content;
        entry.revision = next.clone();
        Ok(next)
    }

    fn delete(&self, ty: &str, key: &str) -> Result<()> {
        let schema = self
            .descriptor
            .get(ty)
            .filter(|s| !s.internal)
            .ok_or_else(|| Error::UnknownType(ty.to_string()))?;

        let mut state = self.state.write();
        state
            .by_type
            .get_mut(schema.ty)
            .and_then(|entries| entries.remove(key))
            .ok_or_else(|| Error::not_found(ty, key))?;
        debug!(r#type = ty, %key, "Deleted");
        Ok(())
    }
}
