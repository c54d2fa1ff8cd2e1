use ahash::AHashMap as HashMap;
use pilot_core::{
    Config, ConfigHandler, ConfigStore, ConfigStoreCache, Descriptor, Error, Message, Result,
    Revision,
};
use std::sync::Arc;
use tracing::warn;

/// Serves the union of several stores' types, routing each operation to the
/// one store that owns the type.
pub struct Aggregate<S: ?Sized> {
    descriptor: Descriptor,
    stores: Vec<Arc<S>>,
    by_type: HashMap<&'static str, Arc<S>>,
}

pub type AggregateStore = Aggregate<dyn ConfigStore>;
pub type AggregateCache = Aggregate<dyn ConfigStoreCache>;

// === impl Aggregate ===

impl<S: ConfigStore + ?Sized> Aggregate<S> {
    /// Fails with [`Error::Conflict`] if two stores advertise the same type.
    pub fn new(stores: impl IntoIterator<Item = Arc<S>>) -> Result<Self> {
        let stores = stores.into_iter().collect::<Vec<_>>();
        let mut schemas = Vec::new();
        let mut by_type = HashMap::new();
        for store in &stores {
            for schema in store.descriptor() {
                if by_type.insert(schema.ty, store.clone()).is_some() {
                    return Err(Error::Conflict(schema.ty.to_string()));
                }
                schemas.push(schema.clone());
            }
        }
        Ok(Self {
            descriptor: Descriptor::new(schemas),
            stores,
            by_type,
        })
    }

    fn store_for(&self, ty: &str) -> Result<&Arc<S>> {
        self.by_type
            .get(ty)
            .ok_or_else(|| Error::UnknownType(ty.to_string()))
    }

    fn store_for_message(&self, content: &Message) -> Result<&Arc<S>> {
        let schema = self
            .descriptor
            .get_by_message_name(&content.name)
            .ok_or_else(|| Error::UnknownType(content.name.clone()))?;
        self.store_for(schema.ty)
    }
}

impl<S: ConfigStore + ?Sized> ConfigStore for Aggregate<S> {
    fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    fn get(&self, ty: &str, key: &str) -> Option<(Message, Revision)> {
        self.by_type.get(ty)?.get(ty, key)
    }

    fn list(&self, ty: &str) -> Result<Vec<Config>> {
        match self.by_type.get(ty) {
            Some(store) => store.list(ty),
            None => Ok(Vec::new()),
        }
    }

    fn post(&self, content: Message) -> Result<Revision> {
        self.store_for_message(&content)?.post(content)
    }

    fn put(&self, content: Message, revision: &Revision) -> Result<Revision> {
        self.store_for_message(&content)?.put(content, revision)
    }

    fn delete(&self, ty: &str, key: &str) -> Result<()> {
        self.store_for(ty)?.delete(ty, key)
    }
}

#[async_trait::async_trait]
impl ConfigStoreCache for Aggregate<dyn ConfigStoreCache> {
    fn register_event_handler(&self, ty: &str, handler: ConfigHandler) {
        match self.by_type.get(ty) {
            Some(cache) => cache.register_event_handler(ty, handler),
            None => warn!(r#type = ty, "Ignoring handler for unknown type"),
        }
    }

    fn has_synced(&self) -> bool {
        self.stores.iter().all(|c| c.has_synced())
    }

    async fn run(&self, shutdown: drain::Watch) {
        futures::future::join_all(self.stores.iter().map(|c| c.run(shutdown.clone()))).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        testutil::{self, WIDGET},
        Controller, MemoryStore,
    };
    use pilot_core::ErrorKind;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn stores() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
        (
            Arc::new(MemoryStore::new(testutil::descriptor())),
            Arc::new(MemoryStore::new(testutil::gizmo_descriptor())),
        )
    }

    #[test]
    fn union_of_descriptors() {
        let (widgets, gizmos) = stores();
        let agg = AggregateStore::new([
            widgets as Arc<dyn ConfigStore>,
            gizmos as Arc<dyn ConfigStore>,
        ])
        .unwrap();
        assert_eq!(agg.descriptor().types(), [WIDGET, testutil::DERIVED, "gizmo"]);
    }

    #[test]
    fn duplicate_types_conflict() {
        let a = Arc::new(MemoryStore::new(testutil::descriptor())) as Arc<dyn ConfigStore>;
        let b = Arc::new(MemoryStore::new(testutil::descriptor())) as Arc<dyn ConfigStore>;
        let err = AggregateStore::new([a, b]).err().expect("must conflict");
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn routes_by_type() {
        let (widgets, gizmos) = stores();
        let agg = AggregateStore::new([
            widgets.clone() as Arc<dyn ConfigStore>,
            gizmos.clone() as Arc<dyn ConfigStore>,
        ])
        .unwrap();

        let rev = agg.post(testutil::gizmo("g")).unwrap();
        assert_eq!(gizmos.get("gizmo", "g").map(|(_, r)| r), Some(rev.clone()));
        assert_eq!(widgets.get("gizmo", "g"), None);
        assert_eq!(agg.get("gizmo", "g").map(|(_, r)| r), Some(rev.clone()));

        agg.post(testutil::widget("w", 1)).unwrap();
        assert_eq!(agg.list(WIDGET).unwrap().len(), 1);
        assert_eq!(widgets.list(WIDGET).unwrap().len(), 1);

        agg.put(testutil::gizmo("g"), &rev).unwrap();
        agg.delete("gizmo", "g").unwrap();
        assert_eq!(agg.get("gizmo", "g"), None);
    }

    #[test]
    fn unknown_types() {
        let (widgets, _) = stores();
        let agg = AggregateStore::new([widgets as Arc<dyn ConfigStore>]).unwrap();
        assert_eq!(agg.get("gizmo", "g"), None);
        assert!(agg.list("gizmo").unwrap().is_empty());
        assert_eq!(agg.delete("gizmo", "g").unwrap_err().kind(), ErrorKind::UnknownType);
        assert_eq!(agg.post(testutil::gizmo("g")).unwrap_err().kind(), ErrorKind::UnknownType);
    }

    #[tokio::test(start_paused = true)]
    async fn cache_syncs_all_members() {
        let _tracing = testutil::init_tracing();
        let (widgets, gizmos) = stores();
        widgets.post(testutil::widget("w", 1)).unwrap();
        gizmos.post(testutil::gizmo("g")).unwrap();

        let agg = Arc::new(
            AggregateCache::new([
                Arc::new(Controller::new(widgets, Duration::from_secs(1)))
                    as Arc<dyn ConfigStoreCache>,
                Arc::new(Controller::new(gizmos, Duration::from_secs(1)))
                    as Arc<dyn ConfigStoreCache>,
            ])
            .unwrap(),
        );
        assert!(!agg.has_synced());

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        agg.register_event_handler(
            "gizmo",
            Arc::new(move |config: &Config, event: pilot_core::Event| {
                let _ = tx.send((config.key.clone(), event));
            }),
        );

        let (drain_tx, drain_rx) = drain::channel();
        let task = tokio::spawn({
            let agg = agg.clone();
            async move { agg.run(drain_rx).await }
        });

        assert_eq!(
            rx.recv().await,
            Some(("g".to_string(), pilot_core::Event::Added))
        );
        while !agg.has_synced() {
            tokio::task::yield_now().await;
        }
        assert_eq!(agg.list(WIDGET).unwrap().len(), 1);

        drain_tx.drain().await;
        task.await.unwrap();
    }
}
