use ahash::AHashMap as HashMap;
use parking_lot::RwLock;
use pilot_core::{
    Config, ConfigHandler, ConfigStore, ConfigStoreCache, Descriptor, Error, Event, Message,
    Result, Revision,
};
use std::{
    cmp::Ordering,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
};
use tokio::{
    sync::Notify,
    time::{self, Duration, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

const LIST_ATTEMPTS: u32 = 4;
const LIST_BACKOFF: Duration = Duration::from_millis(10);

/// Mirrors a store in memory, polling it periodically and notifying
/// handlers of the differences between successive lists.
///
/// Reads are served from the mirror. Writes go to the store; a successful
/// write schedules an immediate re-list so the mirror catches up without
/// waiting for the next resync.
pub struct Controller {
    store: Arc<dyn ConfigStore>,
    resync: Duration,
    mirror: RwLock<HashMap<String, Vec<Config>>>,
    handlers: RwLock<HashMap<String, Vec<ConfigHandler>>>,
    synced: AtomicBool,
    relist: Notify,
}

// === impl Controller ===

impl Controller {
    pub fn new(store: Arc<dyn ConfigStore>, resync: Duration) -> Self {
        Self {
            store,
            resync,
            mirror: RwLock::new(HashMap::default()),
            handlers: RwLock::new(HashMap::default()),
            synced: AtomicBool::new(false),
            relist: Notify::new(),
        }
    }

    /// Lists every type once, updating the mirror and notifying handlers.
    async fn sync(&self) {
        let mut complete = true;
        for schema in self.store.descriptor() {
            let Some(mut list) = self.list_with_backoff(schema.ty).await else {
                complete = false;
                continue;
            };
            list.sort_by(|a, b| a.key.cmp(&b.key));

            let events = {
                let mut mirror = self.mirror.write();
                let old = mirror.insert(schema.ty.to_string(), list).unwrap_or_default();
                let new = mirror.get(schema.ty).map(Vec::as_slice).unwrap_or_default();
                sweep(&old, new)
            };
            self.notify(schema.ty, events);
        }

        if complete && !self.synced.swap(true, AtomicOrdering::AcqRel) {
            info!("Synced");
        }
    }

    async fn list_with_backoff(&self, ty: &str) -> Option<Vec<Config>> {
        let mut backoff = LIST_BACKOFF;
        for attempt in 1..=LIST_ATTEMPTS {
            match self.store.list(ty) {
                Ok(list) => return Some(list),
                Err(Error::Unavailable(error)) if attempt < LIST_ATTEMPTS => {
                    debug!(%error, r#type = ty, attempt, "Store unavailable; retrying");
                    time::sleep(backoff.min(self.resync)).await;
                    backoff *= 2;
                }
                Err(error) => {
                    warn!(%error, r#type = ty, "Failed to list configuration");
                    return None;
                }
            }
        }
        None
    }

    /// Invokes the type's handlers without holding any lock.
    fn notify(&self, ty: &str, events: Vec<(Config, Event)>) {
        if events.is_empty() {
            return;
        }
        let handlers = match self.handlers.read().get(ty) {
            Some(handlers) => handlers.clone(),
            None => return,
        };
        for (config, event) in &events {
            debug!(r#type = ty, key = %config.key, %event, "Notifying");
            for handler in &handlers {
                handler(config, *event);
            }
        }
    }
}

impl ConfigStore for Controller {
    fn descriptor(&self) -> &Descriptor {
        self.store.descriptor()
    }

    fn get(&self, ty: &str, key: &str) -> Option<(Message, Revision)> {
        let mirror = self.mirror.read();
        let list = mirror.get(ty)?;
        let idx = list.binary_search_by(|c| c.key.as_str().cmp(key)).ok()?;
        let config = &list[idx];
        Some((config.content.clone(), config.revision.clone()))
    }

    fn list(&self, ty: &str) -> Result<Vec<Config>> {
        Ok(self.mirror.read().get(ty).cloned().unwrap_or_default())
    }

    fn post(&self, content: Message) -> Result<Revision> {
        let rev = self.store.post(content)?;
        self.relist.notify_one();
        Ok(rev)
    }

    fn put(&self, content: Message, revision: &Revision) -> Result<Revision> {
        let rev = self.store.put(content, revision)?;
        self.relist.notify_one();
        Ok(rev)
    }

    fn delete(&self, ty: &str, key: &str) -> Result<()> {
        self.store.delete(ty, key)?;
        self.relist.notify_one();
        Ok(())
    }
}

#[async_trait::async_trait]
impl ConfigStoreCache for Controller {
    fn register_event_handler(&self, ty: &str, handler: ConfigHandler) {
        self.handlers
            .write()
            .entry(ty.to_string())
            .or_default()
            .push(handler);
    }

    fn has_synced(&self) -> bool {
        self.synced.load(AtomicOrdering::Acquire)
    }

    async fn run(&self, shutdown: drain::Watch) {
        let mut resync = time::interval(self.resync);
        resync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tokio::pin! {
            let shutdown = shutdown.signaled();
        }

        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    debug!("Stopping");
                    return;
                }
                _ = self.relist.notified() => trace!("Re-listing after write"),
                _ = resync.tick() => trace!("Resyncing"),
            }
            self.sync().await;
        }
    }
}

/// Compares two key-sorted lists in a single merged pass.
///
/// Records present only in `old` are deleted, records present only in `new`
/// are added, and records with the same key but different revision or
/// content are updated. Events are ordered by key.
pub fn sweep(old: &[Config], new: &[Config]) -> Vec<(Config, Event)> {
    let mut events = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < old.len() && j < new.len() {
        let (o, n) = (&old[i], &new[j]);
        match o.key.cmp(&n.key) {
            Ordering::Equal => {
                if o != n {
                    events.push((n.clone(), Event::Updated));
                }
                i += 1;
                j += 1;
            }
            Ordering::Less => {
                events.push((o.clone(), Event::Deleted));
                i += 1;
            }
            Ordering::Greater => {
                events.push((n.clone(), Event::Added));
                j += 1;
            }
        }
    }
    events.extend(old[i..].iter().map(|o| (o.clone(), Event::Deleted)));
    events.extend(new[j..].iter().map(|n| (n.clone(), Event::Added)));
    events
}
