//! Content lifecycle events and the handlers that react to them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::content::ContentId;
use crate::stats::StatsAggregator;

const REVISION_CONTENT_TYPE: &str = "revision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentEvent {
    Saved {
        id: ContentId,
        content_type: String,
        is_autosave: bool,
        is_revision: bool,
    },
    StatusChanged {
        id: Option<ContentId>,
        old_status: String,
        new_status: String,
    },
    Deleted {
        id: ContentId,
    },
}

#[async_trait]
pub trait ContentEventHandler: Send + Sync {
    async fn handle(&self, event: &ContentEvent);
}

/// Fans events out to handlers in registration order.
#[derive(Clone, Default)]
pub struct HooksManager {
    handlers: Vec<Arc<dyn ContentEventHandler>>,
}

impl HooksManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, handler: Arc<dyn ContentEventHandler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub async fn dispatch(&self, event: &ContentEvent) {
        for handler in &self.handlers {
            handler.handle(event).await;
        }
    }
}

/// Drops cached emissions and aggregates when content changes.
pub struct CacheInvalidationHandler {
    stats: StatsAggregator,
}

impl CacheInvalidationHandler {
    pub fn new(stats: StatsAggregator) -> Self {
        Self { stats }
    }

    fn scope(event: &ContentEvent) -> Invalidation {
        match event {
            ContentEvent::Saved {
                id,
                content_type,
                is_autosave,
                is_revision,
            } => {
                if *is_autosave || *is_revision || content_type == REVISION_CONTENT_TYPE {
                    Invalidation::None
                } else {
                    Invalidation::Item(*id)
                }
            }
            ContentEvent::StatusChanged {
                old_status,
                new_status,
                ..
            } if old_status == new_status => Invalidation::None,
            ContentEvent::StatusChanged { id: Some(id), .. } => Invalidation::Item(*id),
            ContentEvent::StatusChanged { id: None, .. } => Invalidation::Aggregates,
            ContentEvent::Deleted { id } => Invalidation::Item(*id),
        }
    }
}

enum Invalidation {
    None,
    Aggregates,
    Item(ContentId),
}

#[async_trait]
impl ContentEventHandler for CacheInvalidationHandler {
    async fn handle(&self, event: &ContentEvent) {
        match Self::scope(event) {
            Invalidation::None => {}
            Invalidation::Aggregates => {
                tracing::debug!("Content status changed, invalidating aggregates");
                self.stats.invalidate_aggregates().await;
            }
            Invalidation::Item(id) => {
                tracing::debug!(content_id = %id, "Content changed, invalidating caches");
                self.stats.invalidate_item(id).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::cache::{item_key, CacheLayer, CACHE_GROUP, SITE_STATS_KEY};
    use crate::config::CacheSettings;
    use crate::content::InMemoryContentRepository;
    use crate::store::InMemoryValueStore;

    fn id(raw: u64) -> ContentId {
        ContentId::new(raw).unwrap()
    }

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl ContentEventHandler for Recorder {
        async fn handle(&self, _event: &ContentEvent) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    fn saved(raw: u64, content_type: &str, is_autosave: bool, is_revision: bool) -> ContentEvent {
        ContentEvent::Saved {
            id: id(raw),
            content_type: content_type.to_string(),
            is_autosave,
            is_revision,
        }
    }

    async fn primed() -> (CacheInvalidationHandler, CacheLayer) {
        let store = Arc::new(InMemoryValueStore::new());
        let cache = CacheLayer::new(store);
        let stats = StatsAggregator::new(
            Arc::new(InMemoryContentRepository::new()),
            cache.clone(),
            CacheSettings::default(),
        );
        cache
            .set(CACHE_GROUP, SITE_STATS_KEY, &1_u64, Duration::from_secs(60))
            .await;
        cache
            .set(CACHE_GROUP, &item_key(id(1)), &0.5_f64, Duration::from_secs(60))
            .await;
        (CacheInvalidationHandler::new(stats), cache)
    }

    async fn site_stats_cached(cache: &CacheLayer) -> bool {
        cache.get::<u64>(CACHE_GROUP, SITE_STATS_KEY).await.is_some()
    }

    #[tokio::test]
    async fn dispatch_runs_handlers_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut hooks = HooksManager::new();
        hooks.register(Arc::new(Recorder { name: "first", log: log.clone() }));
        hooks.register(Arc::new(Recorder { name: "second", log: log.clone() }));

        hooks.dispatch(&ContentEvent::Deleted { id: id(1) }).await;

        assert_eq!(hooks.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn save_invalidates_item_and_aggregates() {
        let (handler, cache) = primed().await;
        handler.handle(&saved(1, "post", false, false)).await;

        assert!(!site_stats_cached(&cache).await);
        assert!(cache.get::<f64>(CACHE_GROUP, &item_key(id(1))).await.is_none());
    }

    #[tokio::test]
    async fn autosaves_and_revisions_are_ignored() {
        for event in [
            saved(1, "post", true, false),
            saved(1, "post", false, true),
            saved(1, "revision", false, false),
        ] {
            let (handler, cache) = primed().await;
            handler.handle(&event).await;
            assert!(site_stats_cached(&cache).await, "{:?}", event);
        }
    }

    #[tokio::test]
    async fn status_change_invalidates_only_on_real_change() {
        let (handler, cache) = primed().await;
        handler
            .handle(&ContentEvent::StatusChanged {
                id: Some(id(1)),
                old_status: "publish".into(),
                new_status: "publish".into(),
            })
            .await;
        assert!(site_stats_cached(&cache).await);

        handler
            .handle(&ContentEvent::StatusChanged {
                id: Some(id(1)),
                old_status: "publish".into(),
                new_status: "draft".into(),
            })
            .await;
        assert!(!site_stats_cached(&cache).await);
    }

    #[tokio::test]
    async fn status_change_without_id_drops_aggregates_only() {
        let (handler, cache) = primed().await;
        handler
            .handle(&ContentEvent::StatusChanged {
                id: None,
                old_status: "draft".into(),
                new_status: "publish".into(),
            })
            .await;

        assert!(!site_stats_cached(&cache).await);
        assert!(cache.get::<f64>(CACHE_GROUP, &item_key(id(1))).await.is_some());
    }

    #[tokio::test]
    async fn delete_invalidates() {
        let (handler, cache) = primed().await;
        handler.handle(&ContentEvent::Deleted { id: id(1) }).await;
        assert!(!site_stats_cached(&cache).await);
    }
}
