use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use transit_contracts::{LineStatus, StatsWindow};

/// Read views served from the cache. Writes drop the views they affect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ViewKey {
    LineList(Option<LineStatus>),
    LineDetail(String),
    /// Summary window, then trend window.
    Statistics(StatsWindow, StatsWindow),
}

impl ViewKey {
    pub fn view_name(&self) -> &'static str {
        match self {
            ViewKey::LineList(_) => "line_list",
            ViewKey::LineDetail(_) => "line_detail",
            ViewKey::Statistics(..) => "statistics",
        }
    }
}

#[derive(Clone)]
pub struct ViewCache {
    cache: Arc<RwLock<HashMap<ViewKey, CachedView>>>,
    max_entries: usize,
    ttl: Duration,
}

#[derive(Clone)]
struct CachedView {
    body: serde_json::Value,
    expires_at: Instant,
}

impl ViewCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            max_entries,
            ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_entries > 0 && self.ttl > Duration::ZERO
    }

    pub async fn get(&self, key: &ViewKey) -> Option<serde_json::Value> {
        if !self.enabled() {
            return None;
        }

        let now = Instant::now();
        let cache = self.cache.read().await;
        let hit = cache
            .get(key)
            .and_then(|entry| (entry.expires_at > now).then(|| entry.body.clone()));

        crate::metrics::observe_view_cache(
            key.view_name(),
            if hit.is_some() { "hit" } else { "miss" },
        );
        hit
    }

    pub async fn put(&self, key: ViewKey, body: serde_json::Value) {
        if !self.enabled() {
            return;
        }

        let now = Instant::now();
        let expires_at = now + self.ttl;
        let mut cache = self.cache.write().await;

        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(key, CachedView { body, expires_at });

        if cache.len() <= self.max_entries {
            return;
        }

        let mut overflow = cache.len() - self.max_entries;
        let keys = cache.keys().cloned().collect::<Vec<_>>();
        for k in keys {
            if overflow == 0 {
                break;
            }
            if cache.remove(&k).is_some() {
                overflow -= 1;
            }
        }
    }

    /// Drops the line list, the statistics and, when given, one line's detail.
    pub async fn invalidate_line(&self, line_code: Option<&str>) {
        if !self.enabled() {
            return;
        }

        let mut cache = self.cache.write().await;
        cache.retain(|key, _| match key {
            ViewKey::LineList(_) | ViewKey::Statistics(..) => false,
            ViewKey::LineDetail(code) => line_code != Some(code.as_str()),
        });
    }

    pub async fn invalidate_all(&self) {
        self.cache.write().await.clear();
    }

    pub async fn len(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn cached_views_expire_after_ttl() {
        let cache = ViewCache::new(8, Duration::from_millis(20));
        let key = ViewKey::LineList(None);
        cache.put(key.clone(), json!([{"code": "line1"}])).await;
        assert_eq!(cache.get(&key).await, Some(json!([{"code": "line1"}])));

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(cache.get(&key).await, None);
    }

    #[tokio::test]
    async fn disabled_cache_stores_nothing() {
        let cache = ViewCache::new(8, Duration::ZERO);
        assert!(!cache.enabled());
        cache.put(ViewKey::LineList(None), json!([])).await;
        assert_eq!(cache.get(&ViewKey::LineList(None)).await, None);

        let cache = ViewCache::new(0, Duration::from_secs(5));
        cache
            .put(ViewKey::Statistics(StatsWindow::Day, StatsWindow::Week), json!({}))
            .await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn line_writes_drop_affected_views_only() {
        let cache = ViewCache::new(16, Duration::from_secs(60));
        cache.put(ViewKey::LineList(None), json!([])).await;
        cache
            .put(ViewKey::LineList(Some(LineStatus::Delayed)), json!([]))
            .await;
        cache
            .put(ViewKey::LineDetail("line1".to_string()), json!({}))
            .await;
        cache
            .put(ViewKey::LineDetail("line2".to_string()), json!({}))
            .await;
        cache
            .put(ViewKey::Statistics(StatsWindow::Month, StatsWindow::Week), json!({}))
            .await;

        cache.invalidate_line(Some("line1")).await;

        assert_eq!(cache.len().await, 1);
        assert!(
            cache
                .get(&ViewKey::LineDetail("line2".to_string()))
                .await
                .is_some()
        );

        cache.invalidate_line(None).await;
        assert_eq!(cache.len().await, 1);
        cache.invalidate_all().await;
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn entry_count_is_bounded() {
        let cache = ViewCache::new(2, Duration::from_secs(60));
        for code in ["a", "b", "c"] {
            cache
                .put(ViewKey::LineDetail(code.to_string()), json!({}))
                .await;
        }
        assert_eq!(cache.len().await, 2);
    }
}
