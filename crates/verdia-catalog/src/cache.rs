use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use verdia_types::Product;

use crate::normalize::{normalize_batch, NormalizeOptions};
use crate::shop::ShopClient;

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);

/// Where a full catalog snapshot comes from. Returns the normalized products
/// plus whether the batch carried any stock data.
#[async_trait]
pub trait CatalogSource: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<(Vec<Product>, bool)>;
}

/// Shop-backed source: raw products plus the three side tables, run through
/// the normalizer.
pub struct ShopCatalogSource {
    client: ShopClient,
    opts: NormalizeOptions,
}

impl ShopCatalogSource {
    pub fn new(client: ShopClient, opts: NormalizeOptions) -> Self {
        Self { client, opts }
    }
}

#[async_trait]
impl CatalogSource for ShopCatalogSource {
    async fn fetch(&self) -> anyhow::Result<(Vec<Product>, bool)> {
        let raws: Vec<Value> = self.client.list_products().await?;
        let side = self.client.fetch_side_tables().await;
        let has_stock = side.has_stock_data();
        Ok((normalize_batch(&raws, &side, &self.opts), has_stock))
    }
}

#[derive(Clone, Default)]
struct Snapshot {
    products: Arc<Vec<Product>>,
    batch_has_stock: bool,
    refreshed_at: Option<Instant>,
}

/// Time-boxed whole-snapshot catalog cache. A refresh failure keeps the
/// previous snapshot, so the cache is monotonically non-empty once it has
/// been populated once. Refreshes are single-flight: the refresh mutex is
/// held across the fetch and waiters re-check freshness before fetching
/// again.
pub struct CatalogCache {
    source: Arc<dyn CatalogSource>,
    ttl: Duration,
    snapshot: RwLock<Snapshot>,
    refresh: Mutex<()>,
}

impl CatalogCache {
    pub fn new(source: Arc<dyn CatalogSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            snapshot: RwLock::new(Snapshot::default()),
            refresh: Mutex::new(()),
        }
    }

    pub async fn is_populated(&self) -> bool {
        !self.snapshot.read().await.products.is_empty()
    }

    /// Current snapshot, refreshed first if empty or older than the TTL.
    pub async fn ensure_fresh(&self) -> (Arc<Vec<Product>>, bool) {
        {
            let snapshot = self.snapshot.read().await;
            if self.is_fresh(&snapshot) {
                return (snapshot.products.clone(), snapshot.batch_has_stock);
            }
        }

        let _guard = self.refresh.lock().await;

        // Another caller may have refreshed while this one waited.
        {
            let snapshot = self.snapshot.read().await;
            if self.is_fresh(&snapshot) {
                return (snapshot.products.clone(), snapshot.batch_has_stock);
            }
        }

        match self.source.fetch().await {
            Ok((products, batch_has_stock)) => {
                tracing::info!(
                    target: "verdia.catalog",
                    count = products.len(),
                    batch_has_stock,
                    "catalog snapshot refreshed"
                );
                let fresh = Snapshot {
                    products: Arc::new(products),
                    batch_has_stock,
                    refreshed_at: Some(Instant::now()),
                };
                let mut snapshot = self.snapshot.write().await;
                *snapshot = fresh.clone();
                (fresh.products, fresh.batch_has_stock)
            }
            Err(error) => {
                tracing::warn!(
                    target: "verdia.catalog",
                    %error,
                    "catalog refresh failed, serving previous snapshot"
                );
                let snapshot = self.snapshot.read().await;
                (snapshot.products.clone(), snapshot.batch_has_stock)
            }
        }
    }

    fn is_fresh(&self, snapshot: &Snapshot) -> bool {
        match snapshot.refreshed_at {
            Some(at) => !snapshot.products.is_empty() && at.elapsed() <= self.ttl,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedSource {
        calls: AtomicUsize,
        fail_after_first: bool,
    }

    fn product(id: &str) -> Product {
        Product {
            id: id.to_string(),
            reference: String::new(),
            name: format!("Producto {id}"),
            description: String::new(),
            price: 1.0,
            price_tax_incl: 1.21,
            stock: Some(5),
            image_id: None,
            image_url: None,
            product_url: None,
            active: true,
        }
    }

    #[async_trait]
    impl CatalogSource for ScriptedSource {
        async fn fetch(&self) -> anyhow::Result<(Vec<Product>, bool)> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_after_first && call > 0 {
                anyhow::bail!("upstream unavailable");
            }
            Ok((vec![product(&format!("{call}"))], true))
        }
    }

    #[tokio::test]
    async fn fresh_snapshot_is_served_without_refetch() {
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            fail_after_first: false,
        });
        let cache = CatalogCache::new(source.clone(), Duration::from_secs(60));
        cache.ensure_fresh().await;
        cache.ensure_fresh().await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            fail_after_first: true,
        });
        let cache = CatalogCache::new(source.clone(), Duration::ZERO);
        let (first, _) = cache.ensure_fresh().await;
        assert_eq!(first.len(), 1);
        // TTL zero forces a refresh attempt, which now fails.
        let (second, _) = cache.ensure_fresh().await;
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, first[0].id);
        assert!(cache.is_populated().await);
    }

    #[tokio::test]
    async fn concurrent_stale_calls_trigger_one_fetch() {
        let source = Arc::new(ScriptedSource {
            calls: AtomicUsize::new(0),
            fail_after_first: false,
        });
        let cache = Arc::new(CatalogCache::new(source.clone(), Duration::from_secs(60)));
        let tasks = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.ensure_fresh().await })
            })
            .collect::<Vec<_>>();
        for task in tasks {
            task.await.expect("join");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }
}
