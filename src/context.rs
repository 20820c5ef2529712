use crate::brand::Brand;
use crate::directory::DirectorySnapshot;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    future::Future,
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
};
use tokio::sync::{Mutex, OnceCell};
use uuid::Uuid;

/// State owned by one processing run and dropped with it: the brand cache,
/// the directory snapshot and call counters. Never shared between runs.
pub struct RunContext {
    run_id: Uuid,
    brands: Mutex<HashMap<String, Arc<OnceCell<Brand>>>>,
    resolved_order: Mutex<Vec<String>>,
    directory: OnceCell<Arc<DirectorySnapshot>>,
    counters: RunCounters,
}

#[derive(Debug, Default)]
pub struct RunCounters {
    product_fetches: AtomicU32,
    inference_calls: AtomicU32,
    notifications: AtomicU32,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub product_fetches: u32,
    pub inference_calls: u32,
    pub notifications: u32,
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new()
    }
}

impl RunContext {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            brands: Mutex::new(HashMap::new()),
            resolved_order: Mutex::new(Vec::new()),
            directory: OnceCell::new(),
            counters: RunCounters::default(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Resolve a product's brand at most once per run. Concurrent callers for
    /// the same product wait on the first resolution instead of repeating it.
    pub async fn brand_or_resolve<F, Fut>(&self, product_id: &str, resolve: F) -> Brand
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Brand>,
    {
        let cell = {
            let mut guard = self.brands.lock().await;
            guard
                .entry(product_id.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let mut fresh = false;
        let brand = cell
            .get_or_init(|| async {
                fresh = true;
                resolve().await
            })
            .await
            .clone();
        if fresh && !brand.is_unknown() {
            let mut order = self.resolved_order.lock().await;
            if !order.iter().any(|name| name.eq_ignore_ascii_case(&brand.name)) {
                order.push(brand.name.clone());
            }
        }
        brand
    }

    #[cfg(test)]
    pub async fn cached_brand(&self, product_id: &str) -> Option<Brand> {
        let guard = self.brands.lock().await;
        guard.get(product_id).and_then(|cell| cell.get().cloned())
    }

    /// Distinct known brands resolved so far, in resolution order.
    pub async fn resolved_brands(&self) -> Vec<String> {
        self.resolved_order.lock().await.clone()
    }

    pub async fn directory_or_load<F, Fut, E>(&self, load: F) -> Result<Arc<DirectorySnapshot>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<DirectorySnapshot, E>>,
    {
        self.directory
            .get_or_try_init(|| async { load().await.map(Arc::new) })
            .await
            .cloned()
    }

    pub fn record_product_fetch(&self) {
        self.counters.product_fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_inference_call(&self) {
        self.counters.inference_calls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_notification(&self) {
        self.counters.notifications.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> CounterSnapshot {
        CounterSnapshot {
            product_fetches: self.counters.product_fetches.load(Ordering::Relaxed),
            inference_calls: self.counters.inference_calls.load(Ordering::Relaxed),
            notifications: self.counters.notifications.load(Ordering::Relaxed),
        }
    }
}
