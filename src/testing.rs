//! Deterministic doubles for the ports, shared by the unit tests.

use crate::brand::BrandInferencePort;
use crate::directory::Supplier;
use crate::dispatch::{ErrorClassifierPort, OrderPayload, OrderTarget};
use crate::erp::{
    ErpError, Product, ProductSource, SaleOrder, SaleOrderSource, SupplierFilters, SupplierSource,
};
use crate::fetcher::Sleeper;
use crate::inference::InferenceError;
use crate::matcher::{SupplierDecision, SupplierInferencePort};
use crate::notify::{NotificationSink, NotifyError};
use async_trait::async_trait;
use serde_json::Value;
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn recorded(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

/// Serves fixed pages (1-based); past the end it returns an empty page.
pub struct ScriptedSuppliers {
    version: String,
    pages: Result<Vec<Vec<Value>>, ErpError>,
    fixed_page_size: Option<usize>,
    calls: Arc<AtomicU32>,
}

impl ScriptedSuppliers {
    pub fn pages(version: &str, pages: Vec<Vec<Value>>) -> Self {
        Self {
            version: version.to_string(),
            pages: Ok(pages),
            fixed_page_size: None,
            calls: Arc::default(),
        }
    }

    pub fn failing(version: &str, err: ErpError) -> Self {
        Self {
            version: version.to_string(),
            pages: Err(err),
            fixed_page_size: None,
            calls: Arc::default(),
        }
    }

    /// Behave like a listing whose page size upstream ignores the request.
    pub fn with_fixed_page_size(mut self, size: usize) -> Self {
        self.fixed_page_size = Some(size);
        self
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl SupplierSource for ScriptedSuppliers {
    fn version(&self) -> &str {
        &self.version
    }

    fn page_size(&self, requested: usize) -> usize {
        self.fixed_page_size.unwrap_or(requested)
    }

    async fn list_suppliers(
        &self,
        page: u32,
        _page_size: usize,
        _filters: &SupplierFilters,
    ) -> Result<Vec<Value>, ErpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.pages {
            Ok(pages) => Ok(pages
                .get(page.saturating_sub(1) as usize)
                .cloned()
                .unwrap_or_default()),
            Err(err) => Err(err.clone()),
        }
    }
}

pub struct MockProducts {
    products: HashMap<String, Product>,
    listing: Vec<Vec<Value>>,
    failure: Option<ErpError>,
    transient: Mutex<VecDeque<ErpError>>,
    fetches: Arc<AtomicU32>,
}

impl MockProducts {
    pub fn with(products: Vec<Product>) -> Self {
        Self {
            products: products.into_iter().map(|p| (p.id.clone(), p)).collect(),
            listing: Vec::new(),
            failure: None,
            transient: Mutex::default(),
            fetches: Arc::default(),
        }
    }

    /// Fail the next fetches with `errors`, in order, then answer normally.
    pub fn failing_first(self, errors: Vec<ErpError>) -> Self {
        *self.transient.lock().unwrap() = errors.into();
        self
    }

    pub fn failing(err: ErpError) -> Self {
        Self {
            failure: Some(err),
            ..Self::with(Vec::new())
        }
    }

    /// Raw catalog pages served by `list_products`.
    pub fn with_listing(mut self, pages: Vec<Vec<Value>>) -> Self {
        self.listing = pages;
        self
    }

    pub fn fetches(&self) -> Arc<AtomicU32> {
        self.fetches.clone()
    }
}

#[async_trait]
impl ProductSource for MockProducts {
    async fn fetch_product(&self, id: &str) -> Result<Product, ErpError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        if let Some(err) = self.transient.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.products.get(id).cloned().ok_or(ErpError::NotFound)
    }

    async fn list_products(&self, page: u32, _page_size: usize) -> Result<Vec<Value>, ErpError> {
        Ok(self
            .listing
            .get(page.saturating_sub(1) as usize)
            .cloned()
            .unwrap_or_default())
    }
}

pub struct ScriptedSaleOrders {
    order: Option<SaleOrder>,
    transient: Mutex<VecDeque<ErpError>>,
    calls: Arc<AtomicU32>,
}

impl ScriptedSaleOrders {
    pub fn with(order: SaleOrder) -> Self {
        Self {
            order: Some(order),
            transient: Mutex::default(),
            calls: Arc::default(),
        }
    }

    pub fn empty() -> Self {
        Self {
            order: None,
            transient: Mutex::default(),
            calls: Arc::default(),
        }
    }

    /// Fail the next fetches with `errors`, in order, then answer normally.
    pub fn failing_first(self, errors: Vec<ErpError>) -> Self {
        *self.transient.lock().unwrap() = errors.into();
        self
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl SaleOrderSource for ScriptedSaleOrders {
    async fn fetch_sale_order(&self, id: &str) -> Result<SaleOrder, ErpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.transient.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.order
            .clone()
            .filter(|order| order.id == id)
            .ok_or(ErpError::NotFound)
    }
}

pub struct ScriptedBrandInference {
    answer: Option<String>,
    calls: Arc<AtomicU32>,
}

impl ScriptedBrandInference {
    pub fn answering(answer: &str) -> Self {
        Self {
            answer: Some(answer.to_string()),
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl BrandInferencePort for ScriptedBrandInference {
    async fn infer_brand(&self, _product: &Product) -> Result<String, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.answer
            .clone()
            .ok_or_else(|| InferenceError::Backend("scripted failure".into()))
    }
}

pub struct ScriptedSupplierInference {
    answer: Option<SupplierDecision>,
    calls: Arc<AtomicU32>,
    seen: Arc<Mutex<Vec<String>>>,
}

impl ScriptedSupplierInference {
    pub fn answering(answer: SupplierDecision) -> Self {
        Self {
            answer: Some(answer),
            calls: Arc::default(),
            seen: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            answer: None,
            calls: Arc::default(),
            seen: Arc::default(),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }

    /// Candidate ids offered on the last call.
    pub fn seen_candidates(&self) -> Arc<Mutex<Vec<String>>> {
        self.seen.clone()
    }
}

#[async_trait]
impl SupplierInferencePort for ScriptedSupplierInference {
    async fn choose_supplier(
        &self,
        _sku: &str,
        _brand: &str,
        candidates: &[Supplier],
    ) -> Result<SupplierDecision, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.seen.lock().unwrap() = candidates.iter().map(|s| s.id.clone()).collect();
        self.answer
            .clone()
            .ok_or_else(|| InferenceError::Backend("scripted failure".into()))
    }
}

pub struct ScriptedClassifier {
    verdict: Option<bool>,
    calls: Arc<AtomicU32>,
}

impl ScriptedClassifier {
    pub fn answering(verdict: bool) -> Self {
        Self {
            verdict: Some(verdict),
            calls: Arc::default(),
        }
    }

    pub fn failing() -> Self {
        Self {
            verdict: None,
            calls: Arc::default(),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

#[async_trait]
impl ErrorClassifierPort for ScriptedClassifier {
    async fn is_error_irrelevant(&self, _detail: &Value) -> Result<bool, InferenceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.verdict
            .ok_or_else(|| InferenceError::Parse("scripted failure".into()))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn messages(&self) -> Arc<Mutex<Vec<String>>> {
        self.messages.clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn notify(&self, text: &str) -> Result<(), NotifyError> {
        if self.fail {
            return Err(NotifyError::Rejected(503));
        }
        self.messages.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

pub struct MockOrderTarget {
    response: Result<Value, ErpError>,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
    payloads: Arc<Mutex<Vec<OrderPayload>>>,
}

impl MockOrderTarget {
    pub fn responding(response: Value) -> Self {
        Self {
            response: Ok(response),
            delay: None,
            calls: Arc::default(),
            payloads: Arc::default(),
        }
    }

    pub fn erroring(err: ErpError) -> Self {
        Self {
            response: Err(err),
            delay: None,
            calls: Arc::default(),
            payloads: Arc::default(),
        }
    }

    /// Hold every submission for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }

    pub fn payloads(&self) -> Arc<Mutex<Vec<OrderPayload>>> {
        self.payloads.clone()
    }
}

#[async_trait]
impl OrderTarget for MockOrderTarget {
    async fn submit_order(&self, payload: &OrderPayload) -> Result<Value, ErpError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.payloads.lock().unwrap().push(payload.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.response.clone()
    }
}
