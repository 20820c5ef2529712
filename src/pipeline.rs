use crate::brand::{Brand, BrandInferencePort, BrandResolver, Provenance};
use crate::context::RunContext;
use crate::directory::{DirectorySnapshot, SupplierDirectory};
use crate::dispatch::{
    DispatchError, DispatchLabels, ErrorClassifierPort, OrderDispatcher, OrderTarget,
    PaymentTerms, compose_order,
};
use crate::erp::config::{
    ACCESS_TOKEN_VAR, API_ROOT, LEGACY_API_KEY_VAR, LEGACY_API_ROOT, SUPPLIER_NAME_PREFIX,
};
use crate::erp::{
    AuthStyle, ContactsV2, ContactsV3, CredentialProvider, EnvCredentials, ErpClient, ErpError,
    ErpProducts, ErpPurchaseOrders, ErpSaleOrders, LineItem, Product, ProductSource, SaleOrder,
    SaleOrderSource, StoredCredentials, SupplierSource,
};
use crate::fetcher::{PagedFetcher, PagingConfig, Sleeper, TokioSleeper, retry_on_rate_limit};
use crate::inference::LlmInference;
use crate::llm::{LlmClient, LlmConfig};
use crate::matcher::{SupplierInferencePort, SupplierMatcher};
use crate::models::{
    CatalogEntry, CatalogReport, ItemReport, ItemStatus, MatchedSupplier, OrderEvent, RunResponse,
    SkipReason, StageReport,
};
use crate::normalize::normalize_name;
use crate::notify::{NotificationSink, notifier_from_env};
use crate::security::AuthContext;
use crate::supabase::SupabaseClient;
use chrono::Utc;
use futures::{FutureExt, StreamExt, future::BoxFuture, stream};
use serde_json::{Value, json};
use std::{collections::BTreeMap, env, future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Collaborators the pipeline is wired with. Live wiring comes from
/// [`Pipeline::from_env`]; tests pass doubles.
pub struct PipelinePorts {
    pub credentials: Arc<dyn CredentialProvider>,
    pub products: Arc<dyn ProductSource>,
    pub sale_orders: Arc<dyn SaleOrderSource>,
    pub primary_suppliers: Arc<dyn SupplierSource>,
    pub secondary_suppliers: Option<Arc<dyn SupplierSource>>,
    pub order_target: Arc<dyn OrderTarget>,
    pub brand_inference: Arc<dyn BrandInferencePort>,
    pub supplier_inference: Arc<dyn SupplierInferencePort>,
    pub classifier: Arc<dyn ErrorClassifierPort>,
    pub notifier: Arc<dyn NotificationSink>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub paging: PagingConfig,
    pub terms: PaymentTerms,
    /// Product resolutions in flight at once.
    pub concurrency: usize,
    pub supplier_prefix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            paging: PagingConfig::default(),
            terms: PaymentTerms::default(),
            concurrency: 1,
            supplier_prefix: "FORNECEDOR".into(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        Self {
            paging: PagingConfig::from_env(),
            terms: PaymentTerms::from_env(),
            concurrency: env::var("RESOLVE_CONCURRENCY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(1),
            supplier_prefix: SUPPLIER_NAME_PREFIX.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    config: Arc<PipelineConfig>,
    credentials: Arc<dyn CredentialProvider>,
    products: Arc<dyn ProductSource>,
    sale_orders: Arc<dyn SaleOrderSource>,
    directory: SupplierDirectory,
    resolver: BrandResolver,
    matcher: SupplierMatcher,
    dispatcher: OrderDispatcher,
    sleeper: Arc<dyn Sleeper>,
}

impl Pipeline {
    pub fn new(ports: PipelinePorts, config: PipelineConfig) -> Self {
        let directory = SupplierDirectory::new(
            ports.primary_suppliers,
            ports.secondary_suppliers,
            config.paging.clone(),
            config.supplier_prefix.clone(),
        );
        Self {
            resolver: BrandResolver::new(ports.products.clone(), ports.brand_inference)
                .with_retry(config.paging.retry.clone()),
            matcher: SupplierMatcher::new(ports.supplier_inference),
            dispatcher: OrderDispatcher::new(ports.order_target, ports.classifier, ports.notifier),
            credentials: ports.credentials,
            products: ports.products,
            sale_orders: ports.sale_orders,
            directory,
            config: Arc::new(config),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn from_env() -> Self {
        let fallback = EnvCredentials::new(ACCESS_TOKEN_VAR);
        let credentials: Arc<dyn CredentialProvider> = match SupabaseClient::from_env() {
            Some(store) => Arc::new(StoredCredentials::new(store, fallback)),
            None => Arc::new(fallback),
        };
        let current = ErpClient::new(&API_ROOT, credentials.clone(), AuthStyle::Bearer);

        let secondary_suppliers = env::var(LEGACY_API_KEY_VAR)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .map(|_| {
                let legacy = ErpClient::new(
                    &LEGACY_API_ROOT,
                    Arc::new(EnvCredentials::new(LEGACY_API_KEY_VAR)),
                    AuthStyle::ApiKeyParam,
                );
                Arc::new(ContactsV2::new(legacy)) as Arc<dyn SupplierSource>
            });

        let inference = Arc::new(LlmInference::new(Arc::new(LlmClient::new(
            LlmConfig::from_env(),
        ))));

        let ports = PipelinePorts {
            credentials,
            products: Arc::new(ErpProducts::new(current.clone())),
            sale_orders: Arc::new(ErpSaleOrders::new(current.clone())),
            primary_suppliers: Arc::new(ContactsV3::new(current.clone())),
            secondary_suppliers,
            order_target: Arc::new(ErpPurchaseOrders::new(current)),
            brand_inference: inference.clone(),
            supplier_inference: inference.clone(),
            classifier: inference,
            notifier: notifier_from_env(),
        };
        Self::new(ports, PipelineConfig::from_env())
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.directory = self.directory.with_sleeper(sleeper.clone());
        self.resolver = self.resolver.with_sleeper(sleeper.clone());
        self.sleeper = sleeper;
        self
    }

    /// Resolve every line of a sale order to a supplier and dispatch one
    /// purchase order per resolvable line.
    pub async fn run(
        &self,
        event: OrderEvent,
        auth: Option<AuthContext>,
    ) -> Result<RunResponse, PipelineError> {
        let ctx = RunContext::new();
        let mut stages = Vec::new();
        info!(
            target = "oc.pipeline",
            run_id = %ctx.run_id(),
            order_id = %event.data.id,
            event = event.event.as_deref().unwrap_or(""),
            org_id = auth.as_ref().map(|a| a.org_id.as_str()).unwrap_or(""),
            "run_started"
        );

        self.capture_stage("check_credentials", &mut stages, self.check_credentials())
            .await?;
        let order = self
            .capture_stage("load_order", &mut stages, self.load_order(&event))
            .await?;
        let directory = self
            .capture_stage("load_directory", &mut stages, self.load_directory(&ctx))
            .await?;

        let mut product_ids: Vec<String> = Vec::new();
        for id in order.items.iter().filter_map(LineItem::product_id) {
            if !product_ids.iter().any(|seen| seen == id) {
                product_ids.push(id.to_string());
            }
        }
        self.capture_stage(
            "resolve_brands",
            &mut stages,
            self.resolve_brands(&ctx, &directory, &product_ids),
        )
        .await?;
        let items = self
            .capture_stage(
                "dispatch_items",
                &mut stages,
                self.dispatch_items(&ctx, &order, &directory),
            )
            .await?;

        info!(
            target = "oc.pipeline",
            run_id = %ctx.run_id(),
            order_id = %order.id,
            items = items.len(),
            "run_finished"
        );
        Ok(RunResponse {
            run_id: ctx.run_id().to_string(),
            order_id: order.id.clone(),
            order_number: order.number.clone(),
            items,
            counters: ctx.counters(),
            stages,
        })
    }

    /// Brand resolution over the whole product catalog; no orders are placed.
    pub async fn resolve_catalog(
        &self,
        auth: Option<AuthContext>,
    ) -> Result<CatalogReport, PipelineError> {
        let ctx = RunContext::new();
        let mut stages = Vec::new();
        info!(
            target = "oc.pipeline",
            run_id = %ctx.run_id(),
            org_id = auth.as_ref().map(|a| a.org_id.as_str()).unwrap_or(""),
            "catalog_run_started"
        );

        self.capture_stage("check_credentials", &mut stages, self.check_credentials())
            .await?;
        let directory = self
            .capture_stage("load_directory", &mut stages, self.load_directory(&ctx))
            .await?;
        let listing = self
            .capture_stage("list_products", &mut stages, self.list_products())
            .await?;
        let entries = self
            .capture_stage(
                "resolve_brands",
                &mut stages,
                self.resolve_listed(&ctx, &directory, &listing.products),
            )
            .await?;

        let mut by_provenance = BTreeMap::new();
        for entry in &entries {
            *by_provenance
                .entry(entry.brand.provenance.as_str().to_string())
                .or_insert(0) += 1;
        }
        Ok(CatalogReport {
            run_id: ctx.run_id().to_string(),
            products: entries.len(),
            pages: listing.pages,
            truncated: listing.truncated,
            by_provenance,
            entries,
            counters: ctx.counters(),
            stages,
        })
    }

    async fn check_credentials(&self) -> Result<StageOutcome<()>, PipelineError> {
        match self.credentials.access_token().await {
            Some(_) => Ok(StageOutcome::new((), json!({ "available": true }))),
            None => Err(PipelineError::auth_unavailable(
                "check_credentials",
                "no ERP access token available",
            )),
        }
    }

    async fn load_order(
        &self,
        event: &OrderEvent,
    ) -> Result<StageOutcome<SaleOrder>, PipelineError> {
        let (order, source) = match event.inline_order() {
            Some(order) => (order, "webhook"),
            None => {
                let order = retry_on_rate_limit(
                    &self.config.paging.retry,
                    self.sleeper.as_ref(),
                    "sale_orders.fetch",
                    || self.sale_orders.fetch_sale_order(&event.data.id),
                )
                .await
                .map_err(|err| PipelineError::from_erp("load_order", err))?;
                (order, "erp")
            }
        };
        let output = json!({
            "source": source,
            "order_id": order.id,
            "items": order.items.len(),
        });
        Ok(StageOutcome::new(order, output))
    }

    async fn load_directory(
        &self,
        ctx: &RunContext,
    ) -> Result<StageOutcome<Arc<DirectorySnapshot>>, PipelineError> {
        let snapshot = ctx
            .directory_or_load(|| self.directory.load())
            .await
            .map_err(|err| PipelineError::from_erp("load_directory", err))?;
        let output = json!({
            "source": snapshot.source,
            "suppliers": snapshot.len(),
            "truncated": snapshot.truncated,
        });
        Ok(StageOutcome::new(snapshot, output))
    }

    async fn resolve_brands(
        &self,
        ctx: &RunContext,
        directory: &DirectorySnapshot,
        product_ids: &[String],
    ) -> Result<StageOutcome<()>, PipelineError> {
        let lookups: Vec<BoxFuture<'_, Brand>> = product_ids
            .iter()
            .map(|id| {
                async move {
                    let known = known_brands(ctx, directory).await;
                    self.resolver.resolve(ctx, id, &known).await
                }
                .boxed()
            })
            .collect();
        let brands: Vec<Brand> = stream::iter(lookups)
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        let output = json!({
            "products": brands.len(),
            "by_provenance": tally(&brands),
        });
        Ok(StageOutcome::new((), output))
    }

    async fn list_products(&self) -> Result<StageOutcome<ProductListing>, PipelineError> {
        let products = self.products.clone();
        let page_size = products.page_size(self.config.paging.page_size);
        let paging = PagingConfig {
            page_size,
            ..self.config.paging.clone()
        };
        let fetcher = PagedFetcher::with_sleeper(
            "products",
            paging,
            self.sleeper.clone(),
            move |page| {
                let products = products.clone();
                async move { products.list_products(page, page_size).await }
            },
        );
        let listing = fetcher
            .collect_all()
            .await
            .map_err(|err| PipelineError::from_erp("list_products", err))?;

        let mut parsed = Vec::with_capacity(listing.records.len());
        let mut malformed = 0usize;
        for record in listing.records {
            match serde_json::from_value::<Product>(record) {
                Ok(product) => parsed.push(product),
                Err(err) => {
                    malformed += 1;
                    warn!(target = "oc.pipeline", error = %err, "malformed_product_record");
                }
            }
        }
        let output = json!({
            "products": parsed.len(),
            "malformed": malformed,
            "pages": listing.pages,
            "truncated": listing.truncated,
        });
        Ok(StageOutcome::new(
            ProductListing {
                products: parsed,
                pages: listing.pages,
                truncated: listing.truncated,
            },
            output,
        ))
    }

    async fn resolve_listed(
        &self,
        ctx: &RunContext,
        directory: &DirectorySnapshot,
        products: &[Product],
    ) -> Result<StageOutcome<Vec<CatalogEntry>>, PipelineError> {
        let lookups: Vec<BoxFuture<'_, CatalogEntry>> = products
            .iter()
            .map(|product| {
                async move {
                    let known = known_brands(ctx, directory).await;
                    let brand = self.resolver.resolve_listed(ctx, product, &known).await;
                    CatalogEntry {
                        product_id: product.id.clone(),
                        sku: product.sku.clone(),
                        brand,
                    }
                }
                .boxed()
            })
            .collect();
        let entries: Vec<CatalogEntry> = stream::iter(lookups)
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        let brands: Vec<Brand> = entries.iter().map(|entry| entry.brand.clone()).collect();
        let output = json!({
            "products": entries.len(),
            "by_provenance": tally(&brands),
        });
        Ok(StageOutcome::new(entries, output))
    }

    async fn dispatch_items(
        &self,
        ctx: &RunContext,
        order: &SaleOrder,
        directory: &DirectorySnapshot,
    ) -> Result<StageOutcome<Vec<ItemReport>>, PipelineError> {
        let mut reports = Vec::with_capacity(order.items.len());
        for (position, item) in order.items.iter().enumerate() {
            reports.push(self.process_item(ctx, order, item, position, directory).await?);
        }
        let dispatched = reports
            .iter()
            .filter(|report| matches!(report.status, ItemStatus::Dispatched { .. }))
            .count();
        let output = json!({
            "items": reports.len(),
            "dispatched": dispatched,
            "skipped": reports.len() - dispatched,
        });
        Ok(StageOutcome::new(reports, output))
    }

    async fn process_item(
        &self,
        ctx: &RunContext,
        order: &SaleOrder,
        item: &LineItem,
        position: usize,
        directory: &DirectorySnapshot,
    ) -> Result<ItemReport, PipelineError> {
        let item_id = item.correlation_id(position);
        let mut report = ItemReport {
            item_id: item_id.clone(),
            sku: item.sku.clone(),
            product_id: item.product_id().map(str::to_string),
            brand: None,
            supplier: None,
            status: skipped(SkipReason::MissingProduct, None),
        };

        let Some(product_id) = item.product_id() else {
            warn!(
                target = "oc.pipeline",
                order_id = %order.id,
                item_id = %item_id,
                "item_without_product"
            );
            return Ok(report);
        };

        let known = known_brands(ctx, directory).await;
        let brand = self.resolver.resolve(ctx, product_id, &known).await;
        report.brand = Some(brand.clone());
        if brand.is_unknown() {
            let reason = if brand.provenance == Provenance::Error {
                SkipReason::ProductUnavailable
            } else {
                SkipReason::UnknownBrand
            };
            warn!(
                target = "oc.pipeline",
                order_id = %order.id,
                item_id = %item_id,
                product_id,
                "brand_unresolved"
            );
            report.status = skipped(reason, None);
            return Ok(report);
        }

        let sku = item.sku.as_deref().unwrap_or_default();
        let Some(found) = self
            .matcher
            .match_supplier(ctx, &brand, &item_id, sku, directory)
            .await
        else {
            report.status = skipped(SkipReason::NoSupplier, None);
            return Ok(report);
        };
        report.supplier = Some(MatchedSupplier {
            id: found.supplier.id.clone(),
            name: found.supplier.name.clone(),
            kind: found.kind,
        });

        let payload = compose_order(
            order,
            item,
            &found.supplier,
            &self.config.terms,
            Utc::now().date_naive(),
        );
        let labels = DispatchLabels {
            order_reference: order.reference().to_string(),
            brand: brand.name.clone(),
            supplier: found.supplier.name.clone(),
        };
        match self.dispatcher.dispatch(ctx, &payload, &labels).await {
            Ok(dispatch) => report.status = ItemStatus::Dispatched { dispatch },
            Err(DispatchError::Invalid(err)) => {
                warn!(
                    target = "oc.pipeline",
                    order_id = %order.id,
                    item_id = %item_id,
                    error = %err,
                    "invalid_order_payload"
                );
                report.status = skipped(SkipReason::InvalidPayload, Some(err.code().to_string()));
            }
            Err(DispatchError::AuthUnavailable) => {
                return Err(PipelineError::auth_unavailable(
                    "dispatch_items",
                    "ERP rejected the access token",
                ));
            }
        }
        Ok(report)
    }

    async fn capture_stage<T, Fut>(
        &self,
        name: &'static str,
        stages: &mut Vec<StageReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<StageOutcome<T>, PipelineError>>,
    {
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::stage_elapsed(name, elapsed_ms);
        stages.push(StageReport::new(name, elapsed_ms, outcome.output));
        Ok(outcome.value)
    }
}

struct ProductListing {
    products: Vec<Product>,
    pages: u32,
    truncated: bool,
}

fn skipped(reason: SkipReason, detail: Option<String>) -> ItemStatus {
    ItemStatus::Skipped { reason, detail }
}

/// Brand labels implied by the directory, then brands already resolved in
/// this run, without duplicates.
async fn known_brands(ctx: &RunContext, directory: &DirectorySnapshot) -> Vec<String> {
    let mut known = directory.brand_labels();
    for brand in ctx.resolved_brands().await {
        let key = normalize_name(&brand);
        if !known.iter().any(|existing| normalize_name(existing) == key) {
            known.push(brand);
        }
    }
    known
}

fn tally(brands: &[Brand]) -> Value {
    let mut counts: BTreeMap<&'static str, usize> = BTreeMap::new();
    for brand in brands {
        *counts.entry(brand.provenance.as_str()).or_insert(0) += 1;
    }
    json!(counts)
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    AuthUnavailable,
    Upstream,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn auth_unavailable(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::AuthUnavailable)
    }

    pub fn upstream(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Upstream)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    fn with_kind(
        stage: &'static str,
        message: impl Into<String>,
        kind: PipelineErrorKind,
    ) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn from_erp(stage: &'static str, err: ErpError) -> Self {
        match err {
            ErpError::AuthUnavailable => Self::auth_unavailable(stage, err.to_string()),
            ErpError::NotFound => Self::not_found(stage, err.to_string()),
            ErpError::RateLimited | ErpError::Malformed(_) | ErpError::Request(_) => {
                Self::upstream(stage, err.to_string())
            }
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> StageOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}
