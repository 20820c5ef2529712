//! Brand resolution cascade: direct field, text heuristic, AI inference.

use crate::context::RunContext;
use crate::erp::{Product, ProductSource};
use crate::fetcher::{RetryPolicy, Sleeper, TokioSleeper, retry_on_rate_limit};
use crate::inference::InferenceError;
use crate::normalize::{contains_whole_words, normalize_name};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name reported when no strategy produced a brand.
pub const UNKNOWN_BRAND: &str = "Desconhecida";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    #[serde(rename = "direct-field")]
    DirectField,
    #[serde(rename = "text-heuristic")]
    TextHeuristic,
    #[serde(rename = "ai-inference")]
    AiInference,
    #[serde(rename = "unknown")]
    Unknown,
    /// The product itself could not be fetched.
    #[serde(rename = "erro")]
    Error,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::DirectField => "direct-field",
            Provenance::TextHeuristic => "text-heuristic",
            Provenance::AiInference => "ai-inference",
            Provenance::Unknown => "unknown",
            Provenance::Error => "erro",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Brand {
    pub name: String,
    pub provenance: Provenance,
}

impl Brand {
    pub fn new(name: impl Into<String>, provenance: Provenance) -> Self {
        Self {
            name: name.into(),
            provenance,
        }
    }

    pub fn unknown(provenance: Provenance) -> Self {
        Self::new(UNKNOWN_BRAND, provenance)
    }

    /// Unknown brands flow through the pipeline but never reach the matcher.
    pub fn is_unknown(&self) -> bool {
        matches!(self.provenance, Provenance::Unknown | Provenance::Error)
            || normalize_name(&self.name) == normalize_name(UNKNOWN_BRAND)
            || self.name.trim().is_empty()
    }
}

#[async_trait]
pub trait BrandInferencePort: Send + Sync {
    /// Brand name as free text; may be empty when the backend has no answer.
    async fn infer_brand(&self, product: &Product) -> Result<String, InferenceError>;
}

#[derive(Clone)]
pub struct BrandResolver {
    products: Arc<dyn ProductSource>,
    inference: Arc<dyn BrandInferencePort>,
    retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl BrandResolver {
    pub fn new(products: Arc<dyn ProductSource>, inference: Arc<dyn BrandInferencePort>) -> Self {
        Self {
            products,
            inference,
            retry: RetryPolicy::default(),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    /// Brand for a product id, memoized in the run context. Rate-limited
    /// fetches are retried; any other fetch failure, or exhausted retries,
    /// yield `Desconhecida`/`erro`, which is cached like any other answer.
    pub async fn resolve(
        &self,
        ctx: &RunContext,
        product_id: &str,
        known_brands: &[String],
    ) -> Brand {
        ctx.brand_or_resolve(product_id, || async {
            ctx.record_product_fetch();
            let fetched = retry_on_rate_limit(
                &self.retry,
                self.sleeper.as_ref(),
                "products.fetch",
                || self.products.fetch_product(product_id),
            )
            .await;
            match fetched {
                Ok(product) => self.resolve_product(ctx, &product, known_brands).await,
                Err(err) => {
                    warn!(
                        target = "oc.brand",
                        product_id,
                        error = %err,
                        "product_fetch_failed"
                    );
                    Brand::unknown(Provenance::Error)
                }
            }
        })
        .await
    }

    /// Memoized cascade for a product that arrived in a listing page, so no
    /// product fetch is needed.
    pub async fn resolve_listed(
        &self,
        ctx: &RunContext,
        product: &Product,
        known_brands: &[String],
    ) -> Brand {
        ctx.brand_or_resolve(&product.id, || {
            self.resolve_product(ctx, product, known_brands)
        })
        .await
    }

    /// Run the cascade on an already-fetched product. Not memoized.
    pub async fn resolve_product(
        &self,
        ctx: &RunContext,
        product: &Product,
        known_brands: &[String],
    ) -> Brand {
        if let Some(brand) = product.direct_brand() {
            debug!(target = "oc.brand", product_id = %product.id, "direct_field");
            return Brand::new(brand, Provenance::DirectField);
        }

        if let Some(brand) = match_known_brand(product, known_brands) {
            debug!(
                target = "oc.brand",
                product_id = %product.id,
                brand = %brand,
                "text_heuristic"
            );
            return Brand::new(brand, Provenance::TextHeuristic);
        }

        ctx.record_inference_call();
        match self.inference.infer_brand(product).await {
            Ok(text) => {
                let name = text.trim();
                if name.is_empty() || normalize_name(name) == normalize_name(UNKNOWN_BRAND) {
                    info!(target = "oc.brand", product_id = %product.id, "ai_no_brand");
                    Brand::unknown(Provenance::Unknown)
                } else {
                    info!(
                        target = "oc.brand",
                        product_id = %product.id,
                        brand = name,
                        "ai_inference"
                    );
                    Brand::new(name, Provenance::AiInference)
                }
            }
            Err(err) => {
                warn!(
                    target = "oc.brand",
                    product_id = %product.id,
                    error = %err,
                    "ai_inference_failed"
                );
                Brand::unknown(Provenance::Unknown)
            }
        }
    }
}

/// First known brand, in input order, appearing as whole words in the
/// product's free text.
pub fn match_known_brand<'a>(product: &Product, known_brands: &'a [String]) -> Option<&'a str> {
    let text = product.searchable_text();
    known_brands
        .iter()
        .map(String::as_str)
        .filter(|brand| !brand.trim().is_empty())
        .find(|brand| contains_whole_words(&text, brand))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erp::ErpError;
    use crate::erp::products::ProductAttribute;
    use crate::testing::{MockProducts, RecordingSleeper, ScriptedBrandInference};

    fn product(id: &str) -> Product {
        Product {
            id: id.to_string(),
            sku: Some(format!("SKU-{id}")),
            name: Some("Sérum facial hidratante".into()),
            ..Product::default()
        }
    }

    fn resolver(products: MockProducts, inference: ScriptedBrandInference) -> BrandResolver {
        BrandResolver::new(Arc::new(products), Arc::new(inference))
            .with_sleeper(Arc::new(RecordingSleeper::default()))
    }

    #[tokio::test]
    async fn direct_field_wins_regardless_of_ai() {
        let mut p = product("1");
        p.brand = Some("La Roche-Posay ".into());
        p.name = Some("Vichy Minéral 89".into());
        let inference = ScriptedBrandInference::answering("Eucerin");
        let calls = inference.calls();
        let resolver = resolver(MockProducts::with(vec![p]), inference);
        let ctx = RunContext::new();
        let brand = resolver.resolve(&ctx, "1", &["Vichy".into()]).await;
        assert_eq!(brand, Brand::new("La Roche-Posay ", Provenance::DirectField));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn text_heuristic_never_calls_ai() {
        let mut p = product("2");
        p.attributes = vec![ProductAttribute {
            name: "Fabricante".into(),
            value: Some("Avène Pharma".into()),
        }];
        let inference = ScriptedBrandInference::answering("Eucerin");
        let calls = inference.calls();
        let resolver = resolver(MockProducts::with(vec![p]), inference);
        let ctx = RunContext::new();
        let known = vec!["Vichy".to_string(), "AVENE".to_string()];
        let brand = resolver.resolve(&ctx, "2", &known).await;
        assert_eq!(brand, Brand::new("AVENE", Provenance::TextHeuristic));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
        assert_eq!(ctx.counters().inference_calls, 0);
    }

    #[tokio::test]
    async fn heuristic_first_match_in_input_order() {
        let mut p = product("3");
        p.description = Some("kit eucerin + vichy".into());
        let resolver = resolver(MockProducts::with(vec![p]), ScriptedBrandInference::failing());
        let ctx = RunContext::new();
        let known = vec!["Vichy".to_string(), "Eucerin".to_string()];
        assert_eq!(resolver.resolve(&ctx, "3", &known).await.name, "Vichy");
    }

    #[tokio::test]
    async fn ai_answer_is_trimmed() {
        let resolver = resolver(
            MockProducts::with(vec![product("4")]),
            ScriptedBrandInference::answering("  Bioderma\n"),
        );
        let ctx = RunContext::new();
        let brand = resolver.resolve(&ctx, "4", &[]).await;
        assert_eq!(brand, Brand::new("Bioderma", Provenance::AiInference));
        assert_eq!(ctx.counters().inference_calls, 1);
    }

    #[tokio::test]
    async fn empty_or_failed_ai_is_unknown() {
        let ctx = RunContext::new();
        let empty = resolver(
            MockProducts::with(vec![product("5")]),
            ScriptedBrandInference::answering("   "),
        );
        let brand = empty.resolve(&ctx, "5", &[]).await;
        assert_eq!(brand, Brand::unknown(Provenance::Unknown));

        let failing = resolver(
            MockProducts::with(vec![product("6")]),
            ScriptedBrandInference::failing(),
        );
        let brand = failing.resolve(&ctx, "6", &[]).await;
        assert_eq!(brand.name, UNKNOWN_BRAND);
        assert!(brand.is_unknown());
    }

    #[tokio::test]
    async fn repeat_lookups_fetch_once() {
        let products = MockProducts::with(vec![product("7")]);
        let fetches = products.fetches();
        let resolver = resolver(products, ScriptedBrandInference::answering("Nuxe"));
        let ctx = RunContext::new();
        let first = resolver.resolve(&ctx, "7", &[]).await;
        let second = resolver.resolve(&ctx, "7", &[]).await;
        assert_eq!(first, second);
        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(ctx.counters().product_fetches, 1);
    }

    #[tokio::test]
    async fn fetch_failure_is_cached_as_error() {
        let products = MockProducts::failing(ErpError::NotFound);
        let fetches = products.fetches();
        let resolver = resolver(products, ScriptedBrandInference::answering("Nuxe"));
        let ctx = RunContext::new();
        let brand = resolver.resolve(&ctx, "missing", &[]).await;
        assert_eq!(brand, Brand::unknown(Provenance::Error));
        resolver.resolve(&ctx, "missing", &[]).await;
        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_fetch_is_retried() {
        let mut p = product("8");
        p.brand = Some("Vichy".into());
        let products = MockProducts::with(vec![p])
            .failing_first(vec![ErpError::RateLimited, ErpError::RateLimited]);
        let fetches = products.fetches();
        let sleeper = Arc::new(RecordingSleeper::default());
        let resolver = BrandResolver::new(
            Arc::new(products),
            Arc::new(ScriptedBrandInference::failing()),
        )
        .with_sleeper(sleeper.clone());
        let ctx = RunContext::new();

        let brand = resolver.resolve(&ctx, "8", &[]).await;
        assert_eq!(brand, Brand::new("Vichy", Provenance::DirectField));
        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(sleeper.recorded().len(), 2);
        assert_eq!(ctx.counters().product_fetches, 1);
    }

    #[tokio::test]
    async fn exhausted_rate_limit_retries_become_error() {
        let products = MockProducts::failing(ErpError::RateLimited);
        let fetches = products.fetches();
        let resolver = resolver(products, ScriptedBrandInference::answering("Nuxe"));
        let ctx = RunContext::new();
        let brand = resolver.resolve(&ctx, "9", &[]).await;
        assert_eq!(brand, Brand::unknown(Provenance::Error));
        assert_eq!(fetches.load(std::sync::atomic::Ordering::SeqCst), 4);
    }
}
