//! Maps a resolved brand to one eligible supplier.

use crate::brand::Brand;
use crate::context::RunContext;
use crate::directory::{DirectorySnapshot, Supplier};
use crate::erp::client::canonical_id;
use crate::inference::InferenceError;
use crate::normalize::{match_key, normalize_name, words};
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{collections::HashSet, sync::Arc};
use tracing::{debug, info, warn};

/// Upper bound on suppliers offered to the AI tie-break.
pub const MAX_AI_CANDIDATES: usize = 10;

/// Structured answer of the AI tie-break.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupplierDecision {
    #[serde(default, rename = "deveGerarOC")]
    pub should_order: bool,
    #[serde(default, rename = "fornecedorId", deserialize_with = "de_opt_id")]
    pub supplier_id: Option<String>,
    #[serde(default, rename = "fornecedorNome")]
    pub supplier_name: Option<String>,
}

fn de_opt_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(canonical_id(&value))
}

#[async_trait]
pub trait SupplierInferencePort: Send + Sync {
    async fn choose_supplier(
        &self,
        sku: &str,
        brand: &str,
        candidates: &[Supplier],
    ) -> Result<SupplierDecision, InferenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
    Exact,
    Heuristic,
    Ai,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SupplierMatch {
    pub supplier: Supplier,
    pub kind: MatchKind,
}

#[derive(Clone)]
pub struct SupplierMatcher {
    inference: Arc<dyn SupplierInferencePort>,
}

impl SupplierMatcher {
    pub fn new(inference: Arc<dyn SupplierInferencePort>) -> Self {
        Self { inference }
    }

    /// Exact, then substring, then AI tie-break. `None` means no order can be
    /// placed for the item; it is not a retryable condition.
    pub async fn match_supplier(
        &self,
        ctx: &RunContext,
        brand: &Brand,
        item_id: &str,
        sku: &str,
        directory: &DirectorySnapshot,
    ) -> Option<SupplierMatch> {
        if brand.is_unknown() {
            debug!(target = "oc.matcher", item_id, "unknown_brand_skipped");
            return None;
        }
        let key = match_key(&brand.name, &directory.prefix);
        if key.is_empty() {
            return None;
        }

        if let Some(supplier) = exact_match(&key, directory) {
            debug!(target = "oc.matcher", item_id, supplier_id = %supplier.id, "exact_match");
            return Some(SupplierMatch {
                supplier: supplier.clone(),
                kind: MatchKind::Exact,
            });
        }

        if let Some(supplier) = heuristic_match(&key, directory) {
            debug!(target = "oc.matcher", item_id, supplier_id = %supplier.id, "heuristic_match");
            return Some(SupplierMatch {
                supplier: supplier.clone(),
                kind: MatchKind::Heuristic,
            });
        }

        let candidates = ai_candidates(&brand.name, &key, directory);
        if candidates.is_empty() {
            warn!(
                target = "oc.matcher",
                item_id,
                brand = %brand.name,
                "no_supplier_candidates"
            );
            return None;
        }

        ctx.record_inference_call();
        let decision = match self
            .inference
            .choose_supplier(sku, &brand.name, &candidates)
            .await
        {
            Ok(decision) => decision,
            Err(err) => {
                warn!(
                    target = "oc.matcher",
                    item_id,
                    brand = %brand.name,
                    error = %err,
                    "supplier_inference_failed"
                );
                SupplierDecision::default()
            }
        };

        let chosen = accept_decision(&decision, directory, item_id);
        if chosen.is_none() {
            warn!(
                target = "oc.matcher",
                item_id,
                brand = %brand.name,
                candidates = candidates.len(),
                "no_supplier_match"
            );
        }
        chosen.map(|supplier| SupplierMatch {
            supplier: supplier.clone(),
            kind: MatchKind::Ai,
        })
    }
}

fn exact_match<'a>(key: &str, directory: &'a DirectorySnapshot) -> Option<&'a Supplier> {
    directory
        .suppliers
        .iter()
        .find(|supplier| supplier.match_key == key)
}

fn heuristic_match<'a>(key: &str, directory: &'a DirectorySnapshot) -> Option<&'a Supplier> {
    directory.suppliers.iter().find(|supplier| {
        !supplier.match_key.is_empty()
            && (supplier.match_key.contains(key) || key.contains(supplier.match_key.as_str()))
    })
}

/// Suppliers sharing a containment relation or a word of three or more
/// characters with the brand, in directory order.
pub fn ai_candidates(brand: &str, key: &str, directory: &DirectorySnapshot) -> Vec<Supplier> {
    let brand_words: HashSet<String> = words(brand)
        .into_iter()
        .filter(|word| word.chars().count() >= 3)
        .collect();
    directory
        .suppliers
        .iter()
        .filter(|supplier| {
            let contained = !supplier.match_key.is_empty()
                && (supplier.match_key.contains(key) || key.contains(supplier.match_key.as_str()));
            contained
                || words(supplier.brand_label(&directory.prefix))
                    .iter()
                    .any(|word| brand_words.contains(word))
        })
        .take(MAX_AI_CANDIDATES)
        .cloned()
        .collect()
}

fn accept_decision<'a>(
    decision: &SupplierDecision,
    directory: &'a DirectorySnapshot,
    item_id: &str,
) -> Option<&'a Supplier> {
    if !decision.should_order {
        info!(target = "oc.matcher", item_id, "ai_declined_order");
        return None;
    }
    let id = decision.supplier_id.as_deref()?;
    let Some(supplier) = directory.get(id) else {
        warn!(target = "oc.matcher", item_id, supplier_id = id, "ai_returned_unknown_supplier");
        return None;
    };
    if let Some(echoed) = decision.supplier_name.as_deref()
        && normalize_name(echoed) != supplier.normalized_name
        && normalize_name(echoed) != supplier.match_key
    {
        warn!(
            target = "oc.matcher",
            item_id,
            supplier_id = %supplier.id,
            directory_name = %supplier.name,
            echoed_name = echoed,
            "supplier_name_mismatch"
        );
    }
    Some(supplier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::brand::Provenance;
    use crate::testing::ScriptedSupplierInference;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    fn directory() -> DirectorySnapshot {
        let records = vec![
            json!({"id": 1, "nome": "FORNECEDOR VICHY", "tipo": "J"}),
            json!({"id": 2, "nome": "FORNECEDOR LA ROCHE POSAY", "tipo": "J"}),
            json!({"id": 3, "nome": "FORNECEDOR EUCERIN BRASIL", "tipo": "J"}),
            json!({"id": 4, "nome": "FORNECEDOR BIODERMA LABS", "tipo": "J"}),
        ];
        DirectorySnapshot::from_records("v3", &records, "FORNECEDOR", false)
    }

    fn brand(name: &str) -> Brand {
        Brand::new(name, Provenance::DirectField)
    }

    #[tokio::test]
    async fn exact_brand_matches_without_ai() {
        let inference = ScriptedSupplierInference::answering(SupplierDecision::default());
        let calls = inference.calls();
        let matcher = SupplierMatcher::new(Arc::new(inference));
        let ctx = RunContext::new();
        let found = matcher
            .match_supplier(&ctx, &brand("Vichy"), "item-1", "VCH-089", &directory())
            .await
            .unwrap();
        assert_eq!(found.supplier.id, "1");
        assert_eq!(found.kind, MatchKind::Exact);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn diacritics_and_punctuation_do_not_block_exact_match() {
        let matcher =
            SupplierMatcher::new(Arc::new(ScriptedSupplierInference::failing()));
        let ctx = RunContext::new();
        let found = matcher
            .match_supplier(&ctx, &brand("La Roche-Posay"), "item-2", "LRP-1", &directory())
            .await
            .unwrap();
        assert_eq!(found.supplier.id, "2");
        assert_eq!(found.kind, MatchKind::Exact);
    }

    #[tokio::test]
    async fn substring_falls_to_heuristic() {
        let matcher =
            SupplierMatcher::new(Arc::new(ScriptedSupplierInference::failing()));
        let ctx = RunContext::new();
        let found = matcher
            .match_supplier(&ctx, &brand("Eucerin"), "item-3", "EUC-1", &directory())
            .await
            .unwrap();
        assert_eq!(found.supplier.id, "3");
        assert_eq!(found.kind, MatchKind::Heuristic);
    }

    #[tokio::test]
    async fn ai_tie_break_accepts_listed_supplier() {
        let inference = ScriptedSupplierInference::answering(SupplierDecision {
            should_order: true,
            supplier_id: Some("4".into()),
            supplier_name: Some("Bioderma Labs".into()),
        });
        let seen = inference.seen_candidates();
        let matcher = SupplierMatcher::new(Arc::new(inference));
        let ctx = RunContext::new();
        let found = matcher
            .match_supplier(&ctx, &brand("Bioderma Sensibio"), "item-4", "BIO-1", &directory())
            .await
            .unwrap();
        assert_eq!(found.supplier.id, "4");
        assert_eq!(found.kind, MatchKind::Ai);
        assert_eq!(*seen.lock().unwrap(), vec!["4".to_string()]);
        assert_eq!(ctx.counters().inference_calls, 1);
    }

    #[tokio::test]
    async fn name_mismatch_is_tolerated() {
        let inference = ScriptedSupplierInference::answering(SupplierDecision {
            should_order: true,
            supplier_id: Some("4".into()),
            supplier_name: Some("Something Else".into()),
        });
        let matcher = SupplierMatcher::new(Arc::new(inference));
        let ctx = RunContext::new();
        let found = matcher
            .match_supplier(&ctx, &brand("Bioderma Sensibio"), "item-5", "BIO-2", &directory())
            .await;
        assert_eq!(found.map(|m| m.supplier.id), Some("4".to_string()));
    }

    #[tokio::test]
    async fn declined_or_unlisted_answers_yield_none() {
        let ctx = RunContext::new();
        let declined = SupplierMatcher::new(Arc::new(ScriptedSupplierInference::answering(
            SupplierDecision {
                should_order: false,
                supplier_id: Some("4".into()),
                supplier_name: None,
            },
        )));
        assert!(
            declined
                .match_supplier(&ctx, &brand("Bioderma Sensibio"), "i", "s", &directory())
                .await
                .is_none()
        );

        let unlisted = SupplierMatcher::new(Arc::new(ScriptedSupplierInference::answering(
            SupplierDecision {
                should_order: true,
                supplier_id: Some("999".into()),
                supplier_name: None,
            },
        )));
        assert!(
            unlisted
                .match_supplier(&ctx, &brand("Bioderma Sensibio"), "i", "s", &directory())
                .await
                .is_none()
        );
    }

    #[tokio::test]
    async fn unknown_brand_and_no_candidates_skip_ai() {
        let inference = ScriptedSupplierInference::answering(SupplierDecision::default());
        let calls = inference.calls();
        let matcher = SupplierMatcher::new(Arc::new(inference));
        let ctx = RunContext::new();
        let unknown = Brand::unknown(Provenance::Unknown);
        assert!(
            matcher
                .match_supplier(&ctx, &unknown, "i", "s", &directory())
                .await
                .is_none()
        );
        assert!(
            matcher
                .match_supplier(&ctx, &brand("Nuxe"), "i", "s", &directory())
                .await
                .is_none()
        );
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn candidate_list_is_capped() {
        let records: Vec<Value> = (0..15)
            .map(|i| json!({"id": i, "nome": format!("FORNECEDOR ACME {i}"), "tipo": "J"}))
            .collect();
        let snapshot = DirectorySnapshot::from_records("v3", &records, "FORNECEDOR", false);
        let candidates = ai_candidates("Acme Industrial", "acmeindustrial", &snapshot);
        assert_eq!(candidates.len(), MAX_AI_CANDIDATES);
        assert_eq!(candidates[0].id, "0");
    }

    #[test]
    fn decision_accepts_numeric_ids() {
        let decision: SupplierDecision = serde_json::from_value(json!({
            "deveGerarOC": true,
            "fornecedorId": 17,
            "fornecedorNome": "FORNECEDOR VICHY"
        }))
        .unwrap();
        assert_eq!(decision.supplier_id.as_deref(), Some("17"));
    }
}
