//! Live AI ports backed by the LLM gateway.

use crate::brand::{BrandInferencePort, UNKNOWN_BRAND};
use crate::directory::Supplier;
use crate::dispatch::ErrorClassifierPort;
use crate::erp::Product;
use crate::llm::{InferenceOptions, LlmClient, LlmError};
use crate::matcher::{SupplierDecision, SupplierInferencePort};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use thiserror::Error;

const BRAND_SYSTEM_PROMPT: &str = r#"
You identify the manufacturer brand of retail products sold by a Brazilian pharmacy and cosmetics store.
Answer with the brand name only, as plain text, with no punctuation or explanation.
If the brand cannot be determined, answer exactly "Desconhecida".
"#;

const SUPPLIER_SYSTEM_PROMPT: &str = r#"
You decide which supplier should receive a purchase order for a product.
Choose only among the candidate suppliers given. Respond with a single JSON object:
{"deveGerarOC": true|false, "fornecedorId": "<candidate id>", "fornecedorNome": "<candidate name>"}
Set "deveGerarOC" to false when no candidate clearly supplies the brand. Output JSON only.
"#;

const CLASSIFIER_SYSTEM_PROMPT: &str = r#"
You review error responses returned by an ERP after a purchase order submission.
Decide whether the reported errors are irrelevant to whether the order was actually created
(for example warnings about optional fields). Respond with a single JSON object:
{"irrelevante": true|false, "motivo": "<short reason>"}. Output JSON only.
"#;

#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference backend failed: {0}")]
    Backend(String),
    #[error("unparseable inference response: {0}")]
    Parse(String),
}

impl From<LlmError> for InferenceError {
    fn from(value: LlmError) -> Self {
        Self::Backend(value.to_string())
    }
}

/// Slice from the first `{` to the last `}`; models often wrap JSON in prose
/// or code fences.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_json_object(text: &str) -> Result<Value, InferenceError> {
    let raw = extract_json_object(text)
        .ok_or_else(|| InferenceError::Parse("no JSON object in response".into()))?;
    serde_json::from_str(raw).map_err(|err| InferenceError::Parse(err.to_string()))
}

/// One gateway client serving the three AI ports.
#[derive(Clone)]
pub struct LlmInference {
    llm: Arc<LlmClient>,
}

impl LlmInference {
    pub fn new(llm: Arc<LlmClient>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl BrandInferencePort for LlmInference {
    async fn infer_brand(&self, product: &Product) -> Result<String, InferenceError> {
        let record = serde_json::to_string_pretty(product)
            .map_err(|err| InferenceError::Parse(err.to_string()))?;
        let prompt = format!(
            "Which brand does this product belong to? Reply with the brand name only, or \"{UNKNOWN_BRAND}\".\n\n{record}"
        );
        let options = InferenceOptions {
            function_name: Some("oc_brand_inference"),
            system: Some(BRAND_SYSTEM_PROMPT),
        };
        let text = self.llm.complete(&prompt, &options).await?;
        Ok(text.trim().trim_matches('"').trim().to_string())
    }
}

#[async_trait]
impl SupplierInferencePort for LlmInference {
    async fn choose_supplier(
        &self,
        sku: &str,
        brand: &str,
        candidates: &[Supplier],
    ) -> Result<SupplierDecision, InferenceError> {
        let listed: Vec<Value> = candidates
            .iter()
            .map(|supplier| json!({"id": supplier.id, "nome": supplier.name}))
            .collect();
        let prompt = json!({
            "sku": sku,
            "marca": brand,
            "fornecedores": listed,
        })
        .to_string();
        let options = InferenceOptions {
            function_name: Some("oc_supplier_match"),
            system: Some(SUPPLIER_SYSTEM_PROMPT),
        };
        let text = self.llm.complete(&prompt, &options).await?;
        let value = parse_json_object(&text)?;
        serde_json::from_value(value).map_err(|err| InferenceError::Parse(err.to_string()))
    }
}

#[async_trait]
impl ErrorClassifierPort for LlmInference {
    async fn is_error_irrelevant(&self, detail: &Value) -> Result<bool, InferenceError> {
        let prompt = format!(
            "Is this error irrelevant to whether the purchase order was actually created?\n\n{detail}"
        );
        let options = InferenceOptions {
            function_name: Some("oc_error_classifier"),
            system: Some(CLASSIFIER_SYSTEM_PROMPT),
        };
        let text = self.llm.complete(&prompt, &options).await?;
        read_verdict(&parse_json_object(&text)?)
    }
}

fn read_verdict(value: &Value) -> Result<bool, InferenceError> {
    ["irrelevante", "irrelevant", "resposta"]
        .iter()
        .find_map(|key| match value.get(*key)? {
            Value::Bool(flag) => Some(*flag),
            Value::String(text) => match text.trim().to_lowercase().as_str() {
                "true" | "sim" | "yes" => Some(true),
                "false" | "nao" | "não" | "no" => Some(false),
                _ => None,
            },
            _ => None,
        })
        .ok_or_else(|| InferenceError::Parse("missing verdict".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_json_between_outer_braces() {
        let text = "Claro! ```json\n{\"deveGerarOC\": true, \"x\": {\"y\": 1}}\n``` espero ter ajudado";
        assert_eq!(
            extract_json_object(text),
            Some("{\"deveGerarOC\": true, \"x\": {\"y\": 1}}")
        );
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("} backwards {"), None);
    }

    #[test]
    fn invalid_json_is_a_parse_failure() {
        assert!(matches!(
            parse_json_object("{deveGerarOC: yes}"),
            Err(InferenceError::Parse(_))
        ));
    }

    #[test]
    fn verdict_accepts_bools_and_words() {
        assert!(read_verdict(&json!({"irrelevante": true})).unwrap());
        assert!(!read_verdict(&json!({"irrelevant": "nao"})).unwrap());
        assert!(read_verdict(&json!({"motivo": "?"})).is_err());
    }
}
