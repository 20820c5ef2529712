use crate::dispatch::{OrderPayload, OrderTarget};
use crate::erp::client::{ErpClient, ErpError, NO_QUERY, canonical_id};
use crate::erp::config::ORDER_RETRIEVAL_TIMEOUT_SECS;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Value, json};
use std::time::Duration;
use urlencoding::encode;

/// Inbound sale order, reduced to what purchase-order generation reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaleOrder {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, rename = "numero", deserialize_with = "de_opt_id")]
    pub number: Option<String>,
    #[serde(default, rename = "itens")]
    pub items: Vec<LineItem>,
}

impl SaleOrder {
    /// Human-facing order reference: the number when present, else the id.
    pub fn reference(&self) -> &str {
        self.number.as_deref().unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default, rename = "produto")]
    pub product: Option<ProductRef>,
    #[serde(default, rename = "codigo")]
    pub sku: Option<String>,
    #[serde(default, rename = "descricao")]
    pub description: Option<String>,
    #[serde(default, rename = "quantidade", deserialize_with = "de_opt_number")]
    pub quantity: Option<f64>,
    #[serde(default, rename = "valor", deserialize_with = "de_opt_number")]
    pub unit_value: Option<f64>,
}

impl LineItem {
    pub fn product_id(&self) -> Option<&str> {
        self.product.as_ref().and_then(|p| p.id.as_deref())
    }

    /// Identifier used in logs and reports when the item has no id of its own.
    pub fn correlation_id(&self, position: usize) -> String {
        self.id
            .clone()
            .or_else(|| self.sku.clone())
            .unwrap_or_else(|| format!("item-{}", position + 1))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProductRef {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
}

pub(crate) fn de_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    let value = Value::deserialize(deserializer)?;
    canonical_id(&value).ok_or_else(|| serde::de::Error::custom("missing order id"))
}

pub(crate) fn de_opt_id<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(canonical_id(&value))
}

/// Numbers arrive either as JSON numbers or as decimal strings.
fn de_opt_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', ".").parse::<f64>().ok(),
        _ => None,
    })
}

#[async_trait]
pub trait SaleOrderSource: Send + Sync {
    async fn fetch_sale_order(&self, id: &str) -> Result<SaleOrder, ErpError>;
}

pub struct ErpSaleOrders {
    client: ErpClient,
}

impl ErpSaleOrders {
    pub fn new(client: ErpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SaleOrderSource for ErpSaleOrders {
    async fn fetch_sale_order(&self, id: &str) -> Result<SaleOrder, ErpError> {
        let body = self
            .client
            .get_json(
                &format!("/pedidos/vendas/{}", encode(id)),
                NO_QUERY,
                Some(Duration::from_secs(ORDER_RETRIEVAL_TIMEOUT_SECS)),
            )
            .await?;
        let data = body.get("data").cloned().unwrap_or(body);
        serde_json::from_value(data).map_err(|err| ErpError::Malformed(err.to_string()))
    }
}

/// Submits purchase orders and hands back a `{retorno: ...}` envelope.
pub struct ErpPurchaseOrders {
    client: ErpClient,
}

impl ErpPurchaseOrders {
    pub fn new(client: ErpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl OrderTarget for ErpPurchaseOrders {
    async fn submit_order(&self, payload: &OrderPayload) -> Result<Value, ErpError> {
        let body = self.client.post_json("/pedidos/compras", payload).await?;
        Ok(to_envelope(body))
    }
}

/// The current API answers `{data: {id}}` on success and `{error: {...}}` on
/// validation failures; the classifier reads the legacy `retorno` envelope.
/// Bodies that already carry `retorno`, and error bodies, pass through.
pub fn to_envelope(body: Value) -> Value {
    if body.get("retorno").is_some() {
        return body;
    }
    match body.pointer("/data/id").and_then(canonical_id) {
        Some(id) => json!({
            "retorno": {
                "status": "sucesso",
                "ordem_compra": {"id": id},
            }
        }),
        None => body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sale_order_accepts_string_numbers() {
        let order: SaleOrder = serde_json::from_value(json!({
            "id": 9001,
            "numero": 123,
            "itens": [
                {"id": 1, "codigo": "VCH-089", "quantidade": "2,000", "valor": "49.90", "produto": {"id": 1020}},
                {"codigo": "X", "quantidade": 1}
            ]
        }))
        .unwrap();
        assert_eq!(order.reference(), "123");
        assert_eq!(order.items[0].quantity, Some(2.0));
        assert_eq!(order.items[0].unit_value, Some(49.9));
        assert_eq!(order.items[0].product_id(), Some("1020"));
        assert_eq!(order.items[1].unit_value, None);
        assert_eq!(order.items[1].correlation_id(1), "X");
    }

    #[test]
    fn current_api_success_becomes_envelope() {
        let envelope = to_envelope(json!({"data": {"id": 42}}));
        assert_eq!(envelope["retorno"]["ordem_compra"]["id"], json!("42"));
        let error = json!({"error": {"type": "VALIDATION_ERROR", "fields": []}});
        assert_eq!(to_envelope(error.clone()), error);
    }
}
