use crate::brand::Brand;
use crate::context::CounterSnapshot;
use crate::dispatch::DispatchReport;
use crate::erp::orders::{de_id, de_opt_id};
use crate::erp::{LineItem, SaleOrder};
use crate::matcher::MatchKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::collections::BTreeMap;

/// ERP webhook delivery for a sale order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEvent {
    #[serde(default, rename = "eventId", alias = "event_id", deserialize_with = "de_opt_id")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    pub data: EventOrder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventOrder {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, rename = "numero", deserialize_with = "de_opt_id")]
    pub number: Option<String>,
    /// Absent when the webhook carries only the order reference.
    #[serde(default, rename = "itens")]
    pub items: Option<Vec<LineItem>>,
}

impl OrderEvent {
    /// Key used to recognise repeated deliveries of the same event.
    pub fn dedup_key(&self) -> String {
        match &self.event_id {
            Some(id) => format!("event:{id}"),
            None => format!("order:{}", self.data.id),
        }
    }

    /// The inline sale order, when the webhook carried its items.
    pub fn inline_order(&self) -> Option<SaleOrder> {
        self.data.items.as_ref().map(|items| SaleOrder {
            id: self.data.id.clone(),
            number: self.data.number.clone(),
            items: items.clone(),
        })
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunResponse {
    pub run_id: String,
    pub order_id: String,
    pub order_number: Option<String>,
    pub items: Vec<ItemReport>,
    pub counters: CounterSnapshot,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MatchedSupplier {
    pub id: String,
    pub name: String,
    pub kind: MatchKind,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ItemReport {
    pub item_id: String,
    pub sku: Option<String>,
    pub product_id: Option<String>,
    pub brand: Option<Brand>,
    pub supplier: Option<MatchedSupplier>,
    #[serde(flatten)]
    pub status: ItemStatus,
}

#[skip_serializing_none]
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    Dispatched {
        dispatch: DispatchReport,
    },
    Skipped {
        reason: SkipReason,
        detail: Option<String>,
    },
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    MissingProduct,
    ProductUnavailable,
    UnknownBrand,
    NoSupplier,
    InvalidPayload,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CatalogReport {
    pub run_id: String,
    pub products: usize,
    pub pages: u32,
    pub truncated: bool,
    pub by_provenance: BTreeMap<String, usize>,
    pub entries: Vec<CatalogEntry>,
    pub counters: CounterSnapshot,
    pub stages: Vec<StageReport>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct CatalogEntry {
    pub product_id: String,
    pub sku: Option<String>,
    pub brand: Brand,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StageReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl StageReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
