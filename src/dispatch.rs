//! Purchase-order composition, submission and response classification.
//!
//! Submission happens once. The ERP does not deduplicate purchase orders, so
//! a transport failure is reported as `failure` instead of being retried.

use crate::context::RunContext;
use crate::directory::Supplier;
use crate::erp::client::canonical_id;
use crate::erp::{ErpError, LineItem, SaleOrder};
use crate::inference::InferenceError;
use crate::notify::NotificationSink;
use async_trait::async_trait;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::{env, sync::Arc};
use thiserror::Error;
use tracing::{error, info, warn};

/// Identifier wrapper. Numeric ids go out as JSON numbers, anything else as a string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdRef {
    #[serde(serialize_with = "ser_id")]
    pub id: String,
}

impl IdRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

fn ser_id<S: Serializer>(id: &str, serializer: S) -> Result<S::Ok, S::Error> {
    match id.trim().parse::<u64>() {
        Ok(number) => serializer.serialize_u64(number),
        Err(_) => serializer.serialize_str(id),
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BuyerContact {
    #[serde(rename = "nome")]
    pub name: String,
    pub email: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Installment {
    #[serde(rename = "dias")]
    pub days: u32,
    #[serde(rename = "valor")]
    pub amount: f64,
    #[serde(rename = "contaContabil")]
    pub account: Option<IdRef>,
    #[serde(rename = "formaPagamento")]
    pub payment_method: Option<IdRef>,
    #[serde(rename = "observacao")]
    pub notes: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderLine {
    #[serde(rename = "produto")]
    pub product: IdRef,
    #[serde(rename = "quantidade")]
    pub quantity: Option<f64>,
    #[serde(rename = "valor")]
    pub unit_value: Option<f64>,
    #[serde(rename = "informacoesAdicionais")]
    pub info: Option<String>,
    #[serde(rename = "aliquotaIpi")]
    pub ipi_rate: f64,
    #[serde(rename = "valorIcms")]
    pub icms_value: f64,
}

/// Purchase-order body as the ERP expects it. Built once per line item and
/// never mutated after submission.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderPayload {
    #[serde(rename = "fornecedor")]
    pub supplier: IdRef,
    #[serde(rename = "data")]
    pub date: String,
    #[serde(rename = "dataPrevista")]
    pub delivery_date: String,
    #[serde(rename = "categoria")]
    pub category: Option<IdRef>,
    #[serde(rename = "contato")]
    pub buyer: Option<BuyerContact>,
    #[serde(rename = "parcelas")]
    pub installments: Vec<Installment>,
    #[serde(rename = "itens")]
    pub items: Vec<OrderLine>,
    #[serde(rename = "observacoes")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("supplier id is missing")]
    MissingSupplier,
    #[error("order has no items")]
    NoItems,
    #[error("product id is missing")]
    MissingProduct,
    #[error("quantity is missing")]
    MissingQuantity,
    #[error("unit value is missing")]
    MissingUnitValue,
    #[error("delivery date `{0}` is not YYYY-MM-DD")]
    InvalidDeliveryDate(String),
}

impl PayloadError {
    pub fn code(&self) -> &'static str {
        match self {
            PayloadError::MissingSupplier => "missing_supplier_id",
            PayloadError::NoItems => "no_items",
            PayloadError::MissingProduct => "missing_product_id",
            PayloadError::MissingQuantity => "missing_quantity",
            PayloadError::MissingUnitValue => "missing_unit_value",
            PayloadError::InvalidDeliveryDate(_) => "invalid_delivery_date",
        }
    }
}

impl OrderPayload {
    pub fn validate(&self) -> Result<(), PayloadError> {
        if self.supplier.id.trim().is_empty() {
            return Err(PayloadError::MissingSupplier);
        }
        if self.items.is_empty() {
            return Err(PayloadError::NoItems);
        }
        for line in &self.items {
            if line.product.id.trim().is_empty() {
                return Err(PayloadError::MissingProduct);
            }
            if !line.quantity.is_some_and(f64::is_finite) {
                return Err(PayloadError::MissingQuantity);
            }
            if !line.unit_value.is_some_and(f64::is_finite) {
                return Err(PayloadError::MissingUnitValue);
            }
        }
        if !is_iso_date(&self.delivery_date) {
            return Err(PayloadError::InvalidDeliveryDate(self.delivery_date.clone()));
        }
        Ok(())
    }
}

/// `YYYY-MM-DD` shape that is also a real calendar date.
pub fn is_iso_date(value: &str) -> bool {
    let bytes = value.as_bytes();
    bytes.len() == 10
        && bytes.iter().enumerate().all(|(idx, byte)| match idx {
            4 | 7 => *byte == b'-',
            _ => byte.is_ascii_digit(),
        })
        && NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
}

/// Longest accepted `ORDER_LEAD_TIME_DAYS`.
pub const MAX_LEAD_TIME_DAYS: i64 = 365;

/// Payment and buyer defaults applied to every generated order.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentTerms {
    pub lead_time_days: i64,
    pub installment_days: Vec<u32>,
    pub account_id: Option<String>,
    pub payment_method_id: Option<String>,
    pub category_id: Option<String>,
    pub buyer: Option<BuyerContact>,
}

impl Default for PaymentTerms {
    fn default() -> Self {
        Self {
            lead_time_days: 7,
            installment_days: vec![30],
            account_id: None,
            payment_method_id: None,
            category_id: None,
            buyer: None,
        }
    }
}

impl PaymentTerms {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let installment_days: Vec<u32> = env::var("ORDER_INSTALLMENT_DAYS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .filter_map(|part| part.trim().parse::<u32>().ok())
                    .collect()
            })
            .unwrap_or_default();
        Self {
            lead_time_days: env::var("ORDER_LEAD_TIME_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|v| (0..=MAX_LEAD_TIME_DAYS).contains(v))
                .unwrap_or(defaults.lead_time_days),
            installment_days: if installment_days.is_empty() {
                defaults.installment_days
            } else {
                installment_days
            },
            account_id: env_id("ORDER_ACCOUNT_ID"),
            payment_method_id: env_id("ORDER_PAYMENT_METHOD_ID"),
            category_id: env_id("ORDER_CATEGORY_ID"),
            buyer: env_id("ORDER_BUYER_NAME").map(|name| BuyerContact {
                name,
                email: env_id("ORDER_BUYER_EMAIL"),
            }),
        }
    }
}

fn env_id(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Build the purchase order for one sale-order line. Missing inputs are kept
/// missing so that [`OrderPayload::validate`] can reject them.
pub fn compose_order(
    order: &SaleOrder,
    item: &LineItem,
    supplier: &Supplier,
    terms: &PaymentTerms,
    today: NaiveDate,
) -> OrderPayload {
    let delivery = Duration::try_days(terms.lead_time_days)
        .and_then(|lead| today.checked_add_signed(lead))
        .unwrap_or(today);
    let total = match (item.quantity, item.unit_value) {
        (Some(quantity), Some(unit)) => round_cents(quantity * unit),
        _ => 0.0,
    };
    let schedule = if terms.installment_days.is_empty() {
        vec![0]
    } else {
        terms.installment_days.clone()
    };
    let count = schedule.len();
    let share = round_cents(total / count as f64);
    let mut allocated = 0.0;
    let installments = schedule
        .iter()
        .enumerate()
        .map(|(idx, due)| {
            let amount = if idx + 1 == count {
                round_cents(total - allocated)
            } else {
                share
            };
            allocated += amount;
            Installment {
                days: *due,
                amount,
                account: terms.account_id.clone().map(IdRef::new),
                payment_method: terms.payment_method_id.clone().map(IdRef::new),
                notes: Some(format!("Parcela {} de {count}", idx + 1)),
            }
        })
        .collect();

    let mut info = format!("Pedido de venda {}", order.reference());
    if let Some(sku) = item.sku.as_deref() {
        info.push_str(&format!(" | SKU {sku}"));
    }

    OrderPayload {
        supplier: IdRef::new(supplier.id.clone()),
        date: today.format("%Y-%m-%d").to_string(),
        delivery_date: delivery.format("%Y-%m-%d").to_string(),
        category: terms.category_id.clone().map(IdRef::new),
        buyer: terms.buyer.clone(),
        installments,
        items: vec![OrderLine {
            product: IdRef::new(item.product_id().unwrap_or_default()),
            quantity: item.quantity,
            unit_value: item.unit_value,
            info: Some(info),
            ipi_rate: 0.0,
            icms_value: 0.0,
        }],
        notes: Some(format!(
            "Gerado automaticamente a partir do pedido {}",
            order.reference()
        )),
    }
}

#[async_trait]
pub trait OrderTarget: Send + Sync {
    /// Submit once and return the `{retorno: ...}` envelope (or the raw error body).
    async fn submit_order(&self, payload: &OrderPayload) -> Result<Value, ErpError>;
}

#[async_trait]
pub trait ErrorClassifierPort: Send + Sync {
    /// `true` when the error detail does not affect whether the order exists.
    async fn is_error_irrelevant(&self, detail: &Value) -> Result<bool, InferenceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DispatchOutcome {
    Success,
    Failure,
    AmbiguousResolvedSuccess,
}

impl DispatchOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchOutcome::Success => "success",
            DispatchOutcome::Failure => "failure",
            DispatchOutcome::AmbiguousResolvedSuccess => "ambiguous-resolved-success",
        }
    }
}

/// What the raw submission response says, before any AI escalation.
#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    Created(String),
    /// Only the known accounting-account complaint; never alerted.
    BenignOnly,
    ErrorDetail(Value),
    Unrecognized,
}

pub fn classify_envelope(response: &Value) -> Classification {
    if let Some(id) = created_order_id(response) {
        return Classification::Created(id);
    }
    let fields = error_fields(response);
    if !fields.is_empty()
        && fields
            .iter()
            .all(|field| field.as_deref().is_some_and(is_benign_accounting_field))
    {
        return Classification::BenignOnly;
    }
    match error_detail(response) {
        Some(detail) => Classification::ErrorDetail(detail),
        None => Classification::Unrecognized,
    }
}

fn created_order_id(response: &Value) -> Option<String> {
    [
        "/retorno/ordem_compra/id",
        "/retorno/ordemcompra/id",
        "/ordem_compra/id",
        "/data/id",
    ]
    .iter()
    .find_map(|pointer| response.pointer(pointer).and_then(canonical_id))
}

fn error_lists(response: &Value) -> Vec<&Value> {
    [
        response.pointer("/retorno/erros"),
        response.get("erros"),
        response.pointer("/error/fields"),
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Field named by each error entry; `None` for entries without one.
fn error_fields(response: &Value) -> Vec<Option<String>> {
    let mut fields = Vec::new();
    for list in error_lists(response) {
        let entries: Vec<&Value> = match list {
            Value::Array(items) => items.iter().collect(),
            Value::Object(_) => vec![list],
            _ => continue,
        };
        for entry in entries {
            let field = ["/campo", "/erro/campo", "/field", "/element"]
                .iter()
                .find_map(|pointer| entry.pointer(pointer).and_then(Value::as_str))
                .map(str::to_string);
            fields.push(field);
        }
    }
    fields
}

/// `parcelas[N].contaContabil.id`
fn is_benign_accounting_field(field: &str) -> bool {
    let Some(rest) = field.trim().strip_prefix("parcelas[") else {
        return false;
    };
    let Some((index, tail)) = rest.split_once(']') else {
        return false;
    };
    !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) && tail == ".contaContabil.id"
}

fn is_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::String(text) => !text.trim().is_empty(),
        _ => true,
    }
}

fn error_detail(response: &Value) -> Option<Value> {
    [
        response.pointer("/retorno/erros"),
        response.pointer("/retorno/detalhes"),
        response.get("erros"),
        response.get("error"),
        response.get("detalhes"),
    ]
    .into_iter()
    .flatten()
    .find(|value| is_present(value))
    .cloned()
}

fn response_status(response: &Value) -> Option<String> {
    ["/retorno/status", "/status", "/error/type"]
        .iter()
        .find_map(|pointer| response.pointer(pointer).and_then(Value::as_str))
        .map(str::to_string)
}

fn response_message(response: &Value) -> Option<String> {
    ["/retorno/mensagem", "/mensagem", "/error/message", "/error/description"]
        .iter()
        .find_map(|pointer| response.pointer(pointer).and_then(Value::as_str))
        .map(str::to_string)
}

#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub outcome: DispatchOutcome,
    pub order_id: Option<String>,
    pub status: Option<String>,
    pub message: Option<String>,
    pub errors: Option<Value>,
    pub notified: bool,
    pub suppressed: bool,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid order payload: {0}")]
    Invalid(#[from] PayloadError),
    #[error("authentication unavailable")]
    AuthUnavailable,
}

/// Human references carried into operator notifications.
#[derive(Debug, Clone)]
pub struct DispatchLabels {
    pub order_reference: String,
    pub brand: String,
    pub supplier: String,
}

#[derive(Clone)]
pub struct OrderDispatcher {
    target: Arc<dyn OrderTarget>,
    classifier: Arc<dyn ErrorClassifierPort>,
    notifier: Arc<dyn NotificationSink>,
}

impl OrderDispatcher {
    pub fn new(
        target: Arc<dyn OrderTarget>,
        classifier: Arc<dyn ErrorClassifierPort>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            target,
            classifier,
            notifier,
        }
    }

    pub async fn dispatch(
        &self,
        ctx: &RunContext,
        payload: &OrderPayload,
        labels: &DispatchLabels,
    ) -> Result<DispatchReport, DispatchError> {
        payload.validate()?;

        let response = match self.target.submit_order(payload).await {
            Ok(response) => response,
            Err(ErpError::AuthUnavailable) => return Err(DispatchError::AuthUnavailable),
            Err(err) => {
                error!(
                    target = "oc.dispatch",
                    order = %labels.order_reference,
                    supplier = %labels.supplier,
                    error = %err,
                    "submission_failed"
                );
                let mut report = DispatchReport {
                    outcome: DispatchOutcome::Failure,
                    order_id: None,
                    status: None,
                    message: Some(err.to_string()),
                    errors: None,
                    notified: false,
                    suppressed: false,
                };
                report.notified = self.send(ctx, &report, labels).await;
                return Ok(report);
            }
        };

        let mut report = DispatchReport {
            outcome: DispatchOutcome::Failure,
            order_id: None,
            status: response_status(&response),
            message: response_message(&response),
            errors: error_detail(&response),
            notified: false,
            suppressed: false,
        };

        match classify_envelope(&response) {
            Classification::Created(id) => {
                report.outcome = DispatchOutcome::Success;
                report.order_id = Some(id);
            }
            Classification::BenignOnly => {
                report.suppressed = true;
            }
            Classification::ErrorDetail(detail) => {
                ctx.record_inference_call();
                match self.classifier.is_error_irrelevant(&detail).await {
                    Ok(true) => report.outcome = DispatchOutcome::AmbiguousResolvedSuccess,
                    Ok(false) => {}
                    Err(err) => warn!(
                        target = "oc.dispatch",
                        order = %labels.order_reference,
                        error = %err,
                        "error_classification_failed"
                    ),
                }
            }
            Classification::Unrecognized => {
                warn!(
                    target = "oc.dispatch",
                    order = %labels.order_reference,
                    "submission_response_unrecognized"
                );
            }
        }

        info!(
            target = "oc.dispatch",
            order = %labels.order_reference,
            supplier = %labels.supplier,
            outcome = report.outcome.as_str(),
            order_id = report.order_id.as_deref().unwrap_or(""),
            suppressed = report.suppressed,
            "order_dispatched"
        );
        crate::metrics::dispatch_outcome(report.outcome.as_str());

        if !report.suppressed {
            report.notified = self.send(ctx, &report, labels).await;
        }
        Ok(report)
    }

    /// One best-effort notification. Returns whether it was delivered.
    async fn send(
        &self,
        ctx: &RunContext,
        report: &DispatchReport,
        labels: &DispatchLabels,
    ) -> bool {
        let text = notification_text(report, labels);
        ctx.record_notification();
        match self.notifier.notify(&text).await {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    target = "oc.notify",
                    order = %labels.order_reference,
                    error = %err,
                    "notification_failed"
                );
                crate::metrics::notification_failed();
                false
            }
        }
    }
}

pub fn notification_text(report: &DispatchReport, labels: &DispatchLabels) -> String {
    let refs = format!(
        "pedido {} | marca {} | fornecedor {}",
        labels.order_reference, labels.brand, labels.supplier
    );
    match report.outcome {
        DispatchOutcome::Success => format!(
            "Ordem de compra {} criada | {refs}",
            report.order_id.as_deref().unwrap_or("?")
        ),
        DispatchOutcome::AmbiguousResolvedSuccess => format!(
            "Ordem de compra provavelmente criada (resposta com erros irrelevantes) | {refs}"
        ),
        DispatchOutcome::Failure => format!(
            "Falha ao gerar ordem de compra | {refs} | detalhe: {}",
            report
                .message
                .clone()
                .or_else(|| report.errors.as_ref().map(Value::to_string))
                .unwrap_or_else(|| "resposta sem ordem_compra".into())
        ),
    }
}
