//! Eligible-supplier directory built from the ERP contact listings.
//!
//! The primary source is tried first; when it produces no eligible supplier
//! (or fails for any reason other than missing credentials) the secondary
//! source is used. A failure of the secondary source is returned as is.

use crate::erp::client::{ErpError, canonical_id};
use crate::erp::config::JURIDICAL_PERSON_CODE;
use crate::erp::{SupplierFilters, SupplierSource};
use crate::fetcher::{PagedFetcher, PagingConfig, Sleeper, TokioSleeper};
use crate::normalize::{fold, has_prefix, match_key, normalize_name, strip_prefix};
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashSet, sync::Arc};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Supplier {
    pub id: String,
    pub name: String,
    /// Whole name folded to `[a-z0-9]`.
    pub normalized_name: String,
    /// Name without the naming prefix, folded. Used for every comparison.
    pub match_key: String,
    pub juridical: bool,
    pub eligible: bool,
}

impl Supplier {
    /// Parse a raw contact record. Returns `None` when it has no id or name.
    pub fn from_record(record: &Value, prefix: &str) -> Option<Self> {
        let id = record
            .get("id")
            .or_else(|| record.get("codigo"))
            .and_then(canonical_id)?;
        let name = ["nome", "name", "fantasia"]
            .iter()
            .find_map(|key| record.get(*key).and_then(Value::as_str))
            .map(str::trim)
            .filter(|name| !name.is_empty())?
            .to_string();
        let juridical = ["tipo", "tipoPessoa", "tipo_pessoa", "personType"]
            .iter()
            .find_map(|key| record.get(*key).and_then(Value::as_str))
            .is_some_and(is_juridical);
        Some(Self {
            normalized_name: normalize_name(&name),
            match_key: match_key(&name, prefix),
            eligible: has_prefix(&name, prefix),
            juridical,
            id,
            name,
        })
    }

    /// Brand as implied by the supplier name, in its original casing.
    pub fn brand_label<'a>(&'a self, prefix: &str) -> &'a str {
        strip_prefix(&self.name, prefix)
    }
}

fn is_juridical(raw: &str) -> bool {
    let folded = fold(raw.trim());
    folded.eq_ignore_ascii_case(JURIDICAL_PERSON_CODE)
        || matches!(folded.as_str(), "pj" | "juridica" | "pessoa juridica" | "juridical")
}

/// De-duplicated, filtered suppliers for one run, in first-seen order.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DirectorySnapshot {
    pub source: String,
    pub suppliers: Vec<Supplier>,
    pub truncated: bool,
    #[serde(skip)]
    pub prefix: String,
}

impl DirectorySnapshot {
    pub fn from_records(source: &str, records: &[Value], prefix: &str, truncated: bool) -> Self {
        let mut seen = HashSet::new();
        let mut suppliers = Vec::new();
        for record in records {
            let Some(supplier) = Supplier::from_record(record, prefix) else {
                continue;
            };
            if !seen.insert(supplier.id.clone()) {
                continue;
            }
            if supplier.juridical && supplier.eligible {
                suppliers.push(supplier);
            }
        }
        Self {
            source: source.to_string(),
            suppliers,
            truncated,
            prefix: prefix.to_string(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.suppliers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.suppliers.len()
    }

    pub fn get(&self, id: &str) -> Option<&Supplier> {
        let id = id.trim();
        self.suppliers.iter().find(|supplier| supplier.id == id)
    }

    /// Brand names implied by supplier names, for the text heuristic.
    pub fn brand_labels(&self) -> Vec<String> {
        self.suppliers
            .iter()
            .map(|supplier| supplier.brand_label(&self.prefix).to_string())
            .filter(|label| !label.is_empty())
            .collect()
    }
}

#[derive(Clone)]
pub struct SupplierDirectory {
    primary: Arc<dyn SupplierSource>,
    secondary: Option<Arc<dyn SupplierSource>>,
    paging: PagingConfig,
    sleeper: Arc<dyn Sleeper>,
    prefix: String,
}

impl SupplierDirectory {
    pub fn new(
        primary: Arc<dyn SupplierSource>,
        secondary: Option<Arc<dyn SupplierSource>>,
        paging: PagingConfig,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            primary,
            secondary,
            paging,
            sleeper: Arc::new(TokioSleeper),
            prefix: prefix.into(),
        }
    }

    #[cfg(test)]
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub async fn load(&self) -> Result<DirectorySnapshot, ErpError> {
        let primary = self.load_from(self.primary.clone()).await;
        let Some(secondary) = self.secondary.clone() else {
            return primary;
        };
        match primary {
            Ok(snapshot) if !snapshot.is_empty() => return Ok(snapshot),
            Ok(_) => warn!(
                target = "oc.directory",
                source = self.primary.version(),
                fallback = secondary.version(),
                "primary_source_empty_falling_back"
            ),
            Err(ErpError::AuthUnavailable) => return Err(ErpError::AuthUnavailable),
            Err(err) => warn!(
                target = "oc.directory",
                source = self.primary.version(),
                fallback = secondary.version(),
                error = %err,
                "primary_source_failed_falling_back"
            ),
        }
        let snapshot = self.load_from(secondary).await?;
        if snapshot.is_empty() {
            warn!(
                target = "oc.directory",
                source = %snapshot.source,
                "no_eligible_suppliers"
            );
        }
        Ok(snapshot)
    }

    async fn load_from(
        &self,
        source: Arc<dyn SupplierSource>,
    ) -> Result<DirectorySnapshot, ErpError> {
        let filters = SupplierFilters {
            person_type: Some(JURIDICAL_PERSON_CODE.to_string()),
            name_search: Some(self.prefix.clone()).filter(|p| !p.is_empty()),
        };
        let page_size = source.page_size(self.paging.page_size);
        let paging = PagingConfig {
            page_size,
            ..self.paging.clone()
        };
        let label = format!("suppliers.{}", source.version());
        let fetch_source = source.clone();
        let fetcher = PagedFetcher::with_sleeper(
            label,
            paging,
            self.sleeper.clone(),
            move |page| {
                let source = fetch_source.clone();
                let filters = filters.clone();
                async move { source.list_suppliers(page, page_size, &filters).await }
            },
        );
        let listing = fetcher.collect_all().await?;
        let snapshot = DirectorySnapshot::from_records(
            source.version(),
            &listing.records,
            &self.prefix,
            listing.truncated,
        );
        info!(
            target = "oc.directory",
            source = source.version(),
            raw = listing.records.len(),
            eligible = snapshot.len(),
            pages = listing.pages,
            truncated = listing.truncated,
            "directory_loaded"
        );
        Ok(snapshot)
    }
}
