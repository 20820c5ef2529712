use crate::erp::client::{ErpClient, ErpError, extract_records};
use crate::erp::config::{LEGACY_PAGE_SIZE, MAX_PAGE_SIZE};
use async_trait::async_trait;
use serde_json::Value;

/// Server-side hints for the contact listing. The directory re-applies the
/// same rules locally, so a source may ignore them.
#[derive(Debug, Clone, Default)]
pub struct SupplierFilters {
    pub person_type: Option<String>,
    pub name_search: Option<String>,
}

#[async_trait]
pub trait SupplierSource: Send + Sync {
    /// Label used in logs ("v3", "v2", ...).
    fn version(&self) -> &str;

    /// Rows per full page this source actually serves when `requested` is
    /// asked for. A shorter page ends the listing, so this must not
    /// overstate what upstream returns.
    fn page_size(&self, requested: usize) -> usize {
        requested
    }

    async fn list_suppliers(
        &self,
        page: u32,
        page_size: usize,
        filters: &SupplierFilters,
    ) -> Result<Vec<Value>, ErpError>;
}

/// Current API: `GET /contatos?pagina=&limite=&tipoPessoa=&pesquisa=`.
pub struct ContactsV3 {
    client: ErpClient,
}

impl ContactsV3 {
    pub fn new(client: ErpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SupplierSource for ContactsV3 {
    fn version(&self) -> &str {
        "v3"
    }

    fn page_size(&self, requested: usize) -> usize {
        requested.clamp(1, MAX_PAGE_SIZE)
    }

    async fn list_suppliers(
        &self,
        page: u32,
        page_size: usize,
        filters: &SupplierFilters,
    ) -> Result<Vec<Value>, ErpError> {
        let mut query = vec![
            ("pagina", page.to_string()),
            ("limite", page_size.to_string()),
        ];
        if let Some(kind) = &filters.person_type {
            query.push(("tipoPessoa", kind.clone()));
        }
        if let Some(search) = &filters.name_search {
            query.push(("pesquisa", search.clone()));
        }
        let body = self.client.get_json("/contatos", &query, None).await?;
        extract_records(&body)
    }
}

/// Legacy API: `GET /contatos/page={n}/json/` with a `filters` expression.
/// Page size is fixed upstream.
pub struct ContactsV2 {
    client: ErpClient,
}

impl ContactsV2 {
    pub fn new(client: ErpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SupplierSource for ContactsV2 {
    fn version(&self) -> &str {
        "v2"
    }

    fn page_size(&self, _requested: usize) -> usize {
        LEGACY_PAGE_SIZE
    }

    async fn list_suppliers(
        &self,
        page: u32,
        _page_size: usize,
        filters: &SupplierFilters,
    ) -> Result<Vec<Value>, ErpError> {
        let mut query = Vec::new();
        if let Some(kind) = &filters.person_type {
            query.push(("filters", format!("tipoPessoa[{kind}]")));
        }
        let body = match self
            .client
            .get_json(&format!("/contatos/page={page}/json/"), &query, None)
            .await
        {
            Err(ErpError::NotFound) => return Ok(Vec::new()),
            other => other?,
        };
        extract_records(&body)
    }
}
