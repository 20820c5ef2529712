use crate::erp::client::{ErpClient, ErpError, NO_QUERY, extract_records};
use crate::erp::config::MAX_PAGE_SIZE;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use urlencoding::encode;

/// Catalog product as the ERP returns it. Only the fields brand resolution
/// reads are modelled; everything else is ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Product {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default, rename = "codigo", alias = "sku")]
    pub sku: Option<String>,
    #[serde(default, rename = "nome", alias = "name")]
    pub name: Option<String>,
    #[serde(default, rename = "descricaoCurta", alias = "descricao")]
    pub description: Option<String>,
    #[serde(default, rename = "descricaoComplementar")]
    pub supplementary_description: Option<String>,
    #[serde(default, rename = "observacoes")]
    pub notes: Option<String>,
    #[serde(default, rename = "categoria")]
    pub category: Option<ProductCategory>,
    #[serde(default, rename = "atributos", alias = "attributes")]
    pub attributes: Vec<ProductAttribute>,
    #[serde(default, rename = "marca", alias = "brand")]
    pub brand: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProductCategory {
    #[serde(default, deserialize_with = "de_opt_id")]
    pub id: Option<String>,
    #[serde(default, rename = "descricao", alias = "nome")]
    pub name: Option<String>,
    #[serde(default, rename = "caminho", alias = "path")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProductAttribute {
    #[serde(rename = "nome", alias = "name")]
    pub name: String,
    #[serde(default, rename = "valor", alias = "value")]
    pub value: Option<String>,
}

impl Product {
    /// Non-empty explicit brand, as stored.
    pub fn direct_brand(&self) -> Option<&str> {
        self.brand.as_deref().filter(|b| !b.trim().is_empty())
    }

    /// Every free-text field joined into one searchable blob.
    pub fn searchable_text(&self) -> String {
        let mut parts: Vec<String> = [
            &self.name,
            &self.description,
            &self.supplementary_description,
            &self.notes,
        ]
        .into_iter()
        .flatten()
        .cloned()
        .collect();
        if let Some(category) = &self.category {
            parts.extend(category.name.clone());
            parts.extend(category.path.clone());
        }
        for attribute in &self.attributes {
            parts.push(format!(
                "{}:{}",
                attribute.name,
                attribute.value.as_deref().unwrap_or_default()
            ));
        }
        parts.join(" \n ")
    }
}

fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    crate::erp::client::canonical_id(&value)
        .ok_or_else(|| serde::de::Error::custom("missing product id"))
}

fn de_opt_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(crate::erp::client::canonical_id(&value))
}

#[async_trait]
pub trait ProductSource: Send + Sync {
    async fn fetch_product(&self, id: &str) -> Result<Product, ErpError>;

    /// Rows per full listing page actually served for `requested`.
    fn page_size(&self, requested: usize) -> usize {
        requested
    }

    /// One raw page of the catalog listing; empty means past the end.
    async fn list_products(&self, page: u32, page_size: usize) -> Result<Vec<Value>, ErpError>;
}

pub struct ErpProducts {
    client: ErpClient,
}

impl ErpProducts {
    pub fn new(client: ErpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProductSource for ErpProducts {
    fn page_size(&self, requested: usize) -> usize {
        requested.clamp(1, MAX_PAGE_SIZE)
    }

    async fn fetch_product(&self, id: &str) -> Result<Product, ErpError> {
        let body = self
            .client
            .get_json(&format!("/produtos/{}", encode(id)), NO_QUERY, None)
            .await?;
        let data = body.get("data").cloned().unwrap_or(body);
        serde_json::from_value(data).map_err(|err| ErpError::Malformed(err.to_string()))
    }

    async fn list_products(&self, page: u32, page_size: usize) -> Result<Vec<Value>, ErpError> {
        let body = self
            .client
            .get_json(
                "/produtos",
                &[("pagina", page.to_string()), ("limite", page_size.to_string())],
                None,
            )
            .await?;
        extract_records(&body)
    }
}
