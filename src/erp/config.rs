use once_cell::sync::Lazy;
use std::env;

pub static API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("ERP_API_ROOT")
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://www.bling.com.br/Api/v3".to_string())
});

pub static LEGACY_API_ROOT: Lazy<String> = Lazy::new(|| {
    env::var("ERP_LEGACY_API_ROOT")
        .map(|v| v.trim_end_matches('/').to_string())
        .unwrap_or_else(|_| "https://bling.com.br/Api/v2".to_string())
});

pub const ACCESS_TOKEN_VAR: &str = "ERP_ACCESS_TOKEN";

pub const LEGACY_API_KEY_VAR: &str = "ERP_LEGACY_API_KEY";

pub static SUPPLIER_NAME_PREFIX: Lazy<String> = Lazy::new(|| {
    env::var("SUPPLIER_NAME_PREFIX")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "FORNECEDOR".to_string())
});

/// Person-type code the ERP uses for companies.
pub const JURIDICAL_PERSON_CODE: &str = "J";

/// Per-request read timeout for order retrieval.
pub const ORDER_RETRIEVAL_TIMEOUT_SECS: u64 = 10;

/// Largest `limite` the current API honours on listings.
pub const MAX_PAGE_SIZE: usize = 100;

/// The legacy API always serves this many rows per page.
pub const LEGACY_PAGE_SIZE: usize = 100;
