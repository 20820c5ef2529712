pub mod auth;
pub mod client;
pub mod config;
pub mod orders;
pub mod products;
pub mod suppliers;

#[cfg(test)]
pub use auth::StaticCredentials;
pub use auth::{CredentialProvider, EnvCredentials, StoredCredentials};
pub use client::{AuthStyle, ErpClient, ErpError};
pub use orders::{ErpPurchaseOrders, ErpSaleOrders, LineItem, SaleOrder, SaleOrderSource};
pub use products::{ErpProducts, Product, ProductSource};
pub use suppliers::{ContactsV2, ContactsV3, SupplierFilters, SupplierSource};
