//! Catalogue store: the relational + spatial record of every known system.

pub mod memory;
pub mod postgres;
pub mod sqlite;
pub mod traits;

pub use memory::MemoryCatalogue;
pub use postgres::PostgresCatalogue;
pub use sqlite::SqliteCatalogue;
pub use traits::{CatalogueStore, ListQuery, MergeOutcome, StaleScope, SystemFilter};

use crate::{Error, Result};
use std::sync::Arc;

/// Open a store from a `postgres://` or `sqlite://` URL, applying the schema.
#[tracing::instrument(level = "info", skip(url))]
pub async fn connect(url: &str) -> Result<Arc<dyn CatalogueStore>> {
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        let store = PostgresCatalogue::connect(url, 5).await?;
        store.migrate().await?;
        return Ok(Arc::new(store));
    }
    if url.starts_with("sqlite:") {
        return Ok(Arc::new(SqliteCatalogue::connect(url).await?));
    }
    Err(Error::Config(format!(
        "unsupported database url scheme (expected postgres:// or sqlite://): {url}"
    )))
}
