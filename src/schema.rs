//! Interface to the schema resolver that owns remote-column → local-column
//! mappings.
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;

use crate::persistence::LocalStore;
use crate::types::{ColumnResolution, ResolveAction};

/// Resolves remote columns to local columns, possibly altering the local
/// schema, and answers sheet/table lookups.
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    /// Resolve the column at `col_index` of `sheet`, whose header currently
    /// reads `header`. `sample_value` is the incoming cell value, usable for
    /// type inference.
    async fn resolve_column(
        &self,
        sheet: &str,
        col_index: u32,
        header: &str,
        sample_value: &serde_json::Value,
    ) -> Result<ColumnResolution>;

    fn table_for_sheet(&self, sheet: &str) -> Result<Option<String>>;

    fn sheet_for_table(&self, table: &str) -> Result<Option<String>>;

    /// Remote column index a local column is replayed to.
    fn column_index(&self, table: &str, column: &str) -> Result<Option<u32>>;
}

/// Read-only resolver over the registries kept in the local store.
///
/// Only columns that are already registered resolve; creating or renaming
/// columns is left to a richer resolver.
pub struct RegistryResolver {
    store: Arc<LocalStore>,
}

impl RegistryResolver {
    pub fn new(store: Arc<LocalStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SchemaResolver for RegistryResolver {
    async fn resolve_column(
        &self,
        sheet: &str,
        col_index: u32,
        header: &str,
        _sample_value: &serde_json::Value,
    ) -> Result<ColumnResolution> {
        let mapping = self.store.column_mapping(sheet, col_index)?.ok_or_else(|| {
            anyhow!(
                "No column registered for {} column {} ('{}')",
                sheet,
                col_index,
                header
            )
        })?;
        Ok(ColumnResolution {
            action: ResolveAction::Matched,
            mapping,
        })
    }

    fn table_for_sheet(&self, sheet: &str) -> Result<Option<String>> {
        self.store.table_for_sheet(sheet)
    }

    fn sheet_for_table(&self, table: &str) -> Result<Option<String>> {
        self.store.sheet_for_table(table)
    }

    fn column_index(&self, table: &str, column: &str) -> Result<Option<u32>> {
        self.store.column_index(table, column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ColumnMapping, DataType};
    use serde_json::json;

    #[tokio::test]
    async fn registered_columns_match() {
        let store = Arc::new(LocalStore::open_in_memory().expect("store"));
        store.register_sheet("Orders", "orders").unwrap();
        store
            .register_column(
                "Orders",
                2,
                "Amount",
                &ColumnMapping {
                    local_column: "amount".to_string(),
                    data_type: DataType::Real,
                },
            )
            .unwrap();
        let resolver = RegistryResolver::new(store);

        let resolution = resolver
            .resolve_column("Orders", 2, "Amount", &json!("1.5"))
            .await
            .unwrap();
        assert_eq!(resolution.action, ResolveAction::Matched);
        assert_eq!(resolution.mapping.local_column, "amount");
        assert_eq!(resolver.table_for_sheet("Orders").unwrap().as_deref(), Some("orders"));
        assert_eq!(resolver.column_index("orders", "amount").unwrap(), Some(2));
    }

    #[tokio::test]
    async fn unknown_columns_fail() {
        let store = Arc::new(LocalStore::open_in_memory().expect("store"));
        let resolver = RegistryResolver::new(store);

        let err = resolver
            .resolve_column("Orders", 9, "Notes", &json!(null))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Notes"));
    }
}
