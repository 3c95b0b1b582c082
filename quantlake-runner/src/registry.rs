//! Model registry and schema catalog.
//!
//! Entities are registered under their category. Selection accepts a
//! category, a model name, both, or `"ALL"` for every registered model.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use quantlake_core::{Entity, EtlError};

/// Wildcard accepted for category and model selection.
pub const ALL: &str = "ALL";

const MISSING: &str = "-";

#[derive(Default)]
pub struct EntityRegistry {
    categories: BTreeMap<String, BTreeMap<String, Arc<dyn Entity>>>,
}

/// One row of the schema catalog: a field of a model and one of its sources.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaCatalogRow {
    pub category_code: String,
    pub model_code: String,
    pub model_name: String,
    pub field_name: String,
    pub field_type: String,
    pub field_description: String,
    pub table_name: String,
    pub table_field: String,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity. Model names are unique across categories since
    /// they key the run records.
    pub fn register(&mut self, entity: Arc<dyn Entity>) -> Result<(), EtlError> {
        let name = entity.name().to_string();
        if name.is_empty() || name == ALL {
            return Err(EtlError::Config(format!("invalid model name '{name}'")));
        }
        if let Some(existing) = self.get(&name) {
            return Err(EtlError::Config(format!(
                "model '{name}' already registered in category '{}'",
                existing.category()
            )));
        }
        self.categories
            .entry(entity.category().to_string())
            .or_default()
            .insert(name, entity);
        Ok(())
    }

    pub fn get(&self, model: &str) -> Option<Arc<dyn Entity>> {
        self.categories
            .values()
            .find_map(|models| models.get(model).cloned())
    }

    pub fn len(&self) -> usize {
        self.categories.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn categories(&self) -> Vec<&str> {
        self.categories.keys().map(String::as_str).collect()
    }

    /// Every entity, ordered by category then model name.
    pub fn entities(&self) -> Vec<Arc<dyn Entity>> {
        self.categories
            .values()
            .flat_map(|models| models.values().cloned())
            .collect()
    }

    /// Select entities. `None` or `"ALL"` matches anything.
    ///
    /// An empty selection is [`EtlError::UnknownModel`].
    pub fn select(
        &self,
        category: Option<&str>,
        model: Option<&str>,
    ) -> Result<Vec<Arc<dyn Entity>>, EtlError> {
        let category = category.filter(|c| *c != ALL);
        let model = model.filter(|m| *m != ALL);

        let selected: Vec<Arc<dyn Entity>> = self
            .categories
            .iter()
            .filter(|(name, _)| category.is_none_or(|c| c == name.as_str()))
            .flat_map(|(_, models)| models.iter())
            .filter(|(name, _)| model.is_none_or(|m| m == name.as_str()))
            .map(|(_, entity)| entity.clone())
            .collect();

        if selected.is_empty() {
            return Err(EtlError::UnknownModel {
                category: category.map(str::to_string),
                model: model.map(str::to_string),
            });
        }
        Ok(selected)
    }

    /// Field-level catalog of every registered model.
    ///
    /// A field with several sources yields one row per source; a field
    /// without sources yields one row with `-` for the table columns.
    pub fn schema_catalog(&self) -> Vec<SchemaCatalogRow> {
        let mut rows = Vec::new();
        for entity in self.entities() {
            for field in entity.schema().fields() {
                let base = SchemaCatalogRow {
                    category_code: entity.category().to_string(),
                    model_code: entity.name().to_string(),
                    model_name: or_missing(entity.description()),
                    field_name: field.name.clone(),
                    field_type: field.semantic_type.to_string(),
                    field_description: or_missing(&field.description),
                    table_name: MISSING.to_string(),
                    table_field: MISSING.to_string(),
                };
                if field.sources.is_empty() {
                    rows.push(base);
                    continue;
                }
                for source in &field.sources {
                    rows.push(SchemaCatalogRow {
                        table_name: or_missing(&source.table),
                        table_field: or_missing(&source.column),
                        ..base.clone()
                    });
                }
            }
        }
        // Stable: fields keep their declared order within a table.
        rows.sort_by(|a, b| {
            (&a.category_code, &a.model_code, &a.table_name)
                .cmp(&(&b.category_code, &b.model_code, &b.table_name))
        });
        rows
    }

    /// Write the schema catalog as CSV. Returns the number of rows written.
    pub fn export_schema_csv(&self, path: &Path) -> Result<usize, EtlError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| EtlError::Save(format!("create {}: {e}", parent.display())))?;
        }
        let rows = self.schema_catalog();
        let mut writer = csv::Writer::from_path(path)
            .map_err(|e| EtlError::Save(format!("open {}: {e}", path.display())))?;
        for row in &rows {
            writer
                .serialize(row)
                .map_err(|e| EtlError::Save(format!("write schema row: {e}")))?;
        }
        writer
            .flush()
            .map_err(|e| EtlError::Save(format!("flush {}: {e}", path.display())))?;
        Ok(rows.len())
    }
}

fn or_missing(value: &str) -> String {
    if value.is_empty() {
        MISSING.to_string()
    } else {
        value.to_string()
    }
}
