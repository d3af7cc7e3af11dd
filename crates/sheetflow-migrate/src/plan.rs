//! Migration plans
//!
//! A plan is the user-facing JSON document that names the sheets to
//! migrate, where their rows go, and how each column is typed and
//! validated. Plans compile into the core schema descriptors and
//! validation chains.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use sheetflow_common::{Result, SheetflowError};
use sheetflow_core::{
    ColumnBinding, EnumMembership, FieldType, NumericRange, PatternRule, RecordDescriptor,
    RecordSchema, RequiredFields, ValidationChain,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationPlan {
    pub sheets: Vec<SheetPlan>,
}

impl MigrationPlan {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading migration plan {}", path.display()))?;
        let plan: MigrationPlan = serde_json::from_str(&text)
            .with_context(|| format!("parsing migration plan {}", path.display()))?;
        if plan.sheets.is_empty() {
            anyhow::bail!("migration plan {} declares no sheets", path.display());
        }
        Ok(plan)
    }

    pub fn sheet_names(&self) -> Vec<String> {
        self.sheets.iter().map(|s| s.sheet.clone()).collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SheetPlan {
    /// Sheet name as it appears in the workbook
    pub sheet: String,
    /// Destination table or collection in the master store
    pub target_table: String,
    /// Fields whose value combination must be unique across the sheet
    #[serde(default)]
    pub unique_fields: Vec<String>,
    pub columns: Vec<ColumnSpec>,
}

impl SheetPlan {
    /// Compile the column specs into a descriptor for dynamic records.
    pub fn descriptor(&self) -> Result<Arc<RecordDescriptor>> {
        let mut bindings = Vec::with_capacity(self.columns.len());
        for spec in &self.columns {
            bindings.push(spec.binding()?);
        }
        Ok(Arc::new(RecordDescriptor::compile(RecordSchema::new(
            bindings,
        ))))
    }

    /// Build the validation chain declared by the column specs.
    pub fn validation_chain(&self) -> Result<ValidationChain> {
        let mut chain = ValidationChain::new();

        let required: Vec<String> = self
            .columns
            .iter()
            .filter(|c| c.required)
            .map(|c| c.field.clone())
            .collect();
        if !required.is_empty() {
            chain = chain.with_rule(RequiredFields::new(required));
        }

        for spec in &self.columns {
            if let Some(pattern) = &spec.pattern {
                chain = chain.with_rule(PatternRule::new(spec.field.as_str(), pattern)?);
            }
            if let Some(allowed) = &spec.allowed {
                chain = chain.with_rule(EnumMembership::new(spec.field.as_str(), allowed.clone()));
            }
            if spec.min.is_some() || spec.max.is_some() {
                chain = chain.with_rule(NumericRange::new(spec.field.as_str(), spec.min, spec.max));
            }
        }
        Ok(chain)
    }

    /// Per-field value substitution maps declared by the columns.
    pub fn code_maps(&self) -> Vec<(&str, &HashMap<String, String>)> {
        self.columns
            .iter()
            .filter_map(|c| c.map.as_ref().map(|m| (c.field.as_str(), m)))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub field: String,
    /// Header name; mutually exclusive with `position`
    #[serde(default)]
    pub column: Option<String>,
    /// 0-based column index for headerless sheets
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub format: Option<String>,
    /// Value substitutions applied before validation ("Y" -> "yes")
    #[serde(default)]
    pub map: Option<HashMap<String, String>>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub allowed: Option<Vec<String>>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl ColumnSpec {
    fn binding(&self) -> Result<ColumnBinding> {
        let mut binding = match (&self.column, self.position) {
            (Some(column), _) => ColumnBinding::new(self.field.as_str(), column.as_str(), self.field_type),
            (None, Some(position)) => {
                ColumnBinding::at_position(self.field.as_str(), position, self.field_type)
            },
            (None, None) => {
                return Err(SheetflowError::Config(format!(
                    "field '{}' needs a column name or a position",
                    self.field
                )))
            },
        };
        if self.required {
            binding = binding.required();
        }
        if let Some(len) = self.max_length {
            binding = binding.with_max_length(len);
        }
        if let Some(format) = &self.format {
            binding = binding.with_format(format.as_str());
        }
        Ok(binding)
    }
}
