//! Table schemas and record defaulting.
//!
//! A [`TableSchema`] lists the columns a table keeps. Writes are projected
//! onto the schema before they are stored: undeclared fields are dropped and
//! missing or null columns receive their default.

use crate::error::{CoreError, CoreResult};
use crate::types::EntityId;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tidesync_codec::{Record, Value};

/// Default applied to a column the incoming record leaves missing or null.
#[derive(Clone)]
pub enum ColumnDefault {
    /// A constant value.
    Value(Value),
    /// A function evaluated once per write (ids, timestamps, ...).
    Fn(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl ColumnDefault {
    /// Produces the default value.
    #[must_use]
    pub fn produce(&self) -> Value {
        match self {
            Self::Value(v) => v.clone(),
            Self::Fn(f) => f(),
        }
    }
}

impl fmt::Debug for ColumnDefault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
            Self::Fn(_) => f.write_str("Fn(..)"),
        }
    }
}

/// Descriptor of one column.
#[derive(Debug, Clone)]
pub struct ColumnDef {
    /// Column name.
    pub name: String,
    /// Default for missing or null values.
    pub default: Option<ColumnDefault>,
    /// Whether this column holds the primary key.
    pub primary: bool,
    /// Whether a secondary index is maintained for this column.
    pub indexed: bool,
}

impl ColumnDef {
    /// Creates a plain column with no default and no index.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            primary: false,
            indexed: false,
        }
    }

    /// Marks the column as the primary key.
    #[must_use]
    pub fn primary(mut self) -> Self {
        self.primary = true;
        self
    }

    /// Maintains a secondary index on the column.
    #[must_use]
    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    /// Sets a constant default.
    #[must_use]
    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(ColumnDefault::Value(value.into()));
        self
    }

    /// Sets a default computed on every write.
    #[must_use]
    pub fn default_with<F>(mut self, f: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.default = Some(ColumnDefault::Fn(Arc::new(f)));
        self
    }
}

/// Declaration of one table.
#[derive(Debug, Clone)]
pub struct TableSchema {
    /// Table name.
    pub name: String,
    /// Columns in declaration order.
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    /// Creates a table with no columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
        }
    }

    /// Appends a column.
    #[must_use]
    pub fn column(mut self, column: ColumnDef) -> Self {
        self.columns.push(column);
        self
    }

    /// Returns the primary column, if exactly one is declared.
    pub fn primary_column(&self) -> Option<&ColumnDef> {
        let mut primaries = self.columns.iter().filter(|c| c.primary);
        match (primaries.next(), primaries.next()) {
            (Some(column), None) => Some(column),
            _ => None,
        }
    }

    /// Names of the secondary-indexed columns, excluding the primary.
    pub fn indexed_columns(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.indexed && !c.primary)
            .map(|c| c.name.as_str())
    }

    /// Checks the declaration is usable.
    ///
    /// # Errors
    ///
    /// Returns `InvalidSchema` for an empty table name, empty or duplicate
    /// column names, and anything other than exactly one primary column.
    pub fn validate(&self) -> CoreResult<()> {
        if self.name.is_empty() {
            return Err(CoreError::invalid_schema("table name must not be empty"));
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.name.is_empty() {
                return Err(CoreError::invalid_schema(format!(
                    "table {} has a column with an empty name",
                    self.name
                )));
            }
            if !seen.insert(column.name.as_str()) {
                return Err(CoreError::invalid_schema(format!(
                    "table {} declares column {} twice",
                    self.name, column.name
                )));
            }
        }

        match self.columns.iter().filter(|c| c.primary).count() {
            1 => Ok(()),
            0 => Err(CoreError::invalid_schema(format!(
                "table {} has no primary column",
                self.name
            ))),
            n => Err(CoreError::invalid_schema(format!(
                "table {} has {n} primary columns",
                self.name
            ))),
        }
    }

    /// Projects a record onto this schema.
    ///
    /// Every declared column keeps its incoming value when present and not
    /// null; otherwise it takes the column default, or null when there is
    /// none. Undeclared fields are dropped.
    #[must_use]
    pub fn apply_defaults(&self, mut record: Record) -> Record {
        let mut projected = Record::new();
        for column in &self.columns {
            let value = match record.remove(&column.name) {
                Some(v) if !v.is_null() => v,
                _ => column
                    .default
                    .as_ref()
                    .map_or(Value::Null, ColumnDefault::produce),
            };
            projected.insert(column.name.clone(), value);
        }
        projected
    }

    /// Reads the primary key of a (defaulted) record.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPrimaryKey` if the primary value is missing or not a
    /// valid id, and `InvalidSchema` if the schema has no single primary.
    pub fn extract_id(&self, record: &Record) -> CoreResult<EntityId> {
        let primary = self.primary_column().ok_or_else(|| {
            CoreError::invalid_schema(format!("table {} has no single primary column", self.name))
        })?;
        let value = record.get(&primary.name).unwrap_or(&Value::Null);
        EntityId::from_value(&self.name, value)
    }
}

/// Validates a whole schema set.
///
/// # Errors
///
/// Returns `InvalidSchema` if any table is invalid or a table name is
/// declared twice.
pub fn validate_schemas(schemas: &[TableSchema]) -> CoreResult<()> {
    let mut names = HashSet::new();
    for schema in schemas {
        schema.validate()?;
        if !names.insert(schema.name.as_str()) {
            return Err(CoreError::invalid_schema(format!(
                "table {} is declared twice",
                schema.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use tidesync_codec::record;

    fn tasks() -> TableSchema {
        TableSchema::new("tasks")
            .column(ColumnDef::new("id").primary())
            .column(ColumnDef::new("title"))
            .column(ColumnDef::new("done").default_value(false))
            .column(ColumnDef::new("project").indexed())
    }

    #[test]
    fn defaults_fill_missing_and_null() {
        let out = tasks().apply_defaults(record! {
            "id" => "t1",
            "done" => Value::Null,
            "stray" => 5,
        });

        assert_eq!(
            out,
            record! {
                "id" => "t1",
                "title" => Value::Null,
                "done" => false,
                "project" => Value::Null,
            }
        );
    }

    #[test]
    fn incoming_values_win_over_defaults() {
        let out = tasks().apply_defaults(record! { "id" => "t1", "done" => true });
        assert_eq!(out["done"], Value::Bool(true));
    }

    #[test]
    fn default_fn_runs_per_write() {
        let counter = Arc::new(AtomicI64::new(0));
        let c = Arc::clone(&counter);
        let schema = TableSchema::new("notes").column(
            ColumnDef::new("id")
                .primary()
                .default_with(move || Value::Integer(c.fetch_add(1, Ordering::SeqCst) + 1)),
        );

        let a = schema.apply_defaults(Record::new());
        let b = schema.apply_defaults(Record::new());
        assert_eq!(schema.extract_id(&a).unwrap(), EntityId::Number(1));
        assert_eq!(schema.extract_id(&b).unwrap(), EntityId::Number(2));
        // An explicit key leaves the generator alone.
        schema.apply_defaults(record! { "id" => 40_i64 });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn extract_id_requires_key() {
        let out = tasks().apply_defaults(record! { "title" => "no id" });
        assert!(matches!(
            tasks().extract_id(&out),
            Err(CoreError::InvalidPrimaryKey { .. })
        ));
    }

    #[test]
    fn indexed_columns_skip_primary() {
        let schema = TableSchema::new("t")
            .column(ColumnDef::new("id").primary().indexed())
            .column(ColumnDef::new("a").indexed());
        assert_eq!(schema.indexed_columns().collect::<Vec<_>>(), vec!["a"]);
    }

    #[test]
    fn validation_rules() {
        assert!(tasks().validate().is_ok());

        let none = TableSchema::new("t").column(ColumnDef::new("a"));
        assert!(none.validate().is_err());

        let two = TableSchema::new("t")
            .column(ColumnDef::new("a").primary())
            .column(ColumnDef::new("b").primary());
        assert!(two.validate().is_err());

        let dup = TableSchema::new("t")
            .column(ColumnDef::new("a").primary())
            .column(ColumnDef::new("a"));
        assert!(dup.validate().is_err());

        let empty = TableSchema::new("t").column(ColumnDef::new("").primary());
        assert!(empty.validate().is_err());

        assert!(validate_schemas(&[tasks(), tasks()]).is_err());
        assert!(validate_schemas(&[tasks()]).is_ok());
    }
}
