//! Table naming and identifier quoting shared by the SQL backends.

use crate::error::{AppError, Result};

/// SCD1 table name.
pub const SCD1_TABLE: &str = "documents_scd1";

/// SCD2 table name.
pub const SCD2_TABLE: &str = "documents_scd2";

/// Prefix of raw landing tables.
pub const RAW_PREFIX: &str = "raw_";

/// Whether `input` matches `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_ident(input: &str) -> bool {
    let mut chars = input.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

/// Quotes SQL identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{escaped}\"")
}

/// Raw table name for a dataset family: `raw_<name>`, never double-prefixed.
pub fn raw_table_name(name: &str) -> Result<String> {
    let table = if name.starts_with(RAW_PREFIX) {
        name.to_string()
    } else {
        format!("{RAW_PREFIX}{name}")
    };
    if !is_valid_ident(&table) {
        return Err(AppError::validation(format!(
            "invalid raw table name '{table}'"
        )));
    }
    Ok(table)
}

/// Optionally schema-qualified table reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableName {
    schema: Option<String>,
    table: String,
}

impl TableName {
    /// Builds a validated table identifier.
    pub fn new(schema: Option<&str>, table: impl Into<String>) -> Result<Self> {
        let table = table.into();
        if !is_valid_ident(&table) {
            return Err(AppError::validation(format!("invalid table name '{table}'")));
        }
        if let Some(schema) = schema {
            if !is_valid_ident(schema) {
                return Err(AppError::validation(format!(
                    "invalid schema name '{schema}'"
                )));
            }
        }
        Ok(Self {
            schema: schema.map(str::to_string),
            table,
        })
    }

    /// Quoted reference, schema-qualified when a schema is set.
    pub fn qualified(&self) -> String {
        match &self.schema {
            Some(schema) => format!("{}.{}", quote_ident(schema), quote_ident(&self.table)),
            None => quote_ident(&self.table),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Quoted index name derived from the table name.
    pub fn index_name(&self, suffix: &str) -> String {
        quote_ident(&format!("{}_{suffix}", self.table))
    }
}

/// The three tables one store works with.
#[derive(Debug, Clone)]
pub struct DocumentTables {
    pub scd1: TableName,
    pub scd2: TableName,
    schema: Option<String>,
}

impl DocumentTables {
    pub fn new(schema: Option<&str>) -> Result<Self> {
        Ok(Self {
            scd1: TableName::new(schema, SCD1_TABLE)?,
            scd2: TableName::new(schema, SCD2_TABLE)?,
            schema: schema.map(str::to_string),
        })
    }

    /// Table for raw rows of dataset family `name`.
    pub fn raw(&self, name: &str) -> Result<TableName> {
        TableName::new(self.schema.as_deref(), raw_table_name(name)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_valid_ident() {
        assert!(is_valid_ident("test_external"));
        assert!(is_valid_ident("_x1"));
        assert!(!is_valid_ident(""));
        assert!(!is_valid_ident("1abc"));
        assert!(!is_valid_ident("a-b"));
        assert!(!is_valid_ident("a\"; DROP TABLE x; --"));
    }

    #[test]
    fn test_quote_ident_escapes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_raw_table_name() {
        assert_eq!(raw_table_name("ferc").unwrap(), "raw_ferc");
        assert_eq!(raw_table_name("raw_forms").unwrap(), "raw_forms");
        assert!(raw_table_name("bad name").is_err());
    }

    #[test]
    fn test_qualified_names() {
        let tables = DocumentTables::new(Some("test_external")).unwrap();
        assert_eq!(
            tables.scd2.qualified(),
            "\"test_external\".\"documents_scd2\""
        );
        assert_eq!(
            tables.raw("ferc").unwrap().qualified(),
            "\"test_external\".\"raw_ferc\""
        );

        let local = DocumentTables::new(None).unwrap();
        assert_eq!(local.scd1.qualified(), "\"documents_scd1\"");
        assert_eq!(
            local.scd2.index_name("current_idx"),
            "\"documents_scd2_current_idx\""
        );
    }

    #[test]
    fn test_rejects_bad_schema() {
        assert!(DocumentTables::new(Some("public; --")).is_err());
    }
}
