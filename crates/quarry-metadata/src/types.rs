use std::fmt;

use quarry_cache::CacheError;
use serde::{Deserialize, Serialize};

/// A source handle, e.g. `@sales`.
///
/// Handles are the user-facing identity of a data source. A well-formed
/// handle starts with `@`, followed by a letter, followed by any number of
/// letters, digits, or underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceHandle(String);

impl SourceHandle {
    /// Wraps `handle` without validating it; see
    /// [`validate`](SourceHandle::validate).
    pub fn new(handle: impl Into<String>) -> Self {
        SourceHandle(handle.into())
    }

    /// The handle text, including the leading `@`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Checks that the handle is well-formed, returning
    /// [`CacheError::InvalidInput`] otherwise.
    pub fn validate(&self) -> Result<(), CacheError> {
        let Some(rest) = self.0.strip_prefix('@') else {
            return Err(CacheError::InvalidInput(format!(
                "handle {:?} must start with '@'",
                self.0
            )));
        };

        let mut chars = rest.chars();
        let legal = match chars.next() {
            Some(first) => {
                first.is_ascii_alphabetic()
                    && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            None => false,
        };

        if legal {
            Ok(())
        } else {
            Err(CacheError::InvalidInput(format!(
                "malformed handle: {:?}",
                self.0
            )))
        }
    }
}

impl fmt::Display for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SourceHandle {
    fn from(handle: &str) -> Self {
        SourceHandle::new(handle)
    }
}

/// Identifies a table within a source, e.g. `@sales.invoice`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    /// The owning source.
    pub handle: SourceHandle,
    /// The table name within the source.
    pub table: String,
}

impl TableRef {
    /// Creates a table reference. Neither part is validated here; see
    /// [`validate`](TableRef::validate).
    pub fn new(handle: impl Into<SourceHandle>, table: impl Into<String>) -> Self {
        TableRef {
            handle: handle.into(),
            table: table.into(),
        }
    }

    /// Checks that both the handle and the table name are well-formed,
    /// returning [`CacheError::InvalidInput`] otherwise.
    pub fn validate(&self) -> Result<(), CacheError> {
        self.handle.validate()?;
        if self.table.is_empty() || self.table.chars().any(|c| c.is_control()) {
            return Err(CacheError::InvalidInput(format!(
                "malformed table name: {:?}",
                self.table
            )));
        }
        Ok(())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.handle, self.table)
    }
}

/// Metadata for a single column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMetadata {
    /// Column name.
    pub name: String,
    /// One-based ordinal position within the table.
    pub position: i64,
    /// Whether the column participates in the primary key.
    pub primary_key: bool,
    /// The driver-native type, e.g. `VARCHAR(255)`.
    pub column_type: String,
    /// Whether the column admits NULL.
    pub nullable: bool,
}

/// Metadata for a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Table name.
    pub name: String,
    /// Table type, e.g. `table` or `view`.
    pub table_type: String,
    /// Number of rows, as reported by the source.
    pub row_count: i64,
    /// Size in bytes, where the source reports one.
    pub size: Option<i64>,
    /// Column metadata, in ordinal order.
    pub columns: Vec<ColumnMetadata>,
}

/// Metadata for an entire source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceMetadata {
    /// The source's handle.
    pub handle: SourceHandle,
    /// The source's name, e.g. the database or file name.
    pub name: String,
    /// The driver type backing the source, e.g. `postgres` or `csv`.
    pub driver: String,
    /// The active schema, where the driver has one.
    pub schema: String,
    /// Metadata for each table in the source.
    pub tables: Vec<TableMetadata>,
}

impl SourceMetadata {
    /// The names of all tables in the source, in the source's order.
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Looks up the metadata for the named table.
    pub fn table(&self, name: &str) -> Option<&TableMetadata> {
        self.tables.iter().find(|t| t.name == name)
    }
}
