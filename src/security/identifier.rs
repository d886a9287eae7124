//! Table and column identifier sanitizer.
//!
//! Identifiers are the only user input ever embedded into SQL text, so every
//! table or column name passes through here before a statement is built.

use crate::config::SecurityConfig;
use crate::error::{ValidationCode, ValidationError, ValidationResult};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;

/// Longest identifier PostgreSQL keeps without truncation.
pub const MAX_IDENTIFIER_LENGTH: usize = 63;

static IDENTIFIER_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("Invalid regex: identifier pattern")
});

static TABLE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("Invalid regex: table pattern")
});

/// Validates identifiers against the grammar and the configured allow/block lists.
#[derive(Debug, Clone)]
pub struct IdentifierSanitizer {
    allow_list: HashSet<String>,
    block_list: Vec<String>,
}

impl Default for IdentifierSanitizer {
    fn default() -> Self {
        Self::from_config(&SecurityConfig::default())
    }
}

impl IdentifierSanitizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            allow_list: HashSet::new(),
            block_list: Vec::new(),
        }
        .allow_list(config.table_allow_list.clone())
        .block_list(config.table_block_list.clone())
    }

    /// Restrict tables to this set. An empty list allows every valid table.
    pub fn allow_list(mut self, tables: Vec<String>) -> Self {
        self.allow_list = tables.into_iter().map(|t| t.to_lowercase()).collect();
        self
    }

    pub fn block_list(mut self, prefixes: Vec<String>) -> Self {
        self.block_list = prefixes.into_iter().map(|p| p.to_lowercase()).collect();
        self
    }

    /// Validate a table name and return it quoted for embedding as an identifier.
    pub fn sanitize_table(&self, name: &str) -> ValidationResult<String> {
        self.check_table(name)?;
        Ok(name.split('.').map(quote_identifier).collect::<Vec<_>>().join("."))
    }

    /// Apply the table rules without producing a quoted form.
    pub fn check_table(&self, name: &str) -> ValidationResult<()> {
        let name = name.trim();
        if name.is_empty()
            || !TABLE_REGEX.is_match(name)
            || name.split('.').any(|s| s.len() > MAX_IDENTIFIER_LENGTH)
        {
            return Err(ValidationError::new(
                ValidationCode::InvalidTableName,
                format!("Invalid table name: '{}'", truncate(name)),
            ));
        }

        let lower = name.to_lowercase();
        if let Some(prefix) = self.blocked_prefix(&lower, true) {
            return Err(ValidationError::new(
                ValidationCode::TableBlocked,
                format!("Access to table '{}' is blocked ({}*)", name, prefix),
            ));
        }

        if !self.allow_list.is_empty() {
            let unqualified = lower.rsplit('.').next().unwrap_or(&lower);
            if !self.allow_list.contains(&lower) && !self.allow_list.contains(unqualified) {
                return Err(ValidationError::new(
                    ValidationCode::TableNotAllowed,
                    format!("Table '{}' is not in the allowed list", name),
                ));
            }
        }

        Ok(())
    }

    /// Validate one column name and return it quoted.
    pub fn sanitize_column(&self, name: &str) -> ValidationResult<String> {
        let name = name.trim();
        if name.is_empty() || !IDENTIFIER_REGEX.is_match(name) || name.len() > MAX_IDENTIFIER_LENGTH {
            return Err(ValidationError::new(
                ValidationCode::InvalidColumnName,
                format!("Invalid column name: '{}'", truncate(name)),
            ));
        }
        if let Some(prefix) = self.blocked_prefix(&name.to_lowercase(), false) {
            return Err(ValidationError::new(
                ValidationCode::ColumnBlocked,
                format!("Column '{}' is blocked ({}*)", name, prefix),
            ));
        }
        Ok(quote_identifier(name))
    }

    /// Validate a column list. `*` is accepted only as the whole list; an
    /// empty list means every column.
    pub fn sanitize_columns<S: AsRef<str>>(&self, names: &[S]) -> ValidationResult<Vec<String>> {
        if names.is_empty() {
            return Ok(vec!["*".to_string()]);
        }
        if names.iter().any(|n| n.as_ref().trim() == "*") {
            if names.len() == 1 {
                return Ok(vec!["*".to_string()]);
            }
            return Err(ValidationError::new(
                ValidationCode::InvalidColumnName,
                "Wildcard '*' cannot be combined with other columns",
            ));
        }
        names.iter().map(|n| self.sanitize_column(n.as_ref())).collect()
    }

    fn blocked_prefix(&self, lower: &str, dotted: bool) -> Option<&str> {
        self.block_list
            .iter()
            .find(|prefix| {
                lower.starts_with(prefix.as_str())
                    || (dotted && lower.split('.').any(|segment| segment.starts_with(prefix.as_str())))
            })
            .map(String::as_str)
    }
}

/// Double-quote an identifier, doubling embedded quotes.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn truncate(s: &str) -> &str {
    match s.char_indices().nth(64) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
