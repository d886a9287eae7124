//! SQL query policy validator.
//!
//! Checks statement text and bind parameters against length limits, a fixed
//! set of destructive/reconnaissance patterns and the table allow/block lists.
//!
//! This is pattern matching, not parsing. Obfuscated or dynamically built SQL
//! can slip past the table scan; it is one layer of defense and does not
//! replace least-privilege database credentials.

use crate::config::SecurityConfig;
use crate::database::SqlValue;
use crate::error::{ValidationCode, ValidationError, ValidationResult};
use crate::security::identifier::IdentifierSanitizer;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

/// Strict-mode rules, checked in order. The first match decides the verdict.
static STRICT_PATTERNS: Lazy<Vec<(Regex, ValidationCode, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"(?i);\s*(DROP|TRUNCATE|ALTER|CREATE|GRANT|REVOKE|COPY)\b")
                .expect("Invalid regex: chained DDL pattern"),
            ValidationCode::DangerousQuery,
            "Chained destructive statement detected",
        ),
        (
            Regex::new(r"(?i);\s*(SELECT|INSERT|UPDATE|DELETE|WITH|MERGE|CALL|DO|EXECUTE|SET)\b")
                .expect("Invalid regex: multi-statement pattern"),
            ValidationCode::MultipleStatements,
            "Multiple statements are not allowed",
        ),
        (
            Regex::new(r"(?m)--[^\n]*$").expect("Invalid regex: line comment pattern"),
            ValidationCode::LineComment,
            "SQL line comments are not allowed",
        ),
        (
            Regex::new(r"(?s)/\*.*?\*/").expect("Invalid regex: block comment pattern"),
            ValidationCode::BlockComment,
            "SQL block comments are not allowed",
        ),
        (
            Regex::new(
                r"(?i)\b(pg_read_file|pg_read_binary_file|pg_ls_dir|pg_stat_file|pg_file_write|lo_import|lo_export)\s*\(",
            )
            .expect("Invalid regex: file function pattern"),
            ValidationCode::FileAccess,
            "File-system functions are not allowed",
        ),
        (
            Regex::new(r"(?i)\bCOPY\b[\s\S]*\b(FROM|TO)\s+(PROGRAM|STDIN|STDOUT|')")
                .expect("Invalid regex: COPY file pattern"),
            ValidationCode::CopyFileAccess,
            "COPY to or from files and programs is not allowed",
        ),
        (
            Regex::new(
                r"(?i)\b(pg_catalog|information_schema|pg_shadow|pg_authid|pg_user|pg_roles|pg_stat_activity|pg_settings|pg_tables|pg_class|pg_namespace|pg_proc)\b",
            )
            .expect("Invalid regex: catalog pattern"),
            ValidationCode::SystemTableAccess,
            "Access to system catalogs is not allowed",
        ),
    ]
});

static DELETE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bDELETE\b").expect("Invalid regex: DELETE pattern"));

static WHERE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bWHERE\b").expect("Invalid regex: WHERE pattern"));

/// Best-effort scan of referenced tables.
static TABLE_REFERENCE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(?:FROM|INTO|UPDATE|JOIN)\s+("?[A-Za-z_][A-Za-z0-9_]*"?(?:\s*\.\s*"?[A-Za-z_][A-Za-z0-9_]*"?)?)"#,
    )
    .expect("Invalid regex: table reference pattern")
});

/// Outcome of validating one statement. Pure data; no shared state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationVerdict {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<ValidationCode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationVerdict {
    pub fn valid() -> Self {
        Self {
            valid: true,
            error_code: None,
            message: None,
        }
    }

    pub fn invalid(code: ValidationCode, message: impl Into<String>) -> Self {
        Self {
            valid: false,
            error_code: Some(code),
            message: Some(message.into()),
        }
    }

    pub fn into_result(self) -> ValidationResult<()> {
        match self.error_code {
            Some(code) if !self.valid => Err(ValidationError::new(
                code,
                self.message.unwrap_or_else(|| "Query rejected".into()),
            )),
            _ => Ok(()),
        }
    }
}

impl From<ValidationError> for ValidationVerdict {
    fn from(err: ValidationError) -> Self {
        Self::invalid(err.code, err.message)
    }
}

/// SQL query validator.
#[derive(Debug, Clone)]
pub struct SqlValidator {
    max_query_length: usize,
    max_params: usize,
    max_param_length: usize,
    strict_mode: bool,
    identifiers: IdentifierSanitizer,
}

impl Default for SqlValidator {
    fn default() -> Self {
        Self::from_config(&SecurityConfig::default())
    }
}

impl SqlValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SecurityConfig) -> Self {
        Self {
            max_query_length: config.max_query_length,
            max_params: config.max_params,
            max_param_length: config.max_param_length,
            strict_mode: config.strict_mode,
            identifiers: IdentifierSanitizer::from_config(config),
        }
    }

    pub fn max_query_length(mut self, length: usize) -> Self {
        self.max_query_length = length;
        self
    }

    pub fn max_params(mut self, count: usize) -> Self {
        self.max_params = count;
        self
    }

    pub fn max_param_length(mut self, length: usize) -> Self {
        self.max_param_length = length;
        self
    }

    pub fn strict_mode(mut self, strict: bool) -> Self {
        self.strict_mode = strict;
        self
    }

    pub fn identifiers(mut self, identifiers: IdentifierSanitizer) -> Self {
        self.identifiers = identifiers;
        self
    }

    /// Validate a statement and its parameters.
    pub fn validate(&self, sql: &str, params: &[SqlValue]) -> ValidationVerdict {
        match self.check(sql, params) {
            Ok(()) => ValidationVerdict::valid(),
            Err(err) => {
                warn!(code = err.code.as_str(), "Query rejected: {}", err.message);
                err.into()
            }
        }
    }

    /// Same rules as [`validate`](Self::validate), as a `Result`.
    pub fn check(&self, sql: &str, params: &[SqlValue]) -> ValidationResult<()> {
        debug!("Validating query: {}", preview(sql));

        self.check_length(sql)?;
        self.check_params(params)?;

        if self.strict_mode {
            self.check_patterns(sql)?;
        }

        self.check_tables(sql)?;

        debug!("Query validation passed");
        Ok(())
    }

    /// Check statement length.
    fn check_length(&self, sql: &str) -> ValidationResult<()> {
        if sql.trim().is_empty() {
            return Err(ValidationError::new(
                ValidationCode::MissingSql,
                "SQL query is required",
            ));
        }
        if sql.chars().count() > self.max_query_length {
            return Err(ValidationError::new(
                ValidationCode::QueryTooLong,
                format!(
                    "Query exceeds maximum length of {} characters",
                    self.max_query_length
                ),
            ));
        }
        Ok(())
    }

    fn check_params(&self, params: &[SqlValue]) -> ValidationResult<()> {
        if params.len() > self.max_params {
            return Err(ValidationError::new(
                ValidationCode::TooManyParams,
                format!("Too many parameters (maximum {})", self.max_params),
            ));
        }
        for (i, param) in params.iter().enumerate() {
            let too_long = match param {
                SqlValue::Text(s) => s.chars().count() > self.max_param_length,
                _ => false,
            };
            if too_long {
                return Err(ValidationError::new(
                    ValidationCode::ParamTooLong,
                    format!(
                        "Parameter ${} exceeds maximum length of {} characters",
                        i + 1,
                        self.max_param_length
                    ),
                ));
            }
        }
        Ok(())
    }

    /// Check strict-mode patterns.
    fn check_patterns(&self, sql: &str) -> ValidationResult<()> {
        for (pattern, code, message) in STRICT_PATTERNS.iter() {
            if pattern.is_match(sql) {
                return Err(ValidationError::new(*code, *message));
            }
        }

        if DELETE_REGEX.is_match(sql) && !WHERE_REGEX.is_match(sql) {
            return Err(ValidationError::new(
                ValidationCode::UnsafeDelete,
                "DELETE without a WHERE clause is not allowed",
            ));
        }

        Ok(())
    }

    /// Apply the identifier rules to every table the scan can find.
    fn check_tables(&self, sql: &str) -> ValidationResult<()> {
        for table in referenced_tables(sql) {
            self.identifiers.check_table(&table)?;
        }
        Ok(())
    }
}

/// Tables named after `FROM`, `INTO`, `UPDATE` or `JOIN`, unquoted.
pub fn referenced_tables(sql: &str) -> Vec<String> {
    TABLE_REFERENCE_REGEX
        .captures_iter(sql)
        .filter_map(|caps| caps.get(1))
        .map(|m| {
            m.as_str()
                .chars()
                .filter(|c| *c != '"' && !c.is_whitespace())
                .collect()
        })
        .collect()
}

/// First 100 characters of a statement, for logs.
pub fn preview(sql: &str) -> &str {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn code(verdict: ValidationVerdict) -> Option<ValidationCode> {
        verdict.error_code
    }

    #[test]
    fn test_valid_statements() {
        let validator = SqlValidator::new();
        assert!(validator.validate("SELECT * FROM users", &[]).valid);
        assert!(
            validator
                .validate("SELECT id, name FROM users WHERE id = $1", &[SqlValue::Int(1)])
                .valid
        );
        assert!(
            validator
                .validate("DELETE FROM users WHERE id=$1", &[SqlValue::Int(1)])
                .valid
        );
        assert!(
            validator
                .validate("UPDATE orders SET status = $1 WHERE id = $2;", &[
                    SqlValue::Text("shipped".into()),
                    SqlValue::Int(7)
                ])
                .valid
        );
    }

    #[test]
    fn test_dangerous_chaining() {
        let validator = SqlValidator::new();
        assert_eq!(
            code(validator.validate("SELECT 1; DROP TABLE users", &[])),
            Some(ValidationCode::DangerousQuery)
        );
        assert_eq!(
            code(validator.validate("SELECT 1;grant all on users to public", &[])),
            Some(ValidationCode::DangerousQuery)
        );
        assert_eq!(
            code(validator.validate("SELECT 1; SELECT 2", &[])),
            Some(ValidationCode::MultipleStatements)
        );
    }

    #[test]
    fn test_delete_requires_where() {
        let validator = SqlValidator::new();
        assert_eq!(
            code(validator.validate("DELETE FROM users", &[])),
            Some(ValidationCode::UnsafeDelete)
        );
    }

    #[test]
    fn test_comments_and_catalogs() {
        let validator = SqlValidator::new();
        assert_eq!(
            code(validator.validate("SELECT * FROM users WHERE 1=1 --", &[])),
            Some(ValidationCode::LineComment)
        );
        assert_eq!(
            code(validator.validate("SELECT /* hi */ 1", &[])),
            Some(ValidationCode::BlockComment)
        );
        assert_eq!(
            code(validator.validate("SELECT usename FROM pg_catalog.pg_user", &[])),
            Some(ValidationCode::SystemTableAccess)
        );
        assert_eq!(
            code(validator.validate("SELECT pg_read_file('/etc/passwd')", &[])),
            Some(ValidationCode::FileAccess)
        );
        assert_eq!(
            code(validator.validate("COPY users TO '/tmp/out.csv'", &[])),
            Some(ValidationCode::CopyFileAccess)
        );
    }

    #[test]
    fn test_each_rule_reports_its_own_code() {
        let validator = SqlValidator::new();
        let cases = [
            ("SELECT 1 -- trailing", "LINE_COMMENT"),
            ("SELECT /**/ 1", "BLOCK_COMMENT"),
            ("SELECT lo_export(1, '/tmp/x')", "FILE_ACCESS"),
            ("COPY users FROM PROGRAM 'id'", "COPY_FILE_ACCESS"),
            ("COPY users TO STDOUT", "COPY_FILE_ACCESS"),
        ];
        for (sql, expected) in cases {
            let verdict = validator.validate(sql, &[]);
            assert_eq!(code(verdict).map(|c| c.as_str()), Some(expected), "{}", sql);
        }
    }

    #[test]
    fn test_non_strict_skips_patterns_but_keeps_tables() {
        let validator = SqlValidator::new().strict_mode(false);
        assert!(validator.validate("DELETE FROM users", &[]).valid);
        assert_eq!(
            code(validator.validate("SELECT * FROM pg_shadow", &[])),
            Some(ValidationCode::TableBlocked)
        );
    }

    #[test]
    fn test_limits() {
        let validator = SqlValidator::new()
            .max_query_length(20)
            .max_params(2)
            .max_param_length(5);

        assert_eq!(code(validator.validate("   ", &[])), Some(ValidationCode::MissingSql));
        assert_eq!(
            code(validator.validate("SELECT * FROM users WHERE id = 1", &[])),
            Some(ValidationCode::QueryTooLong)
        );
        assert_eq!(
            code(validator.validate("SELECT $1", &[
                SqlValue::Int(1),
                SqlValue::Int(2),
                SqlValue::Int(3)
            ])),
            Some(ValidationCode::TooManyParams)
        );
        assert_eq!(
            code(validator.validate("SELECT $1", &[SqlValue::Text("abcdef".into())])),
            Some(ValidationCode::ParamTooLong)
        );
    }

    #[test]
    fn test_table_allow_list() {
        let validator = SqlValidator::new()
            .identifiers(IdentifierSanitizer::new().allow_list(vec!["users".into(), "orders".into()]));

        assert!(
            validator
                .validate("SELECT * FROM users u JOIN orders o ON o.user_id = u.id", &[])
                .valid
        );
        assert_eq!(
            code(validator.validate("INSERT INTO payments (id) VALUES ($1)", &[SqlValue::Int(1)])),
            Some(ValidationCode::TableNotAllowed)
        );
    }

    #[test]
    fn test_referenced_tables() {
        let tables = referenced_tables(
            r#"SELECT * FROM "public"."users" JOIN orders ON true; UPDATE stock SET n = 1"#,
        );
        assert_eq!(tables, vec!["public.users", "orders", "stock"]);
    }

    #[test]
    fn test_verdict_into_result() {
        let verdict = ValidationVerdict::invalid(ValidationCode::UnsafeDelete, "nope");
        let err = verdict.into_result().unwrap_err();
        assert_eq!(err.code, ValidationCode::UnsafeDelete);
        assert!(ValidationVerdict::valid().into_result().is_ok());
    }
}
