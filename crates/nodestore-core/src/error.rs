//! Error types for nodestore-core

use std::fmt::Write;
use thiserror::Error;

use crate::config::ConfigError;

/// Actionable remediation guidance for an error
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Remediation {
    /// One-line summary of how to fix the issue
    pub summary: String,
    /// Additional alternative guidance
    pub alternatives: Vec<String>,
}

impl Remediation {
    /// Create a new remediation with a summary
    #[must_use]
    pub fn new(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            alternatives: Vec::new(),
        }
    }

    /// Add an alternative suggestion
    #[must_use]
    pub fn alternative(mut self, alternative: impl Into<String>) -> Self {
        self.alternatives.push(alternative.into());
        self
    }

    /// Render remediation text for human-readable output
    #[must_use]
    pub fn render_plain(&self) -> String {
        let mut output = String::new();
        let _ = writeln!(output, "To fix:");
        let _ = writeln!(output, "  {}", self.summary);
        if !self.alternatives.is_empty() {
            let _ = writeln!(output, "  Alternatives:");
            for alt in &self.alternatives {
                let _ = writeln!(output, "    - {alt}");
            }
        }
        output
    }
}

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for nodestore-core
#[derive(Error, Debug)]
pub enum Error {
    /// Natural-key lookup found no row
    #[error("{entity} {key:?} not found")]
    NotFound { entity: &'static str, key: String },

    /// Unique constraint on a natural key was violated
    #[error("{entity} {key:?} already exists")]
    AlreadyExists { entity: &'static str, key: String },

    /// A fleet-scoped reference could not be resolved to a local row
    #[error("{entity} {key:?} references {reference}")]
    DanglingReference {
        entity: &'static str,
        key: String,
        reference: String,
    },

    /// Begin/commit/rollback failed
    #[error("transaction {op} failed: {source}")]
    Transaction {
        op: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Insert/update/delete failed
    #[error("write to {table} failed: {source}")]
    Write {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Read failed
    #[error("query on {table} failed: {source}")]
    Query {
        table: &'static str,
        #[source]
        source: rusqlite::Error,
    },

    /// Opening the database or applying pragmas/schema failed
    #[error("failed to open database {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    /// A reconciliation step failed; the whole pass was rolled back
    #[error("reconcile step {step} failed: {source}")]
    Reconcile {
        step: &'static str,
        #[source]
        source: Box<Error>,
    },

    /// Caller-supplied value was rejected before touching storage
    #[error("invalid input: {0}")]
    Validation(String),

    /// JSON encode/decode errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
}

impl Error {
    /// Map a write failure, turning unique-constraint violations into
    /// [`Error::AlreadyExists`] for the given natural key.
    pub(crate) fn write(
        table: &'static str,
        key: impl std::fmt::Display,
    ) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| {
            if is_unique_violation(&source) {
                Self::AlreadyExists {
                    entity: table,
                    key: key.to_string(),
                }
            } else {
                Self::Write { table, source }
            }
        }
    }

    pub(crate) fn query(table: &'static str) -> impl FnOnce(rusqlite::Error) -> Self {
        move |source| Self::Query { table, source }
    }

    pub(crate) fn in_step(self, step: &'static str) -> Self {
        match self {
            already @ Self::Reconcile { .. } => already,
            other => Self::Reconcile {
                step,
                source: Box::new(other),
            },
        }
    }

    /// The innermost error, looking through reconcile step wrappers
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::Reconcile { source, .. } => source.root_cause(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_dangling_reference(&self) -> bool {
        matches!(self.root_cause(), Self::DanglingReference { .. })
    }

    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Self::NotFound { .. })
    }

    /// Remediation guidance for errors a caller can act on
    #[must_use]
    pub fn remediation(&self) -> Option<Remediation> {
        match self.root_cause() {
            Self::DanglingReference { reference, .. } => Some(
                Remediation::new(format!(
                    "Add the missing {reference} to the desired state before referencing it"
                ))
                .alternative("Re-fetch the desired state from the fleet; the snapshot may be truncated"),
            ),
            Self::AlreadyExists { entity, key } => Some(Remediation::new(format!(
                "Remove the duplicate {entity} {key:?} from the input"
            ))),
            Self::Transaction { .. } => Some(
                Remediation::new("Retry on the next cycle; the transaction was rolled back")
                    .alternative("Check for another process holding a write lock on the database"),
            ),
            Self::Open { .. } => Some(Remediation::new(
                "Check that the database directory exists and is writable",
            )),
            _ => None,
        }
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
                && (e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_cause_looks_through_steps() {
        let err = Error::DanglingReference {
            entity: "policy",
            key: "default".into(),
            reference: "unknown fleet data network id 7".into(),
        }
        .in_step("policies");
        assert!(err.is_dangling_reference());
        assert!(err.to_string().contains("policies"));
        assert!(err.root_cause().to_string().contains("fleet data network id 7"));
    }

    #[test]
    fn in_step_does_not_double_wrap() {
        let err = Error::Validation("x".into()).in_step("routes").in_step("outer");
        match err {
            Error::Reconcile { step, .. } => assert_eq!(step, "routes"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unique_violation_maps_to_already_exists() {
        let conn = rusqlite::Connection::open_in_memory().unwrap();
        conn.execute_batch("CREATE TABLE t (name TEXT UNIQUE); INSERT INTO t VALUES ('a');")
            .unwrap();
        let err = conn
            .execute("INSERT INTO t VALUES ('a')", [])
            .map_err(Error::write("t", "a"))
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { entity: "t", .. }));
    }

    #[test]
    fn remediation_renders() {
        let err = Error::DanglingReference {
            entity: "subscriber",
            key: "001010100007487".into(),
            reference: "unknown fleet policy id 9".into(),
        };
        let text = err.remediation().unwrap().render_plain();
        assert!(text.starts_with("To fix:"));
        assert!(text.contains("fleet policy id 9"));
    }
}
