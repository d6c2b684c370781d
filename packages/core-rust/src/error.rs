//! Error taxonomy shared by every layer of the query engine.

use std::fmt;

/// Which rewrite resolver detected a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// An operator replacement rule ended up requiring itself.
    Operator,
    /// A write handler ended up writing to a field already on the path.
    Write,
}

impl fmt::Display for CycleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Operator => f.write_str("operator replacement"),
            Self::Write => f.write_str("write"),
        }
    }
}

/// Errors raised by the query model and by collection decorators.
///
/// Decorators never swallow these; they surface to the direct caller of the
/// decorated operation.
#[derive(Debug, thiserror::Error)]
pub enum ToolkitError {
    /// Unknown field, wrong field kind, or an invalid schema registration.
    #[error("schema error: {0}")]
    Schema(String),

    /// A record value failed a declared validation rule.
    #[error("{field} failed validation rule: '{rule}'")]
    Validation { field: String, rule: String },

    /// A rewrite resolver revisited a node already on its path.
    #[error("{kind} cycle detected: {}", path.join(" -> "))]
    Cycle { kind: CycleKind, path: Vec<String> },

    /// Two write handlers produced different values for the same field.
    #[error("conflict value on the field '{field}': it received several values")]
    Conflict { field: String },

    /// Malformed condition tree or an operator that cannot be resolved.
    #[error("condition tree error: {0}")]
    ConditionTree(String),

    /// Projection cannot be nested, unnested or applied.
    #[error("projection error: {0}")]
    Projection(String),

    /// Unknown or duplicated collection inside a datasource.
    #[error("datasource error: {0}")]
    Datasource(String),

    /// Rejected by a hook as a validation failure.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Rejected by a hook as forbidden.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// Input understood but cannot be processed (bad binary payload, hook abort).
    #[error("unprocessable: {0}")]
    Unprocessable(String),

    /// Error surfaced by a concrete backend.
    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl ToolkitError {
    /// Shorthand for [`ToolkitError::Schema`].
    pub fn schema(message: impl Into<String>) -> Self {
        Self::Schema(message.into())
    }

    /// Shorthand for [`ToolkitError::ConditionTree`].
    pub fn condition_tree(message: impl Into<String>) -> Self {
        Self::ConditionTree(message.into())
    }

    /// Shorthand for [`ToolkitError::Datasource`].
    pub fn datasource(message: impl Into<String>) -> Self {
        Self::Datasource(message.into())
    }
}

/// Result alias used across the workspace.
pub type Result<T, E = ToolkitError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_message_lists_full_path() {
        let err = ToolkitError::Cycle {
            kind: CycleKind::Write,
            path: vec!["name".into(), "age".into(), "price".into(), "name".into()],
        };
        assert_eq!(
            err.to_string(),
            "write cycle detected: name -> age -> price -> name"
        );
    }

    #[test]
    fn validation_message_names_field_and_rule() {
        let err = ToolkitError::Validation {
            field: "title".into(),
            rule: "longer_than(3)".into(),
        };
        assert_eq!(err.to_string(), "title failed validation rule: 'longer_than(3)'");
    }

    #[test]
    fn backend_errors_convert_from_anyhow() {
        let err: ToolkitError = anyhow::anyhow!("connection reset").into();
        assert!(matches!(err, ToolkitError::Backend(_)));
    }
}
