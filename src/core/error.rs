//! BP-001: Compile error taxonomy.
//!
//! Every failure is deterministic and fatal for the current compile: there is
//! no partial document. The CLI surfaces the message and exits non-zero.

use thiserror::Error;

/// Result alias used throughout the compiler.
pub type CompileResult<T> = Result<T, CompileError>;

/// All compile-time failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// A declared value violates its constraint (regex, type, mandatory, schema).
    #[error("validation error: {subject}: {reason}")]
    Validation { subject: String, reason: String },

    /// A reference handle matched no concrete entity.
    #[error("unresolved reference: {from} -> {kind} '{name}'")]
    UnresolvedReference {
        from: String,
        kind: String,
        name: String,
    },

    /// Several candidates tie for the same handle at the same hop distance.
    #[error("ambiguous reference: {from} -> {kind} '{name}' ({candidates} candidates at {hops} hop(s))")]
    AmbiguousReference {
        from: String,
        kind: String,
        name: String,
        candidates: usize,
        hops: String,
    },

    /// A task-tree scope was mismatched, left open, or is missing a child.
    #[error("task structure error in '{action}': {reason}")]
    StructuralTask { action: String, reason: String },

    /// Multiple inheritance combined colliding bases.
    #[error("merge conflict composing '{entity}': {reason}")]
    MergeConflict { entity: String, reason: String },

    /// A post-resolution invariant is violated while rendering the payload.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A lifecycle step was attempted out of order.
    #[error("lifecycle error: {entity} cannot move from {from} to {to}")]
    Lifecycle {
        entity: String,
        from: String,
        to: String,
    },

    /// Source module or referenced file could not be read.
    #[error("cannot read {path}: {reason}")]
    Io { path: String, reason: String },

    /// Source module or config could not be parsed.
    #[error("parse error in {source_name}: {reason}")]
    Parse { source_name: String, reason: String },
}

impl CompileError {
    pub fn validation(subject: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            reason: reason.into(),
        }
    }

    pub fn structural(action: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StructuralTask {
            action: action.into(),
            reason: reason.into(),
        }
    }

    pub fn merge(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MergeConflict {
            entity: entity.into(),
            reason: reason.into(),
        }
    }

    pub fn serialization(reason: impl Into<String>) -> Self {
        Self::Serialization(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bp001_display_validation() {
        let e = CompileError::validation("variable 'PORT'", "value 'abc' is not an integer");
        assert_eq!(
            e.to_string(),
            "validation error: variable 'PORT': value 'abc' is not an integer"
        );
    }

    #[test]
    fn test_bp001_display_unresolved() {
        let e = CompileError::UnresolvedReference {
            from: "package 'P'".to_string(),
            kind: "service".to_string(),
            name: "Ghost".to_string(),
        };
        assert!(e.to_string().contains("service 'Ghost'"));
    }

    #[test]
    fn test_bp001_errors_compare() {
        assert_eq!(
            CompileError::serialization("dup"),
            CompileError::Serialization("dup".to_string())
        );
        assert_ne!(
            CompileError::structural("a", "x"),
            CompileError::merge("a", "x")
        );
    }
}
