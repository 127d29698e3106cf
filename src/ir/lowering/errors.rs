use std::path::PathBuf;

use crate::ir::Span;
use thiserror::Error;

/// Fatal lowering failures.
///
/// Every variant is an internal-consistency failure: it indicates a bug in an
/// earlier pass or a violated precondition of this one, aborts the current
/// compilation unit, and is never retried.
#[derive(Debug, Error, Clone)]
pub enum LoweringError {
    #[error("unresolved name {name:?} in {container:?}")]
    UnresolvedName {
        span: Span,
        name: String,
        container: String,
        path: PathBuf,
    },
    #[error("unrecognized type {name}")]
    UnrecognizedType {
        span: Span,
        name: String,
        path: PathBuf,
    },
    #[error("unexpected declaration shape for {name:?}: expected {expected}, found {found}")]
    UnexpectedDeclaration {
        name: String,
        expected: &'static str,
        found: &'static str,
    },
    #[error("member {name:?} of script {script:?} lowered to no declaration")]
    MemberNotLowered {
        span: Span,
        name: String,
        script: String,
        path: PathBuf,
    },
    #[error("script {name:?} survived lowering")]
    ScriptRemained {
        span: Span,
        name: String,
        path: PathBuf,
    },
    #[error("internal error: {0}")]
    Internal(String),
}
