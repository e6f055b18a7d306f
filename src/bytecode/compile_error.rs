use thiserror::Error;

use crate::bytecode::link::LinkError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CompileError {
    /// The source had errors; they are in the compile context's diagnostics.
    #[error("compilation failed with {errors} error(s)")]
    Rejected { errors: usize },

    #[error("entry function '{0}' is not defined")]
    MissingEntry(String),

    #[error("entry function '{name}' must take no parameters, found `{signature}`")]
    InvalidEntry { name: String, signature: String },

    /// An operation the resolver accepted but no instruction implements.
    #[error("no instruction for {0}")]
    NoOpcode(String),

    #[error(transparent)]
    Link(#[from] LinkError),
}
