//! Producer error types.

use std::io;

/// Errors returned by [`Producer`](crate::producers::Producer) implementations.
#[derive(Debug, thiserror::Error)]
pub enum ProduceError {
    /// The named source could not be opened.
    #[error(transparent)]
    Load(#[from] io::Error),

    /// The reader returned without ever confirming the source.
    #[error("reader closed confirmation without a value")]
    Unconfirmed,

    /// A worker panicked; `payload` is the panic message.
    #[error("{label} on {name}: {payload}")]
    Fault {
        label: String,
        name: String,
        payload: String,
    },

    /// The renderer could not write its document.
    #[error("rendering failed: {0}")]
    Render(#[source] io::Error),

    /// The caller's writer refused the rendered document.
    #[error("writing output failed: {0}")]
    Output(#[source] io::Error),

    /// Both sides of the pipeline failed.
    #[error("{0}; [add] {1}")]
    Composite(Box<ProduceError>, Box<ProduceError>),
}

impl ProduceError {
    /// True when the source does not exist, as opposed to any other failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ProduceError::Load(err) if err.kind() == io::ErrorKind::NotFound)
    }

    /// Chains `other` after `self`, keeping both messages.
    pub fn compose(self, other: ProduceError) -> ProduceError {
        ProduceError::Composite(Box::new(self), Box::new(other))
    }
}
