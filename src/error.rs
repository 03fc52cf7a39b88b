use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unsupported schema shape '{0}'")]
    UnsupportedSchema(String),

    #[error("Unsupported non-TSDL identifier '{0}'")]
    UnsupportedIdentifier(String),

    #[error("Unsupported trace environment entry '{0}'")]
    UnsupportedEnvironment(String),

    #[error("Incompatible discarded {kind} message: {reason}")]
    IncompatibleDiscardedRange { kind: &'static str, reason: String },

    #[error("Unsupported stream shape: {0}")]
    IncompatibleStreamShape(String),

    #[error("Single trace mode, but output path '{}' already exists", .0.display())]
    SingleTraceModeCollision(PathBuf),

    #[error(
        "Encountered an IO error while writing the output trace ({})",
        .0.kind()
    )]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn unsupported_schema<S: AsRef<str>>(what: S) -> Self {
        Error::UnsupportedSchema(what.as_ref().to_owned())
    }

    pub(crate) fn unsupported_identifier<S: AsRef<str>>(name: S) -> Self {
        Error::UnsupportedIdentifier(name.as_ref().to_owned())
    }

    pub(crate) fn unsupported_environment<S: AsRef<str>>(name: S) -> Self {
        Error::UnsupportedEnvironment(name.as_ref().to_owned())
    }

    pub(crate) fn discarded_range<S: AsRef<str>>(kind: &'static str, reason: S) -> Self {
        Error::IncompatibleDiscardedRange {
            kind,
            reason: reason.as_ref().to_owned(),
        }
    }
}

/// Status of a single [`FsSink::consume`](crate::FsSink::consume) call.
///
/// Fatal conditions are reported through [`Error`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum SinkStatus {
    /// A message batch was processed.
    Ok,
    /// The upstream iterator has nothing to deliver right now.
    TryAgain,
    /// The upstream iterator is done.
    End,
}
