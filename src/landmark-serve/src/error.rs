//! Error taxonomy shared by the library and both front-ends.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A required artifact is missing locally and no remote source is configured.
    #[error("artifact {} is missing and no remote source is configured", path.display())]
    Config { path: PathBuf },

    /// Fetching an artifact from its remote source failed.
    #[error("could not fetch {url}: {message}")]
    Fetch { url: String, message: String },

    /// The artifact exists but could not be turned into a model or table.
    #[error("could not load {}: {message}", path.display())]
    ModelLoad { path: PathBuf, message: String },

    /// The uploaded bytes are not a decodable image.
    #[error("could not decode image: {0}")]
    Decode(String),

    /// A tensor handed to the model does not match its input shape.
    #[error("input shape {actual:?} does not match expected {expected:?}")]
    InputContract {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("inference failed: {0}")]
    Inference(String),

    /// The request is missing its upload or carries an unusable one.
    #[error("{0}")]
    BadRequest(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Coarse grouping of [`Error`] used to pick a response status.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The client sent something unusable.
    Client,
    /// The upload could not be decoded.
    Unprocessable,
    /// Artifacts are not available yet.
    NotReady,
    Internal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BadRequest(_) => ErrorKind::Client,
            Error::Decode(_) => ErrorKind::Unprocessable,
            Error::Config { .. } | Error::Fetch { .. } => ErrorKind::NotReady,
            Error::ModelLoad { .. }
            | Error::InputContract { .. }
            | Error::Inference(_)
            | Error::Io(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn model_load(path: impl Into<PathBuf>, message: impl ToString) -> Self {
        Error::ModelLoad {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub(crate) fn fetch(url: &str, message: impl ToString) -> Self {
        Error::Fetch {
            url: url.to_owned(),
            message: message.to_string(),
        }
    }
}
