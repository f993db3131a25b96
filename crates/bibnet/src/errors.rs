//! Error types for the bibnet library.
//!
//! Failures fall into a few families:
//! - Configuration problems, detected before any network call
//! - Malformed API responses, on which paging stops for the current bucket
//! - Normalization failures, which abort a whole normalization pass
//! - Storage, filesystem and archive errors
//!
//! Transport failures of individual HTTP attempts are *not* errors: the retrying client
//! returns them as [`TransportFailure`](crate::clients::retry::TransportFailure) values so
//! callers can degrade gracefully.
//!
//! # Examples
//!
//! ```
//! use bibnet::{config::Settings, errors::BibnetError};
//!
//! let result = Settings::from_yaml_str("project: {name: ''}");
//! match result {
//!   Err(BibnetError::Config(reason)) => println!("bad settings: {reason}"),
//!   Err(e) => println!("other error: {e}"),
//!   Ok(_) => println!("valid settings"),
//! }
//! ```

use thiserror::Error;

/// Errors that can occur while harvesting, normalizing or storing bibliometric data.
#[derive(Error, Debug)]
pub enum BibnetError {
  /// Settings or query parameters are missing or invalid.
  ///
  /// Raised before any request is sent.
  #[error("Configuration error: {0}")]
  Config(String),

  /// A table, schema or column name is not a plain SQL identifier.
  #[error("Invalid identifier: {0}")]
  InvalidIdentifier(String),

  /// An HTTP request could not be built or its body could not be read.
  #[error(transparent)]
  Network(#[from] reqwest::Error),

  /// An API answered, but not with what we asked for (non-success status, error payload).
  #[error("API error: {0}")]
  ApiError(String),

  /// A response body was missing expected keys or did not parse.
  #[error("Malformed response: {0}")]
  MalformedResponse(String),

  /// A harvested record violates the expected nested shape.
  ///
  /// `record` is the ordinal of the offending record in the normalized batch.
  #[error("Normalization failed at record {record}: {reason}")]
  Normalization {
    /// Ordinal of the record within the batch
    record: usize,
    /// What was wrong with it
    reason: String,
  },

  /// JSON (de)serialization failed.
  #[error(transparent)]
  Json(#[from] serde_json::Error),

  /// YAML settings or strategy documents failed to parse.
  #[error(transparent)]
  Yaml(#[from] serde_yaml::Error),

  /// Failed to parse a URL.
  #[error(transparent)]
  InvalidUrl(#[from] url::ParseError),

  /// A SQLite operation failed.
  #[error(transparent)]
  Sqlite(#[from] rusqlite::Error),

  /// An async SQLite operation failed.
  #[error(transparent)]
  AsyncSqlite(#[from] tokio_rusqlite::Error),

  /// The registry archive could not be opened or lacks the expected entry.
  #[error(transparent)]
  Zip(#[from] zip::result::ZipError),

  /// A file system operation failed.
  #[error(transparent)]
  Path(#[from] std::io::Error),
}

impl BibnetError {
  /// Builds a [`BibnetError::Normalization`] for the given record ordinal.
  pub fn normalization(record: usize, reason: impl Into<String>) -> Self {
    BibnetError::Normalization { record, reason: reason.into() }
  }

  /// Whether this error came from a response we could not interpret.
  ///
  /// Paging loops use this to stop a bucket instead of failing the whole run.
  pub fn is_malformed_response(&self) -> bool {
    matches!(self, BibnetError::MalformedResponse(_) | BibnetError::Json(_))
  }
}
