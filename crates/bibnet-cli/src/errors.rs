//! Error types for the bibnet command line.
//!
//! Everything the CLI can fail on is wrapped transparently so the underlying message reaches
//! the user unchanged:
//! - Pipeline errors from the library
//! - Confirmation prompts
//! - File system operations and log file setup
//! - Glob patterns used when cleaning project files

use thiserror::Error;

/// Errors that can occur while running a CLI command.
///
/// # Examples
///
/// ```no_run
/// use bibnet::config::Settings;
/// use bibnet_cli::errors::BibnetCliError;
///
/// # fn example() -> Result<(), BibnetCliError> {
/// let settings = Settings::load(Settings::default_path())?;
/// std::fs::create_dir_all(settings.log_dir())?;
/// # Ok(())
/// # }
/// ```
#[derive(Error, Debug)]
pub enum BibnetCliError {
  /// Errors from the bibnet library
  #[error(transparent)]
  Bibnet(#[from] bibnet::errors::BibnetError),

  /// Errors from user interaction dialogs
  #[error(transparent)]
  Dialoguer(#[from] dialoguer::Error),

  /// File system and IO operation errors
  #[error(transparent)]
  IO(#[from] std::io::Error),

  /// The log file could not be created
  #[error(transparent)]
  LogFile(#[from] tracing_appender::rolling::InitError),

  /// Glob pattern matching errors
  #[error(transparent)]
  Glob(#[from] glob::PatternError),
}
