//! Error handling for appdeploy.
//!
//! The error system is built around two pieces:
//! 1. [`DeployError`] - strongly-typed error kinds for every failure mode the
//!    core can surface, so callers can match on what went wrong;
//! 2. [`ErrorContext`] - a wrapper that adds a user-facing suggestion and
//!    details for CLI display.
//!
//! Lower layers return [`DeployError`] values wrapped in [`anyhow::Error`]
//! with `.context()` annotations naming the operation and the affected path
//! or variable. The binary converts the final error into an [`ErrorContext`]
//! via [`user_friendly_error`] and prints it with terminal colors.
//!
//! # Error kinds
//!
//! - **Input**: [`DeployError::BadInput`] - malformed or missing digest, bad flags
//! - **I/O**: [`DeployError::IoError`] - filesystem or stream failures
//! - **Integrity**: [`DeployError::IntegrityError`] - tarball digest mismatch
//! - **Archive policy**: [`DeployError::UnsupportedEntry`], [`DeployError::UnsafeEntry`]
//! - **Locking**: [`DeployError::LockTimeout`], [`DeployError::Cancelled`]
//! - **Descriptor**: [`DeployError::BadDecl`], [`DeployError::AmbiguousType`],
//!   [`DeployError::BadOverride`], [`DeployError::UndefinedVariable`]
//! - **External tools**: [`DeployError::ToolNotFound`], [`DeployError::ToolFailed`]

use colored::Colorize;
use std::fmt;
use thiserror::Error;

/// The main error type for appdeploy operations.
///
/// Each variant represents a specific failure mode. The core never retries
/// on its own (except the lock's internal retry loop); errors propagate to
/// the caller unchanged in kind, annotated with `anyhow` context along the
/// way.
#[derive(Error, Debug)]
pub enum DeployError {
    /// Caller-supplied input was malformed.
    ///
    /// Raised by the source resolver for a missing digest on a remote
    /// reference, a digest that is not valid hex, or a digest of the wrong
    /// length.
    #[error("bad input: {message}")]
    BadInput {
        /// What exactly was wrong with the input
        message: String,
    },

    /// Underlying filesystem or stream error.
    #[error(transparent)]
    IoError(#[from] std::io::Error),

    /// Content digest mismatch after fetching a tarball.
    ///
    /// The declared digest of the source did not match the SHA-256 computed
    /// over the fetched bytes. The cache guarantees no `data/` directory is
    /// created when this fires.
    #[error("tarball hash mismatch: expected {expected}, got {actual}")]
    IntegrityError {
        /// Digest the source declared (lowercase hex)
        expected: String,
        /// Digest computed over the fetched stream (lowercase hex)
        actual: String,
    },

    /// Archive entry type outside {regular file, directory}.
    #[error("unsupported tarball entry {name:?} of type {entry_type}")]
    UnsupportedEntry {
        /// Name of the offending entry as recorded in the archive
        name: String,
        /// Human-readable entry type (symlink, fifo, ...)
        entry_type: String,
    },

    /// Archive entry path escapes the extraction destination.
    #[error("tarball entry has fishy name {name:?}")]
    UnsafeEntry {
        /// Name of the offending entry as recorded in the archive
        name: String,
    },

    /// Advisory lock not acquired within the configured timeout.
    #[error("timed out waiting for lock {path}")]
    LockTimeout {
        /// Path of the lock file that could not be acquired
        path: String,
    },

    /// Ambient cancellation observed while waiting or fetching.
    #[error("operation cancelled")]
    Cancelled,

    /// The `luci_gae_vars` section has the wrong shape or an unsupported
    /// value type.
    #[error("bad luci_gae_vars declaration: {message}")]
    BadDecl {
        /// What exactly is wrong with the declaration
        message: String,
    },

    /// A variable is declared with inconsistent types across targets.
    #[error("variable {name:?} has ambiguous type: declared both as integer and as string")]
    AmbiguousType {
        /// Name of the conflicting variable
        name: String,
    },

    /// A caller override for an integer-typed variable does not parse.
    #[error("bad override for variable {name:?}: {value:?} is not a 32-bit integer")]
    BadOverride {
        /// Name of the variable being overridden
        name: String,
        /// The override value that failed to parse
        value: String,
    },

    /// A referenced placeholder has neither an override nor a baseline value.
    #[error("a value for variable {name} is not provided")]
    UndefinedVariable {
        /// Name of the unresolvable variable
        name: String,
    },

    /// A required external tool is not installed or not in PATH.
    #[error("{tool} is not installed or not found in PATH")]
    ToolNotFound {
        /// Name of the missing binary (gcloud, gsutil)
        tool: String,
    },

    /// An external tool invocation returned a non-zero exit status.
    #[error("{tool} {operation} failed")]
    ToolFailed {
        /// Name of the binary that failed
        tool: String,
        /// The operation being performed (deploy, versions list, ...)
        operation: String,
        /// Captured stderr of the failed invocation
        stderr: String,
    },

    /// Descriptor file could not be parsed as YAML.
    #[error("invalid module YAML in {file}")]
    DescriptorParseError {
        /// Path of the descriptor that failed to parse
        file: String,
        /// Parser diagnostics
        reason: String,
    },

    /// Catch-all for errors that don't fit other variants.
    #[error("{message}")]
    Other {
        /// Description of the error
        message: String,
    },
}

/// User-facing wrapper around a [`DeployError`] with an optional suggestion
/// and details, displayed with terminal colors by the CLI.
#[derive(Debug)]
pub struct ErrorContext {
    /// The underlying error
    pub error: DeployError,
    /// Optional actionable suggestion for resolving the error
    pub suggestion: Option<String>,
    /// Optional additional details about the error
    pub details: Option<String>,
}

impl ErrorContext {
    /// Create a new error context with no suggestion or details.
    #[must_use]
    pub const fn new(error: DeployError) -> Self {
        Self {
            error,
            suggestion: None,
            details: None,
        }
    }

    /// Add an actionable suggestion, shown in green.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add explanatory details, shown in yellow.
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Print the error, details, and suggestion to stderr with colors.
    pub fn display(&self) {
        eprintln!("{}: {}", "error".red().bold(), self.error);

        if let Some(details) = &self.details {
            eprintln!("{}: {}", "details".yellow(), details);
        }

        if let Some(suggestion) = &self.suggestion {
            eprintln!("{}: {}", "suggestion".green(), suggestion);
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;

        if let Some(details) = &self.details {
            write!(f, "\nDetails: {details}")?;
        }

        if let Some(suggestion) = &self.suggestion {
            write!(f, "\nSuggestion: {suggestion}")?;
        }

        Ok(())
    }
}

impl std::error::Error for ErrorContext {}

/// Convert any error into a user-friendly [`ErrorContext`].
///
/// Downcasts to [`DeployError`] when possible and attaches suggestions
/// tailored to the specific failure; otherwise wraps the full error chain
/// into a generic context.
pub fn user_friendly_error(error: anyhow::Error) -> ErrorContext {
    let error = match error.downcast::<DeployError>() {
        Ok(err) => return contextualize(err),
        Err(other) => other,
    };

    let error = match error.downcast::<std::io::Error>() {
        Ok(io_error) => {
            let kind = io_error.kind();
            let ctx = ErrorContext::new(io_error.into());
            return match kind {
                std::io::ErrorKind::PermissionDenied => ctx.with_suggestion(
                    "Check file ownership of the cache directory, or point \
                     APPDEPLOY_CACHE_DIR at a writable location",
                ),
                std::io::ErrorKind::NotFound => ctx.with_suggestion(
                    "Check that the file or directory exists and the path is correct",
                ),
                _ => ctx,
            };
        }
        Err(other) => other,
    };

    // Generic fallback: preserve the anyhow chain in the message.
    let mut message = error.to_string();
    let chain: Vec<String> = error.chain().skip(1).map(ToString::to_string).collect();
    if !chain.is_empty() {
        message.push_str("\n\nCaused by:");
        for (i, cause) in chain.iter().enumerate() {
            message.push_str(&format!("\n  {}: {}", i + 1, cause));
        }
    }
    ErrorContext::new(DeployError::Other { message })
}

fn contextualize(error: DeployError) -> ErrorContext {
    match &error {
        DeployError::BadInput { message } if message.contains("digest") => ErrorContext::new(error)
            .with_suggestion(
                "For gs:// tarballs pass --tarball-sha256 with the lowercase hex \
                 SHA-256 of the compressed tarball",
            ),
        DeployError::IntegrityError { .. } => ErrorContext::new(error)
            .with_details("The fetched tarball does not match the digest it was pinned to")
            .with_suggestion(
                "Verify the -tarball-sha256 value against the artifact you intended to deploy",
            ),
        DeployError::LockTimeout { .. } => ErrorContext::new(error).with_details(
            "Another deployment of the same tarball may be running, or a \
             previous run died while holding the lock",
        ),
        DeployError::ToolNotFound { tool } => {
            let suggestion =
                format!("Install the Google Cloud SDK and make sure '{tool}' is in PATH");
            ErrorContext::new(error).with_suggestion(suggestion)
        }
        DeployError::UndefinedVariable { .. } => ErrorContext::new(error).with_suggestion(
            "Pass a value via --var NAME=VALUE or declare a default in luci_gae_vars",
        ),
        _ => ErrorContext::new(error),
    }
}
