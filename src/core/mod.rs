//! Core types for appdeploy.
//!
//! Currently this is the home of the error system: the strongly-typed
//! [`DeployError`] kinds, the user-facing [`ErrorContext`] wrapper, and the
//! [`user_friendly_error`] conversion used by the binary's top-level error
//! handler.

pub mod error;

pub use error::{DeployError, ErrorContext, user_friendly_error};
