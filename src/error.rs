// src/error.rs
//! Error handling for the whole crate.
//!
//! - **Scope**: only *setup* paths are fallible (configuration loading and
//!   validation, backend construction). Per-frame recording never returns an
//!   error; contract violations are debug assertions.
//! - **Features**: context chaining, custom messages, transparent std errors,
//!   `is_*` helpers, `Result` alias.

use std::fmt;
use thiserror::Error;

/// Main error type. `Send + Sync + 'static`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O errors (config files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON configuration could not be parsed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// No graphics adapter matched the request.
    #[error("no suitable graphics adapter available")]
    AdapterUnavailable,

    /// The adapter refused to create a device.
    #[error("failed to request device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    /// A configuration value is out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Simple custom message.
    #[error("{0}")]
    Custom(String),

    /// Context chaining, like `.context()` in anyhow.
    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create a custom error message.
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    /// Create a formatted custom error (like `format!` but returns `Error`).
    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    /// Wrap this error with an outer message.
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Quick static message.
    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn is_io(&self) -> bool {
        match self {
            Error::Io(_) => true,
            Error::WithContext { source, .. } => source.is_io(),
            _ => false,
        }
    }

    #[inline]
    pub fn is_config(&self) -> bool {
        match self {
            Error::Json(_) | Error::InvalidConfig(_) => true,
            Error::WithContext { source, .. } => source.is_config(),
            _ => false,
        }
    }

    #[inline]
    pub fn is_backend(&self) -> bool {
        matches!(self, Error::AdapterUnavailable | Error::RequestDevice(_))
    }
}

/// Convenient `Result` alias. Use `crate::Result<T>` everywhere.
pub type Result<T> = std::result::Result<T, Error>;
