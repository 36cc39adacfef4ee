//! Error types for layer dispatch and stack construction.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Errors that can occur when parsing an [`Address`](crate::Address).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The address string is empty.
    #[error("address cannot be empty")]
    Empty,

    /// The address has no `:port` suffix.
    #[error("address missing port: {0}")]
    MissingPort(String),

    /// The port is not a valid u16.
    #[error("invalid port in address: {0}")]
    InvalidPort(String),

    /// The host part is empty or malformed.
    #[error("invalid host in address: {0}")]
    InvalidHost(String),
}

/// Errors raised by a [`Policy`](crate::Policy) predicate.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// A host pattern could not be compiled.
    #[error("invalid host pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    /// The predicate could not be evaluated.
    #[error("policy evaluation failed: {0}")]
    Evaluation(String),
}

/// Errors that abort a single dispatch decision.
///
/// Both variants carry the collaborator's error unchanged.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Peeking the client stream failed (reset, closed, cancelled).
    #[error("peek failed: {0}")]
    Io(#[from] io::Error),

    /// A policy predicate failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Errors that abort construction of a connection's layer stack.
#[derive(Debug, Error)]
pub enum StackError {
    /// The dispatcher failed.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// Not enough bytes arrived to decide the next layer.
    #[error("next layer undecidable after {waited:?}: only {available} byte(s) available")]
    Undecidable { available: usize, waited: Duration },

    /// The stack grew beyond the configured depth.
    #[error("layer stack exceeded maximum depth of {max_depth}")]
    TooDeep { max_depth: usize },

    /// A layer driver failed while running its layer.
    #[error("layer driver failed: {0}")]
    Driver(#[source] anyhow::Error),
}

impl StackError {
    /// Returns true if the client went away or the stream failed.
    pub fn is_io(&self) -> bool {
        matches!(self, StackError::Dispatch(DispatchError::Io(_)))
    }

    /// Returns true if the stack gave up waiting for sniffable bytes.
    pub fn is_undecidable(&self) -> bool {
        matches!(self, StackError::Undecidable { .. })
    }
}
