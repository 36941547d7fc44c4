// SPDX-License-Identifier: MIT
// Copyright (c) Microsoft Corporation.

//! Error types for the dkimsignd service.

use std::path::PathBuf;

/// Errors in the service configuration or the declared signing keys.
///
/// All of these are fatal: they are detected at startup, before the
/// listening socket accepts its first connection.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A key declaration has an empty signing domain.
    #[error("signing domain must not be empty")]
    EmptyDomain,

    /// A key declaration has an empty selector.
    #[error("selector must not be empty (signing domain {domain})")]
    EmptySelector { domain: String },

    /// Two declarations share a (literal domain, selector) pair.
    ///
    /// The first declaration would always win the selection, so the second
    /// one is a configuration mistake.
    #[error("duplicate selector {selector} for signing domain {domain}")]
    DuplicateSelector { domain: String, selector: String },

    /// The declared key file could not be read.
    #[error("cannot read key file {}: {source}", .path.display())]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The declared key file is not a PEM-encoded RSA private key.
    #[error("key file {} does not contain an RSA private key: {source}", .path.display())]
    InvalidKey {
        path: PathBuf,
        #[source]
        source: openssl::error::ErrorStack,
    },

    /// A wildcarded signing domain does not compile to a pattern.
    #[error("signing domain pattern {domain} is invalid: {source}")]
    InvalidDomainPattern {
        domain: String,
        #[source]
        source: regex::Error,
    },
}

/// Errors in the wire protocol.
///
/// These are never fatal; the offending line is logged and skipped while
/// the connection stays up.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The line does not match `name=value` or `name: value`.
    #[error("malformed attribute line: {0:?}")]
    MalformedLine(String),
}
