// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Connector error types.

use std::fmt;
use std::io;

/// Result type for connector operations.
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Fatal failure while establishing a queue connection.
///
/// The connector cannot provide its hold guarantee without the queue,
/// so these errors are never retried internally; the caller decides
/// whether to retry from outside.
#[derive(Debug)]
pub enum ConnectError {
    /// Opening the queue transport failed.
    Open(io::Error),

    /// The transport opened but callback registration failed.
    Register(io::Error),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open(e) => write!(f, "failed to open queue transport: {}", e),
            Self::Register(e) => write!(f, "failed to register queue callbacks: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(e) | Self::Register(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_cause() {
        let err = ConnectError::Open(io::Error::new(io::ErrorKind::PermissionDenied, "EPERM"));
        assert!(err.to_string().contains("open"));
        assert!(err.to_string().contains("EPERM"));
    }
}
