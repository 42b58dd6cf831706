// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transport errors of the secure client.

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

use super::dialer::DeniedAddress;

/// Why a request to an SDK endpoint failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecHttpError {
    /// The endpoint could not be reached at all.
    #[error("Unable to reach SDK URL")]
    UnableToReach,

    /// The dialer refused the destination.
    #[error("connection denied: {0}")]
    Denied(String),

    /// The server closed the connection while the request was being written.
    #[error("Your server closed the request before finishing")]
    ServerClosed,

    /// The server reset the connection.
    #[error("Your server reset the connection while we were reading the reply")]
    ConnectionReset,

    /// The response ended before it was complete.
    #[error("Your server ended the response unexpectedly")]
    UnexpectedEnd,

    /// The response could not be used.
    #[error("Invalid response from your server: {0}")]
    InvalidResponse(String),

    /// The response body is larger than allowed.
    #[error("Your server responded with a body larger than {limit} bytes")]
    BodyTooLarge {
        /// Largest body accepted.
        limit: usize,
    },

    /// The TLS handshake did not finish in time.
    #[error("TLS handshake timed out")]
    TlsHandshakeTimeout,

    /// The request could not be built.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// First error of type `T` in the source chain of `err`.
fn find_source<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        // io::Error::source skips the wrapped error itself.
        if let Some(io_err) = e.downcast_ref::<io::Error>()
            && let Some(found) = io_err.get_ref().and_then(|inner| inner.downcast_ref::<T>())
        {
            return Some(found);
        }
        current = e.source();
    }
    None
}

/// Whether any error in the chain mentions `needle`.
fn chain_mentions(err: &(dyn StdError + 'static), needle: &str) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if e.to_string().contains(needle) {
            return true;
        }
        current = e.source();
    }
    false
}

/// Map a transport error onto [`ExecHttpError`]. `https` tells whether the
/// request needed a TLS handshake.
pub(crate) fn classify(err: &reqwest::Error, https: bool) -> ExecHttpError {
    if let Some(denied) = find_source::<DeniedAddress>(err) {
        return ExecHttpError::Denied(denied.reason().to_string());
    }

    if err.is_redirect() {
        return ExecHttpError::InvalidResponse("too many redirects".to_string());
    }

    if err.is_connect() && err.is_timeout() {
        return if https {
            ExecHttpError::TlsHandshakeTimeout
        } else {
            ExecHttpError::UnableToReach
        };
    }

    if let Some(io_err) = find_source::<io::Error>(err) {
        match io_err.kind() {
            io::ErrorKind::BrokenPipe => return ExecHttpError::ServerClosed,
            io::ErrorKind::ConnectionReset => return ExecHttpError::ConnectionReset,
            io::ErrorKind::UnexpectedEof if !err.is_connect() => {
                return ExecHttpError::UnexpectedEnd;
            }
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::HostUnreachable
            | io::ErrorKind::NetworkUnreachable
            | io::ErrorKind::UnexpectedEof => return ExecHttpError::UnableToReach,
            _ => {}
        }
    }

    if err.is_connect()
        || chain_mentions(err, "connection refused")
        || chain_mentions(err, "unreachable")
        || chain_mentions(err, "no route to host")
        || chain_mentions(err, "connection closed before message completed")
    {
        return ExecHttpError::UnableToReach;
    }

    if err.is_body() || err.is_decode() {
        return ExecHttpError::UnexpectedEnd;
    }

    ExecHttpError::InvalidResponse(err.to_string())
}
