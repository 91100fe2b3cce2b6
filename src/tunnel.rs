// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! One-shot connection adapter for serving inside a CONNECT tunnel.
//!
//! A serve loop written against "accept the next connection" is reused for a
//! single pre-established TLS connection: the first accept yields the
//! connection, every later accept reports [`AlreadyAccepted`], which the
//! serve loop treats as a clean end of the tunnel.

use thiserror::Error;

/// Returned by [`OnceAccept::accept`] once the wrapped connection has been
/// handed out. Filtered from serve-loop error logging.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("connection already accepted")]
pub struct AlreadyAccepted;

/// Wraps a single established connection behind an accept-style interface.
pub struct OnceAccept<T> {
    conn: Option<T>,
}

impl<T> OnceAccept<T> {
    pub fn new(conn: T) -> Self {
        Self { conn: Some(conn) }
    }

    /// Yield the wrapped connection. Subsequent calls fail with
    /// [`AlreadyAccepted`].
    pub fn accept(&mut self) -> Result<T, AlreadyAccepted> {
        self.conn.take().ok_or(AlreadyAccepted)
    }
}
