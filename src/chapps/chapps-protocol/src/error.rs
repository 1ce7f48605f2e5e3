/*
 * CHAPPS Postfix policy delegation service
 * Copyright (C) 2023 Team CHAPPS
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

/// Failure while reading or decoding a policy request.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The peer hung up before the `\n\n` terminator arrived.
    ///
    /// The diagnostics record how far the request got; connection churn
    /// under load shows up as a stream of these with small `bytes_read`.
    #[error(
        "connection closed mid-request after {bytes_read} bytes \
         (last attribute seen: {})",
        last_attribute.as_deref().unwrap_or("<none>")
    )]
    IncompleteRequest {
        /// Bytes buffered when the stream ended.
        bytes_read: usize,
        /// Name of the last complete attribute line, if any.
        last_attribute: Option<String>,
    },

    /// The request grew past the configured cap before terminating.
    #[error("request exceeds {limit} bytes (got at least {got})")]
    RequestTooLarge {
        /// The configured cap.
        limit: usize,
        /// Bytes buffered so far.
        got: usize,
    },

    /// An attribute line without `=`, or with an invalid attribute name.
    #[error("malformed attribute line: {0:?}")]
    InvalidLine(String),

    /// The payload is not valid text in the configured encoding.
    #[error("request payload is not valid utf-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The underlying socket failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
