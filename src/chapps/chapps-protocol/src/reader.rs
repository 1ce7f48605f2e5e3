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

use crate::{Error, PolicyRequest};
use tokio::io::AsyncReadExt;

fn find(bytes: &[u8], search: &[u8]) -> Option<usize> {
    bytes
        .windows(search.len())
        .position(|window| window == search)
}

/// Name of the last complete `name=value\n` line in a partial payload.
fn last_attribute(buffer: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(buffer);
    text.lines()
        .rev()
        .find_map(|line| line.split_once('=').map(|(name, _)| name.to_owned()))
}

/// Buffered reader producing one policy request per `\n\n` terminator.
///
/// Postfix keeps the connection open and sends further requests on it, so
/// the buffer may already hold (part of) the next request when one is
/// yielded.
pub struct Reader<R: tokio::io::AsyncRead + Unpin + Send> {
    inner: R,
    buffer: bytes::BytesMut,
    additional_reserve: usize,
    request_size_max: usize,
}

impl<R: tokio::io::AsyncRead + Unpin + Send> Reader<R> {
    /// Create a reader over `stream` refusing requests above
    /// `request_size_max` bytes.
    #[must_use]
    pub fn new(stream: R, request_size_max: usize) -> Self {
        Self {
            inner: stream,
            buffer: bytes::BytesMut::with_capacity(1024),
            additional_reserve: 512,
            request_size_max,
        }
    }

    /// Consume the instance and return the underlying reader.
    #[must_use]
    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read and decode the next request.
    ///
    /// `Ok(None)` is a clean close: the peer hung up on a request boundary.
    ///
    /// # Errors
    ///
    /// * [`Error::IncompleteRequest`] when the peer hangs up mid-request
    /// * [`Error::RequestTooLarge`] when the cap is exceeded
    /// * decoding errors from [`PolicyRequest::parse`]
    /// * I/O errors from the underlying stream
    pub async fn next_request(&mut self) -> Result<Option<PolicyRequest>, Error> {
        loop {
            if let Some(pos) = find(&self.buffer, b"\n\n") {
                // drop the payload either way so the stream stays in sync
                let payload = self.buffer.split_to(pos + 2);
                if payload.len() > self.request_size_max {
                    return Err(Error::RequestTooLarge {
                        limit: self.request_size_max,
                        got: payload.len(),
                    });
                }
                return PolicyRequest::parse(&payload).map(Some);
            }
            if self.buffer.len() > self.request_size_max {
                return Err(Error::RequestTooLarge {
                    limit: self.request_size_max,
                    got: self.buffer.len(),
                });
            }

            self.buffer.reserve(self.additional_reserve);
            let read_size = self.inner.read_buf(&mut self.buffer).await?;
            if read_size == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(Error::IncompleteRequest {
                    bytes_read: self.buffer.len(),
                    last_attribute: last_attribute(&self.buffer),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Reader;
    use crate::Error;

    const REQUEST: &str = "request=smtpd_access_policy\n\
                           sender=caleb@chapps.io\n\
                           instance=abc.123\n\
                           \n";

    #[tokio::test]
    async fn reads_a_single_request() {
        let cursor = std::io::Cursor::new(REQUEST.to_owned());
        let mut reader = Reader::new(cursor, crate::DEFAULT_REQUEST_SIZE_MAX);

        let ppr = reader.next_request().await.unwrap().unwrap();
        assert_eq!(ppr.sender(), Some("caleb@chapps.io"));
        assert!(reader.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reads_consecutive_requests_from_one_connection() {
        let two = format!("{REQUEST}{}", REQUEST.replace("abc.123", "abc.124"));
        let cursor = std::io::Cursor::new(two);
        let mut reader = Reader::new(cursor, crate::DEFAULT_REQUEST_SIZE_MAX);

        let first = reader.next_request().await.unwrap().unwrap();
        let second = reader.next_request().await.unwrap().unwrap();
        assert_eq!(first.instance(), Some("abc.123"));
        assert_eq!(second.instance(), Some("abc.124"));
        assert!(reader.next_request().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_request_reports_diagnostics() {
        let cursor = std::io::Cursor::new("sender=caleb@chapps.io\nrecipie".to_owned());
        let mut reader = Reader::new(cursor, crate::DEFAULT_REQUEST_SIZE_MAX);

        match reader.next_request().await {
            Err(Error::IncompleteRequest {
                bytes_read,
                last_attribute,
            }) => {
                assert_eq!(bytes_read, 30);
                assert_eq!(last_attribute.as_deref(), Some("sender"));
            }
            other => panic!("expected IncompleteRequest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_requests_are_refused() {
        let flood = format!("junk={}\n\n", "x".repeat(256));
        let cursor = std::io::Cursor::new(flood);
        let mut reader = Reader::new(cursor, 64);

        assert!(matches!(
            reader.next_request().await,
            Err(Error::RequestTooLarge { limit: 64, .. })
        ));
    }
}
