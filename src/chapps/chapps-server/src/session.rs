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

use chapps_common::Action;
use chapps_policy::CascadingPolicyHandler;
use chapps_protocol::{Error, Reader, Writer};

/// Everything one connection task needs, shared by value.
#[derive(Clone)]
pub struct SessionParams {
    /// Current pipeline; `SIGHUP` swaps the inner snapshot.
    pub handler: tokio::sync::watch::Receiver<std::sync::Arc<CascadingPolicyHandler>>,
    /// Raised on `SIGTERM`: finish the in-flight request, then leave.
    pub shutdown: tokio::sync::watch::Receiver<bool>,
    /// Per-request processing ceiling.
    pub request_budget: std::time::Duration,
    /// Per-request size cap.
    pub request_size_max: usize,
    /// What to answer when nothing better can be said.
    pub fallback: Action,
}

/// Serve one Postfix connection: read a request, dispatch it, write the
/// action, repeat until the peer hangs up.
///
/// Requests on one connection are handled strictly in order, which Postfix
/// requires.  Nothing that happens in here may take the process down;
/// anything unanswerable gets the fallback action and a log line.
pub async fn serve<S>(stream: S, mut params: SessionParams)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = Reader::new(read_half, params.request_size_max);
    let mut writer = Writer::new(write_half);
    // once the sender side is gone no shutdown can ever arrive; stop
    // polling the channel or the select would spin on its closed state
    let mut shutdown_wired = true;

    loop {
        if *params.shutdown.borrow() {
            tracing::debug!("Draining, closing connection.");
            return;
        }

        let request = if shutdown_wired {
            tokio::select! {
                request = reader.next_request() => request,
                changed = params.shutdown.changed() => {
                    shutdown_wired = changed.is_ok();
                    continue;
                }
            }
        } else {
            reader.next_request().await
        };

        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => {
                tracing::debug!("Postfix said goodbye.");
                return;
            }
            Err(error @ Error::IncompleteRequest { .. }) => {
                // the peer is gone; the fallback write is best-effort
                tracing::warn!(%error, "Postfix hung up mid-request.");
                let _ = writer.send_action(&params.fallback).await;
                return;
            }
            Err(error @ (Error::InvalidLine(_) | Error::InvalidUtf8(_))) => {
                // the terminator was seen, the stream is still in sync
                tracing::warn!(%error, "Undecodable request, answering fallback.");
                if writer.send_action(&params.fallback).await.is_err() {
                    return;
                }
                continue;
            }
            Err(error @ Error::RequestTooLarge { .. }) => {
                tracing::warn!(%error, "Oversized request, closing connection.");
                let _ = writer.send_action(&params.fallback).await;
                return;
            }
            Err(Error::Io(error)) => {
                tracing::debug!(%error, "Connection lost.");
                return;
            }
            Err(error) => {
                tracing::error!(%error, "Unexpected protocol failure.");
                let _ = writer.send_action(&params.fallback).await;
                return;
            }
        };

        let handler = params.handler.borrow().clone();
        let action = match tokio::time::timeout(
            params.request_budget,
            handler.handle(&request),
        )
        .await
        {
            Ok(action) => action,
            Err(_) => {
                tracing::error!(
                    budget = ?params.request_budget,
                    %request,
                    "Request budget exceeded, answering fallback.",
                );
                params.fallback.clone()
            }
        };

        if let Err(error) = writer.send_action(&action).await {
            tracing::warn!(%error, "Could not deliver action, closing connection.");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{serve, SessionParams};
    use chapps_common::{Action, Status};
    use chapps_policy::{CascadingPolicyHandler, Policy, PolicyError};
    use chapps_protocol::PolicyRequest;
    use std::sync::Arc;

    struct Fixed(Status);

    #[async_trait::async_trait]
    impl Policy for Fixed {
        fn name(&self) -> &'static str {
            "Fixed"
        }

        async fn approve(&self, _: &PolicyRequest) -> Result<Status, PolicyError> {
            Ok(self.0.clone())
        }
    }

    fn params(status: Status) -> SessionParams {
        let handler = Arc::new(CascadingPolicyHandler::new(
            vec![Arc::new(Fixed(status)) as Arc<dyn Policy>],
            Action::Reject(None),
        ));
        let (_handler_tx, handler_rx) = tokio::sync::watch::channel(handler);
        let (_shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        SessionParams {
            handler: handler_rx,
            shutdown: shutdown_rx,
            request_budget: std::time::Duration::from_secs(10),
            request_size_max: chapps_protocol::DEFAULT_REQUEST_SIZE_MAX,
            fallback: Action::Dunno,
        }
    }

    #[tokio::test]
    async fn answers_each_request_in_order() {
        let input = b"instance=a.1\nsender=x@y.tld\n\n\
                      instance=a.2\nsender=x@y.tld\n\n"
            .to_vec();
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let task = tokio::spawn(serve(
            server,
            params(Status::Next(Action::Okay)),
        ));

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client_write.write_all(&input).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut response = String::new();
        client_read.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "action=OK\n\naction=OK\n\n");
        task.await.unwrap();
    }

    #[tokio::test]
    async fn malformed_request_gets_the_fallback_and_the_connection_survives() {
        let input = b"garbage line without equals\n\n\
                      instance=a.3\nsender=x@y.tld\n\n"
            .to_vec();
        let (client, server) = tokio::io::duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client);

        let task = tokio::spawn(serve(
            server,
            params(Status::Deny(Action::Reject(Some("no".to_owned())))),
        ));

        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        client_write.write_all(&input).await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut response = String::new();
        client_read.read_to_string(&mut response).await.unwrap();
        assert_eq!(response, "action=DUNNO\n\naction=REJECT no\n\n");
        task.await.unwrap();
    }
}
