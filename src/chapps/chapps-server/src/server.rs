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

use crate::session::{serve, SessionParams};
use anyhow::Context as _;

/// TCP/IP server: one listener, one spawned session per Postfix
/// connection.
pub struct Server {
    listener: tokio::net::TcpListener,
    params: SessionParams,
}

impl Server {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// * failed to bind to the socket address
    pub async fn bind(
        address: &str,
        port: u16,
        params: SessionParams,
    ) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind((address, port))
            .await
            .with_context(|| format!("Failed to bind socket on addr: '{address}:{port}'"))?;
        Ok(Self { listener, params })
    }

    /// The address actually bound, for logs and tests.
    ///
    /// # Errors
    ///
    /// * the socket has no local address
    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept until shutdown is raised.  Sessions run detached; they watch
    /// the same shutdown channel and drain themselves.
    #[tracing::instrument(skip_all)]
    pub async fn listen(self) -> anyhow::Result<()> {
        let mut shutdown = self.params.shutdown.clone();
        let mut shutdown_wired = true;
        tracing::info!(
            interface = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "Listening for policy requests.",
        );

        loop {
            let accepted = if shutdown_wired {
                tokio::select! {
                    accepted = self.listener.accept() => accepted,
                    changed = shutdown.changed() => {
                        shutdown_wired = changed.is_ok();
                        if shutdown_wired && *shutdown.borrow() {
                            tracing::info!("Shutdown requested, no longer accepting.");
                            return Ok(());
                        }
                        continue;
                    }
                }
            } else {
                self.listener.accept().await
            };

            match accepted {
                Ok((stream, client_addr)) => {
                    tracing::debug!(client = %client_addr, "Connection accepted.");
                    let params = self.params.clone();
                    tokio::spawn(async move {
                        serve(stream, params).await;
                        tracing::debug!(client = %client_addr, "Connection closed cleanly.");
                    });
                }
                Err(error) => {
                    // transient accept failures (EMFILE and friends) must
                    // not take the listener down
                    tracing::error!(%error, "Accept failed.");
                }
            }
        }
    }
}
