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
use tokio::io::AsyncWriteExt;

/// Sink for sending the decision back to Postfix.
pub struct Writer<W: tokio::io::AsyncWrite + Unpin + Send> {
    inner: W,
}

impl<W: tokio::io::AsyncWrite + Unpin + Send> Writer<W> {
    /// Create a new instance.
    #[must_use]
    pub const fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Consume the instance and return the underlying writer.
    #[must_use]
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Send one `action=<directive>\n\n` response.
    ///
    /// # Errors
    ///
    /// * [`std::io::Error`] produced by the underlying writer
    pub async fn send_action(&mut self, action: &Action) -> std::io::Result<()> {
        let response = format!("action={action}\n\n");
        tracing::trace!(">> {:?}", response);
        self.inner.write_all(response.as_bytes()).await?;
        self.inner.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::Writer;
    use chapps_common::Action;

    #[tokio::test]
    async fn response_framing() {
        let mut writer = Writer::new(Vec::new());
        writer.send_action(&Action::Dunno).await.unwrap();
        writer
            .send_action(&Action::DeferIfPermit(
                "Service temporarily unavailable - greylisted".to_owned(),
            ))
            .await
            .unwrap();

        assert_eq!(
            writer.into_inner(),
            b"action=DUNNO\n\n\
              action=DEFER_IF_PERMIT Service temporarily unavailable - greylisted\n\n"
        );
    }
}
