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

use crate::PolicyError;
use chapps_config::FieldAdapter;
use sqlx::Row;

/// Read-only access to the relational policy-config store.
///
/// Writes happen only in the external admin API and CLI; the policies read
/// rows on cache miss and mirror them into Redis.  The trait is the seam
/// that lets `CHAPPS_DB_MODULE` select a backend and lets tests supply a
/// canned one.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    /// The quota (messages per rolling day) of `user`, `None` when the user
    /// is unknown or has no quota assigned.
    async fn quota_for_user(&self, user: &str) -> Result<Option<u64>, PolicyError>;

    /// Is `user` authorized to send from `domain`?
    async fn check_domain_for_user(
        &self,
        user: &str,
        domain: &str,
    ) -> Result<bool, PolicyError>;

    /// Is `user` authorized to send as the whole address `email`?
    async fn check_email_for_user(
        &self,
        user: &str,
        email: &str,
    ) -> Result<bool, PolicyError>;

    /// Is greylisting enforced for inbound mail to `domain`?
    async fn greylisting_on(&self, domain: &str) -> Result<bool, PolicyError>;

    /// Is SPF checking enforced for inbound mail to `domain`?
    async fn check_spf_on(&self, domain: &str) -> Result<bool, PolicyError>;
}

const QUOTA_QUERY: &str = "SELECT q.quota FROM quotas AS q \
     JOIN quota_user AS j ON q.id = j.quota_id \
     JOIN users AS u ON u.id = j.user_id \
     WHERE u.name = ?";

const CHECK_DOMAIN_QUERY: &str = "SELECT COUNT(d.name) FROM domains AS d \
     JOIN domain_user AS j ON d.id = j.domain_id \
     JOIN users AS u ON u.id = j.user_id \
     WHERE d.name = ? AND u.name = ?";

const CHECK_EMAIL_QUERY: &str = "SELECT COUNT(e.name) FROM emails AS e \
     JOIN email_user AS j ON e.id = j.email_id \
     JOIN users AS u ON u.id = j.user_id \
     WHERE e.name = ? AND u.name = ?";

const DOMAIN_FLAG_QUERY: &str = "SELECT greylist, check_spf FROM domains WHERE name = ?";

const RETRY_BACKOFF: std::time::Duration = std::time::Duration::from_millis(250);

/// `sqlx`-backed store for MySQL / MariaDB.
///
/// Every lookup is retried once after a short backoff before the failure is
/// surfaced as [`PolicyError::AdapterUnavailable`].
pub struct SqlPolicyStore {
    pool: sqlx::MySqlPool,
}

impl SqlPolicyStore {
    /// Prepare a lazily-connecting pool from `[PolicyConfigAdapter]`.
    ///
    /// # Errors
    ///
    /// * the connection URL assembled from the config is invalid
    pub fn connect(cfg: &FieldAdapter) -> Result<Self, PolicyError> {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .max_connections(8)
            .acquire_timeout(std::time::Duration::from_secs(5))
            .connect_lazy(&cfg.url())
            .map_err(PolicyError::AdapterUnavailable)?;
        Ok(Self { pool })
    }

    async fn retry_once<'a, T, F, Fut>(&'a self, query: F) -> Result<T, PolicyError>
    where
        F: Fn(&'a sqlx::MySqlPool) -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>> + 'a,
    {
        match query(&self.pool).await {
            Ok(value) => Ok(value),
            Err(error) => {
                tracing::warn!(%error, "Policy store query failed, retrying once.");
                tokio::time::sleep(RETRY_BACKOFF).await;
                query(&self.pool)
                    .await
                    .map_err(PolicyError::AdapterUnavailable)
            }
        }
    }

    async fn domain_flag(&self, domain: &str, column: &str) -> Result<bool, PolicyError> {
        let row = self
            .retry_once(|pool| {
                sqlx::query(DOMAIN_FLAG_QUERY)
                    .bind(domain)
                    .fetch_optional(pool)
            })
            .await;
        match row {
            Ok(Some(row)) => Ok(row.try_get::<bool, _>(column).unwrap_or(false)),
            Ok(None) => Ok(false),
            // schemas predating the flag columns make the server refuse the
            // query; inbound enforcement reads as "off" there
            Err(PolicyError::AdapterUnavailable(sqlx::Error::Database(error))) => {
                tracing::warn!(%error, domain, "Domain flag query refused, treating as not enforced.");
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }
}

#[async_trait::async_trait]
impl PolicyStore for SqlPolicyStore {
    async fn quota_for_user(&self, user: &str) -> Result<Option<u64>, PolicyError> {
        let quota = self
            .retry_once(|pool| {
                sqlx::query_scalar::<_, i64>(QUOTA_QUERY)
                    .bind(user)
                    .fetch_optional(pool)
            })
            .await?;
        Ok(quota.map(|q| u64::try_from(q).unwrap_or(0)))
    }

    async fn check_domain_for_user(
        &self,
        user: &str,
        domain: &str,
    ) -> Result<bool, PolicyError> {
        let matches = self
            .retry_once(|pool| {
                sqlx::query_scalar::<_, i64>(CHECK_DOMAIN_QUERY)
                    .bind(domain)
                    .bind(user)
                    .fetch_one(pool)
            })
            .await?;
        Ok(matches > 0)
    }

    async fn check_email_for_user(
        &self,
        user: &str,
        email: &str,
    ) -> Result<bool, PolicyError> {
        let matches = self
            .retry_once(|pool| {
                sqlx::query_scalar::<_, i64>(CHECK_EMAIL_QUERY)
                    .bind(email)
                    .bind(user)
                    .fetch_one(pool)
            })
            .await?;
        Ok(matches > 0)
    }

    async fn greylisting_on(&self, domain: &str) -> Result<bool, PolicyError> {
        self.domain_flag(domain, "greylist").await
    }

    async fn check_spf_on(&self, domain: &str) -> Result<bool, PolicyError> {
        self.domain_flag(domain, "check_spf").await
    }
}
