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

/// Failure surfaced by a policy to the pipeline.
///
/// Policies resolve ordinary negative outcomes (no quota, unauthorized
/// sender, unknown tuple) into [`chapps_common::Status::Deny`] themselves;
/// only conditions the pipeline must translate into a fallback or special
/// response become errors.
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// No user-identifier could be extracted from the request.
    #[error("no user-identifier found in request (keys tried: {tried:?})")]
    AuthenticationFailed {
        /// Attribute names that were consulted, in order.
        tried: Vec<String>,
    },

    /// The relational policy-config store could not be reached, even after
    /// the retry.
    #[error("policy-config store unavailable: {0}")]
    AdapterUnavailable(#[source] sqlx::Error),

    /// Redis could not be reached, or an operation overran its budget.
    #[error("cache unavailable: {0}")]
    CacheUnavailable(String),
}

impl From<redis::RedisError> for PolicyError {
    fn from(error: redis::RedisError) -> Self {
        Self::CacheUnavailable(error.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for PolicyError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::CacheUnavailable("operation timed out".to_owned())
    }
}
