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
use chapps_config::FieldRedis;
use redis::{aio::ConnectionLike, AsyncCommands};

/// Seconds since the UNIX epoch, the score unit of every sliding window.
#[must_use]
#[allow(clippy::missing_panics_doc)] // the epoch is not in the future
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock set before the unix epoch")
        .as_secs()
}

/// Join a policy key prefix and its components with `:`.
///
/// Each policy owns its prefix exclusively; the resulting names are part of
/// the external contract consumed by the admin tooling.
#[must_use]
pub fn rediskey(prefix: &str, parts: &[&str]) -> String {
    let mut key = String::from(prefix);
    for part in parts {
        key.push(':');
        key.push_str(part);
    }
    key
}

enum Backend {
    /// One shared auto-reconnecting connection to a fixed server.
    Direct(redis::aio::ConnectionManager),
    /// Connections are obtained through Sentinel so the logical master can
    /// move under us.
    Sentinel(tokio::sync::Mutex<redis::sentinel::SentinelClient>),
}

enum Conn {
    Managed(redis::aio::ConnectionManager),
    Multiplexed(redis::aio::MultiplexedConnection),
}

impl ConnectionLike for Conn {
    fn req_packed_command<'a>(
        &'a mut self,
        cmd: &'a redis::Cmd,
    ) -> redis::RedisFuture<'a, redis::Value> {
        match self {
            Self::Managed(c) => c.req_packed_command(cmd),
            Self::Multiplexed(c) => c.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a redis::Pipeline,
        offset: usize,
        count: usize,
    ) -> redis::RedisFuture<'a, Vec<redis::Value>> {
        match self {
            Self::Managed(c) => c.req_packed_commands(cmd, offset, count),
            Self::Multiplexed(c) => c.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Self::Managed(c) => c.get_db(),
            Self::Multiplexed(c) => c.get_db(),
        }
    }
}

/// The Redis handle shared by every policy of a service process.
///
/// All operations run under the configured per-op timeout and surface
/// failures as [`PolicyError::CacheUnavailable`], which the pipeline turns
/// into the fallback action: losing the cache degrades decisions, it never
/// stops mail.
pub struct Cache {
    backend: Backend,
    op_timeout: std::time::Duration,
}

impl Cache {
    /// Connect according to `[Redis]`: Sentinel when `sentinel_servers` is
    /// set, a plain server otherwise.
    ///
    /// # Errors
    ///
    /// * the server/Sentinel addresses are unusable or unreachable
    pub async fn connect(cfg: &FieldRedis) -> Result<Self, PolicyError> {
        let backend = if cfg.sentinel_servers.is_empty() {
            let client =
                redis::Client::open(format!("redis://{}:{}", cfg.server, cfg.port))?;
            Backend::Direct(redis::aio::ConnectionManager::new(client).await?)
        } else {
            let urls = cfg
                .sentinel_servers
                .iter()
                .map(|addr| format!("redis://{addr}"))
                .collect::<Vec<_>>();
            Backend::Sentinel(tokio::sync::Mutex::new(
                redis::sentinel::SentinelClient::build(
                    urls,
                    cfg.sentinel_dataset.clone(),
                    None,
                    redis::sentinel::SentinelServerType::Master,
                )?,
            ))
        };
        Ok(Self {
            backend,
            op_timeout: cfg.op_timeout,
        })
    }

    async fn conn(&self) -> Result<Conn, PolicyError> {
        match &self.backend {
            Backend::Direct(manager) => Ok(Conn::Managed(manager.clone())),
            Backend::Sentinel(client) => {
                let mut client = client.lock().await;
                let conn = tokio::time::timeout(
                    self.op_timeout,
                    client.get_async_connection(),
                )
                .await??;
                Ok(Conn::Multiplexed(conn))
            }
        }
    }

    async fn run<T>(
        &self,
        op: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T, PolicyError> {
        Ok(tokio::time::timeout(self.op_timeout, op).await??)
    }

    /// `GET key`, `None` on a missing key.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn get(&self, key: &str) -> Result<Option<String>, PolicyError> {
        let mut conn = self.conn().await?;
        self.run(conn.get(key)).await
    }

    /// `SET key value EX ttl`.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn set_ex(&self, key: &str, value: &str, ttl: u64) -> Result<(), PolicyError> {
        let mut conn = self.conn().await?;
        self.run(conn.set_ex(key, value, ttl)).await
    }

    /// `SET key value NX EX ttl`; whether this call created the key.
    ///
    /// Two concurrent first-sightings of a greylisting tuple race here, and
    /// exactly one of them wins.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn set_nx_ex(
        &self,
        key: &str,
        value: &str,
        ttl: u64,
    ) -> Result<bool, PolicyError> {
        let mut conn = self.conn().await?;
        let created: Option<String> = self
            .run(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(created.is_some())
    }

    /// `DEL key`; whether the key existed.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn delete(&self, key: &str) -> Result<bool, PolicyError> {
        let mut conn = self.conn().await?;
        let removed: u64 = self.run(conn.del(key)).await?;
        Ok(removed > 0)
    }

    /// Trim a sorted-set window to `[now - window, now]`, refresh its TTL
    /// and return its cardinality.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn window_tally(
        &self,
        key: &str,
        now: u64,
        window: u64,
    ) -> Result<u64, PolicyError> {
        let mut conn = self.conn().await?;
        let (_, tally, _): ((), u64, ()) = self
            .run(
                redis::pipe()
                    .atomic()
                    .zrembyscore(key, 0, now.saturating_sub(window))
                    .zcard(key)
                    .expire(key, window as i64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(tally)
    }

    /// Record `member` in a sliding window at score `now`, optionally
    /// trimming the set down to its newest `keep + 1` members (one extra so
    /// the tally never flaps around a threshold of `keep`).
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn window_append(
        &self,
        key: &str,
        member: &str,
        now: u64,
        window: u64,
        keep: Option<u64>,
    ) -> Result<(), PolicyError> {
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        pipe.atomic().zadd(key, member, now).ignore();
        if let Some(keep) = keep {
            let oldest = isize::try_from(keep + 2).map_or(isize::MIN, |k| -k);
            pipe.zremrangebyrank(key, 0, oldest).ignore();
        }
        pipe.expire(key, window as i64).ignore();
        self.run(pipe.query_async::<_, ()>(&mut conn)).await
    }

    /// Newest member of a window with its score.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn window_last(
        &self,
        key: &str,
    ) -> Result<Option<(String, f64)>, PolicyError> {
        let mut conn = self.conn().await?;
        let newest: Vec<(String, f64)> = self
            .run(
                redis::cmd("ZRANGE")
                    .arg(key)
                    .arg(-1)
                    .arg(-1)
                    .arg("WITHSCORES")
                    .query_async(&mut conn),
            )
            .await?;
        Ok(newest.into_iter().next())
    }

    /// Drop a window entirely, returning how many members it held.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn window_drop(&self, key: &str) -> Result<u64, PolicyError> {
        let mut conn = self.conn().await?;
        let (dropped, _): (u64, ()) = self
            .run(
                redis::pipe()
                    .atomic()
                    .zcard(key)
                    .del(key)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(dropped)
    }

    /// Run a server-side script, the policies' tool for multi-step atomic
    /// updates.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn invoke_script<T: redis::FromRedisValue + Send>(
        &self,
        invocation: &redis::ScriptInvocation<'_>,
    ) -> Result<T, PolicyError> {
        let mut conn = self.conn().await?;
        self.run(invocation.invoke_async(&mut conn)).await
    }
}

#[cfg(test)]
mod tests {
    use super::rediskey;

    #[test]
    fn keys_are_colon_joined_under_the_prefix() {
        assert_eq!(rediskey("oqp", &["caleb@chapps.io", "attempts"]),
            "oqp:caleb@chapps.io:attempts");
        assert_eq!(rediskey("grl", &[]), "grl");
        assert_eq!(
            rediskey("grl", &["tuple", "10.10.10.10", "a@x.tld", "b@y.tld"]),
            "grl:tuple:10.10.10.10:a@x.tld:b@y.tld"
        );
    }
}
