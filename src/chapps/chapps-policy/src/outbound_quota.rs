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

use crate::{
    cache::{rediskey, unix_now, Cache},
    handler::Policy,
    store::PolicyStore,
    user::extract_user,
    PolicyError,
};
use chapps_common::Status;
use chapps_config::{FieldChapps, FieldOutboundQuota};
use chapps_protocol::PolicyRequest;

const PREFIX: &str = "oqp";

/// Length of the rolling accounting window, in seconds.
pub const INTERVAL: u64 = 86_400;

/// Trim the attempt log to the window, throttle if `min_delta` asks for it,
/// then accept-and-record or refuse, all in one atomic round-trip; two nodes
/// racing on the same user cannot both squeeze past the allowance.
///
/// KEYS[1]   attempts log
/// ARGV[1]   now (epoch seconds)
/// ARGV[2]   window length
/// ARGV[3]   allowance (limit + effective margin)
/// ARGV[4]   min_delta (0 = off)
/// ARGV[5..] member ids to record, one per counted recipient
const ACCEPT_SCRIPT: &str = r"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local allowance = tonumber(ARGV[3])
local min_delta = tonumber(ARGV[4])
redis.call('ZREMRANGEBYSCORE', KEYS[1], 0, now - window)
local used = redis.call('ZCARD', KEYS[1])
if min_delta > 0 and used > 0 then
  local newest = redis.call('ZRANGE', KEYS[1], -1, -1, 'WITHSCORES')
  if now - tonumber(newest[2]) < min_delta then
    redis.call('ZADD', KEYS[1], 'XX', now, newest[1])
    redis.call('EXPIRE', KEYS[1], window)
    return {0, used}
  end
end
if used + #ARGV - 4 <= allowance then
  for i = 5, #ARGV do
    redis.call('ZADD', KEYS[1], now, ARGV[i])
  end
  redis.call('EXPIRE', KEYS[1], window)
  return {1, used + #ARGV - 4}
end
redis.call('EXPIRE', KEYS[1], window)
return {0, used}
";

/// Rolling outbound-quota manager.
///
/// Counts transmission attempts over the last 24 hours in
/// `oqp:<user>:attempts` and refuses mail once the count would pass the
/// user's limit plus the configured grace margin.  The limit itself lives in
/// the relational store and is mirrored at `oqp:<user>:limit`.
pub struct OutboundQuotaPolicy {
    cache: std::sync::Arc<Cache>,
    store: std::sync::Arc<dyn PolicyStore>,
    chapps: FieldChapps,
    params: FieldOutboundQuota,
    script: redis::Script,
}

impl OutboundQuotaPolicy {
    /// Assemble the policy from the shared state handles and its config
    /// section.
    #[must_use]
    pub fn new(
        cache: std::sync::Arc<Cache>,
        store: std::sync::Arc<dyn PolicyStore>,
        chapps: FieldChapps,
        params: FieldOutboundQuota,
    ) -> Self {
        Self {
            cache,
            store,
            chapps,
            params,
            script: redis::Script::new(ACCEPT_SCRIPT),
        }
    }

    fn attempts_key(user: &str) -> String {
        rediskey(PREFIX, &[user, "attempts"])
    }

    fn limit_key(user: &str) -> String {
        rediskey(PREFIX, &[user, "limit"])
    }

    /// Cached limit, read through to the store on miss.  `None` means the
    /// user is unknown or carries no quota, which refuses the mail.
    async fn load_limit(&self, user: &str) -> Result<Option<u64>, PolicyError> {
        let key = Self::limit_key(user);
        if let Some(cached) = self.cache.get(&key).await? {
            if let Ok(limit) = cached.parse::<u64>() {
                return Ok(Some(limit));
            }
            // somebody stored garbage under our key; drop and re-read
            self.cache.delete(&key).await?;
        }
        match self.store.quota_for_user(user).await? {
            Some(limit) => {
                self.cache
                    .set_ex(&key, &limit.to_string(), INTERVAL)
                    .await?;
                Ok(Some(limit))
            }
            None => Ok(None),
        }
    }

    /// How many attempts this request counts for.
    fn recipient_weight(&self, request: &PolicyRequest) -> usize {
        if self.params.counting_recipients {
            request.recipient_count().max(1)
        } else {
            1
        }
    }

    /// Remaining quota of `user` right now, with remarks for the operator.
    ///
    /// Serves the live-inspection surface of the admin API.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn current_quota(
        &self,
        user: &str,
        known_quota: Option<u64>,
    ) -> Result<(i64, Vec<String>), PolicyError> {
        let now = unix_now();
        let used = self
            .cache
            .window_tally(&Self::attempts_key(user), now, INTERVAL)
            .await?;
        let cached_limit = self
            .cache
            .get(&Self::limit_key(user))
            .await?
            .and_then(|v| v.parse::<u64>().ok());
        let limit = cached_limit.or(known_quota);

        let mut remarks = vec![];
        if let Some((_, score)) = self.cache.window_last(&Self::attempts_key(user)).await? {
            remarks.push(format!("Last send attempt was at {}", score as u64));
        }
        if cached_limit.is_none() {
            remarks.push(format!("There is no cached quota limit for {user}."));
        }
        let remaining = match limit {
            Some(limit) => i64::try_from(limit).unwrap_or(i64::MAX)
                - i64::try_from(used).unwrap_or(0),
            None => {
                remarks.push("No limit could be found; returning zero xmits remaining.".to_owned());
                0
            }
        };
        Ok((remaining, remarks))
    }

    /// Drop the attempt log of `user`, returning how many attempts were
    /// forgotten.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn reset_quota(&self, user: &str) -> Result<(u64, Vec<String>), PolicyError> {
        let dropped = self.cache.window_drop(&Self::attempts_key(user)).await?;
        let remark = if dropped > 0 {
            format!("Attempts (quota) reset for {user}: {dropped} xmits dropped")
        } else {
            format!("No attempts to reset for {user}: 0 xmits dropped")
        };
        Ok((dropped, vec![remark]))
    }

    /// Re-prime `oqp:<user>:limit` after the admin API changed the quota.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn refresh_policy_cache(
        &self,
        user: &str,
        quota: u64,
    ) -> Result<(), PolicyError> {
        self.cache
            .set_ex(&Self::limit_key(user), &quota.to_string(), INTERVAL)
            .await
    }

    async fn evaluate(&self, request: &PolicyRequest) -> Result<Status, PolicyError> {
        let user = extract_user(request, &self.chapps)?;

        let Some(limit) = self.load_limit(&user).await? else {
            tracing::info!(%user, %request, "No quota profile, refusing.");
            return Ok(Status::Deny(self.params.rejection_message.clone()));
        };

        let now = unix_now();
        let weight = self.recipient_weight(request);
        let allowance = limit + self.params.margin.effective(limit);
        let members = attempt_members(request.instance(), now, weight);

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(Self::attempts_key(&user))
            .arg(now)
            .arg(INTERVAL)
            .arg(allowance)
            .arg(self.params.min_delta);
        for member in &members {
            invocation.arg(member.as_str());
        }
        let (accepted, used): (u8, u64) = self.cache.invoke_script(&invocation).await?;

        if accepted == 1 {
            tracing::debug!(%user, used, limit, "Within quota.");
            Ok(Status::Next(self.params.acceptance_message.clone()))
        } else {
            tracing::info!(%user, used, limit, allowance, %request, "Quota exhausted.");
            Ok(Status::Deny(self.params.rejection_message.clone()))
        }
    }
}

/// Member ids for the attempt log: the Postfix instance id plus a serial
/// per counted recipient, unique even when one instance is recorded twice
/// in a day.
fn attempt_members(instance: Option<&str>, now: u64, weight: usize) -> Vec<String> {
    let base = instance.map_or_else(|| now.to_string(), str::to_owned);
    (0..weight).map(|i| format!("{base}:{i:05}")).collect()
}

#[async_trait::async_trait]
impl Policy for OutboundQuotaPolicy {
    fn name(&self) -> &'static str {
        "OutboundQuotaPolicy"
    }

    async fn approve(&self, request: &PolicyRequest) -> Result<Status, PolicyError> {
        self.evaluate(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::attempt_members;

    #[test]
    fn one_member_per_counted_recipient() {
        let members = attempt_members(Some("a483.61706bf9.17663.0"), 1_700_000_000, 3);
        assert_eq!(
            members,
            vec![
                "a483.61706bf9.17663.0:00000",
                "a483.61706bf9.17663.0:00001",
                "a483.61706bf9.17663.0:00002",
            ]
        );
    }

    #[test]
    fn missing_instance_falls_back_to_the_clock() {
        assert_eq!(attempt_members(None, 1_700_000_000, 1), vec!["1700000000:00000"]);
    }

    #[test]
    fn script_checks_allowance_not_raw_limit() {
        // limit 10, margin 1, 9 used, 3 recipients: 12 > 11 refuses;
        // the same shape the Lua side computes
        let (used, weight, allowance) = (9_u64, 3_u64, 11_u64);
        assert!(used + weight > allowance);
        let (used, weight, allowance) = (0_u64, 3_u64, 10_u64);
        assert!(used + weight <= allowance);
    }
}
