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
    cache::{rediskey, Cache},
    handler::Policy,
    store::PolicyStore,
    user::extract_user,
    PolicyError,
};
use chapps_common::{domain_part, Status};
use chapps_config::{FieldChapps, FieldSenderAuth};
use chapps_protocol::PolicyRequest;

const PREFIX: &str = "sda";
const CACHE_TTL: u64 = 86_400;

/// State of one cached authorization entry, for the admin surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdaStatus {
    /// Nothing cached; the next probe reads the store.
    None,
    /// Cached `"0"`: prohibited.
    Prohibited,
    /// Cached `"1"`: authorized.
    Authorized,
}

fn decode_cached(value: Option<&str>) -> SdaStatus {
    match value {
        None => SdaStatus::None,
        Some("1") => SdaStatus::Authorized,
        Some(_) => SdaStatus::Prohibited,
    }
}

/// How one request's verdict came about, driving both the answer and which
/// keys get mirrored back into Redis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthResolution {
    /// No sender address; configuration alone decides.
    NullSender {
        /// Whether `null_sender_ok` lets the mail pass.
        allowed: bool,
    },
    /// A cached `"1"`/`"0"` answered; nothing to write.
    Cached(bool),
    /// The store matched the whole address; mirror `"1"` at both keys.
    EmailMatch,
    /// The store matched the domain only; mirror `"1"` at the domain key.
    DomainMatch,
    /// Nothing matched; mirror `"0"` at both keys and refuse.
    Unauthorized,
}

impl AuthResolution {
    const fn allowed(self) -> bool {
        matches!(
            self,
            Self::NullSender { allowed: true } | Self::Cached(true) | Self::EmailMatch | Self::DomainMatch
        )
    }
}

/// Pure authorization decision: the email cache is probed before the domain
/// cache, and the store results only count on a full cache miss, mirroring
/// the lookup order on the wire.
fn resolve(
    has_sender: bool,
    null_sender_ok: bool,
    cached_email: Option<bool>,
    cached_domain: Option<bool>,
    store_email: bool,
    store_domain: bool,
) -> AuthResolution {
    if !has_sender {
        return AuthResolution::NullSender {
            allowed: null_sender_ok,
        };
    }
    match (cached_email, cached_domain) {
        (Some(allowed), _) | (None, Some(allowed)) => AuthResolution::Cached(allowed),
        (None, None) if store_email => AuthResolution::EmailMatch,
        (None, None) if store_domain => AuthResolution::DomainMatch,
        (None, None) => AuthResolution::Unauthorized,
    }
}

/// Sender-domain authorization: may this user send as that address?
///
/// Two kinds of match, in order: the whole `sender` address against the
/// user's **Email** associations, then the domain part against the user's
/// **Domain** associations.  Verdicts are mirrored at
/// `sda:<user>:<sender-or-domain>` as `"1"`/`"0"` so the store is read at
/// most once a day per pair; the admin tooling invalidates by deleting the
/// key.
pub struct SenderDomainAuthPolicy {
    cache: std::sync::Arc<Cache>,
    store: std::sync::Arc<dyn PolicyStore>,
    chapps: FieldChapps,
    params: FieldSenderAuth,
}

impl SenderDomainAuthPolicy {
    /// Assemble the policy from the shared state handles and its config
    /// section.
    #[must_use]
    pub fn new(
        cache: std::sync::Arc<Cache>,
        store: std::sync::Arc<dyn PolicyStore>,
        chapps: FieldChapps,
        params: FieldSenderAuth,
    ) -> Self {
        Self {
            cache,
            store,
            chapps,
            params,
        }
    }

    fn auth_key(user: &str, subject: &str) -> String {
        rediskey(PREFIX, &[user, subject])
    }

    async fn cached_verdict(
        &self,
        user: &str,
        subject: &str,
    ) -> Result<Option<bool>, PolicyError> {
        Ok(self
            .cache
            .get(&Self::auth_key(user, subject))
            .await?
            .map(|v| v == "1"))
    }

    async fn store_verdict(
        &self,
        user: &str,
        subject: &str,
        allowed: bool,
    ) -> Result<(), PolicyError> {
        self.cache
            .set_ex(
                &Self::auth_key(user, subject),
                if allowed { "1" } else { "0" },
                CACHE_TTL,
            )
            .await
    }

    /// Peek at one cached entry without touching the store.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn check_policy_cache(
        &self,
        user: &str,
        subject: &str,
    ) -> Result<SdaStatus, PolicyError> {
        let value = self.cache.get(&Self::auth_key(user, subject)).await?;
        Ok(decode_cached(value.as_deref()))
    }

    /// Remove one cached entry, returning what was there.  The next probe
    /// for the pair re-reads the store.
    ///
    /// # Errors
    ///
    /// * [`PolicyError::CacheUnavailable`]
    pub async fn clear_policy_cache(
        &self,
        user: &str,
        subject: &str,
    ) -> Result<SdaStatus, PolicyError> {
        let previous = self.check_policy_cache(user, subject).await?;
        if previous != SdaStatus::None {
            self.cache.delete(&Self::auth_key(user, subject)).await?;
        }
        Ok(previous)
    }

    async fn evaluate(&self, request: &PolicyRequest) -> Result<Status, PolicyError> {
        let user = extract_user(request, &self.chapps)?;

        let Some(sender) = request.sender() else {
            let resolution =
                resolve(false, self.params.null_sender_ok, None, None, false, false);
            return Ok(self.verdict(resolution.allowed()));
        };
        let domain = domain_part(sender);

        // probe the caches: whole address first, then its domain
        let cached_email = self.cached_verdict(&user, sender).await?;
        let cached_domain = match (cached_email, domain) {
            (None, Some(domain)) => self.cached_verdict(&user, domain).await?,
            _ => None,
        };

        // only a full miss asks the store, email association first
        let (store_email, store_domain) =
            if cached_email.is_none() && cached_domain.is_none() {
                let email = self.store.check_email_for_user(&user, sender).await?;
                let domain_match = match (email, domain) {
                    (false, Some(domain)) => {
                        self.store.check_domain_for_user(&user, domain).await?
                    }
                    _ => false,
                };
                (email, domain_match)
            } else {
                (false, false)
            };

        let resolution = resolve(
            true,
            self.params.null_sender_ok,
            cached_email,
            cached_domain,
            store_email,
            store_domain,
        );

        // mirror what the store said so the next probe stays in Redis
        match resolution {
            AuthResolution::Cached(allowed) => {
                tracing::debug!(%user, sender, allowed, "Cached verdict.");
            }
            AuthResolution::EmailMatch => {
                self.store_verdict(&user, sender, true).await?;
                if let Some(domain) = domain {
                    self.store_verdict(&user, domain, true).await?;
                }
            }
            AuthResolution::DomainMatch => {
                if let Some(domain) = domain {
                    self.store_verdict(&user, domain, true).await?;
                }
            }
            AuthResolution::Unauthorized => {
                if let Some(domain) = domain {
                    self.store_verdict(&user, domain, false).await?;
                }
                self.store_verdict(&user, sender, false).await?;
                tracing::info!(%user, sender, %request, "Sender not authorized.");
            }
            AuthResolution::NullSender { .. } => {}
        }

        Ok(self.verdict(resolution.allowed()))
    }

    fn verdict(&self, allowed: bool) -> Status {
        if allowed {
            Status::Next(self.params.acceptance_message.clone())
        } else {
            Status::Deny(self.params.rejection_message.clone())
        }
    }
}

#[async_trait::async_trait]
impl Policy for SenderDomainAuthPolicy {
    fn name(&self) -> &'static str {
        "SenderDomainAuthPolicy"
    }

    async fn approve(&self, request: &PolicyRequest) -> Result<Status, PolicyError> {
        self.evaluate(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::{
        decode_cached, resolve, AuthResolution, SdaStatus, SenderDomainAuthPolicy,
    };

    #[test]
    fn cache_values_decode_to_three_states() {
        assert_eq!(decode_cached(None), SdaStatus::None);
        assert_eq!(decode_cached(Some("1")), SdaStatus::Authorized);
        assert_eq!(decode_cached(Some("0")), SdaStatus::Prohibited);
    }

    #[test]
    fn email_and_domain_share_the_key_shape() {
        assert_eq!(
            SenderDomainAuthPolicy::auth_key("bob", "ok.com"),
            "sda:bob:ok.com"
        );
        assert_eq!(
            SenderDomainAuthPolicy::auth_key("bob", "x@ok.com"),
            "sda:bob:x@ok.com"
        );
    }

    #[test]
    fn null_sender_is_decided_by_configuration_alone() {
        let allowed = resolve(false, true, None, None, false, false);
        assert_eq!(allowed, AuthResolution::NullSender { allowed: true });
        assert!(allowed.allowed());

        // cache and store inputs carry no weight for the null sender
        let refused = resolve(false, false, Some(true), Some(true), true, true);
        assert_eq!(refused, AuthResolution::NullSender { allowed: false });
        assert!(!refused.allowed());
    }

    #[test]
    fn cache_hits_answer_without_the_store() {
        assert_eq!(
            resolve(true, false, Some(true), None, false, false),
            AuthResolution::Cached(true)
        );
        // a cached refusal at the email key wins over everything later
        assert_eq!(
            resolve(true, false, Some(false), Some(true), true, true),
            AuthResolution::Cached(false)
        );
        assert_eq!(
            resolve(true, false, None, Some(false), true, true),
            AuthResolution::Cached(false)
        );
    }

    #[test]
    fn store_matches_name_the_keys_to_mirror() {
        let email = resolve(true, false, None, None, true, false);
        assert_eq!(email, AuthResolution::EmailMatch);
        assert!(email.allowed());

        let domain = resolve(true, false, None, None, false, true);
        assert_eq!(domain, AuthResolution::DomainMatch);
        assert!(domain.allowed());
    }

    #[test]
    fn a_full_miss_refuses() {
        let missed = resolve(true, false, None, None, false, false);
        assert_eq!(missed, AuthResolution::Unauthorized);
        assert!(!missed.allowed());
    }
}
