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
    PolicyError,
};
use chapps_common::{domain_part, Status};
use chapps_config::FieldGreylisting;
use chapps_protocol::PolicyRequest;

const PREFIX: &str = "grl";
const CACHE_TTL: u64 = 86_400;
const OPTION_TTL: u64 = 3_600;

/// Outcome of the greylisting checks, before any Redis write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GreyVerdict {
    /// The client's delivery tally passed the threshold; tuple checks are
    /// skipped entirely.
    Whitelisted,
    /// Some tuple was seen before; the retry earns delivery.
    KnownTuple,
    /// No tuple known; mark them and defer.
    FirstSighting,
}

const fn client_whitelisted(tally: u64, threshold: u64) -> bool {
    threshold > 0 && tally >= threshold
}

/// The decision from the trimmed client tally and the tuple probe;
/// `threshold == 0` switches client whitelisting off.
const fn grey_verdict(tally: u64, threshold: u64, known_tuple: bool) -> GreyVerdict {
    if client_whitelisted(tally, threshold) {
        GreyVerdict::Whitelisted
    } else if known_tuple {
        GreyVerdict::KnownTuple
    } else {
        GreyVerdict::FirstSighting
    }
}

/// Greylisting: defer the first sighting of a `(client-ip, sender,
/// recipient)` tuple and trust the tuple once the remote MTA has retried.
///
/// A tuple key existing means "seen before, therefore deliverable"; the
/// scheme leans on the retry itself, no minimum delay is enforced.  Clients
/// that accumulate `whitelist_threshold` deliveries inside 24 h skip tuple
/// checks entirely.  Enforcement is per recipient domain, gated by the
/// `Domain.greylist` flag mirrored at `grl:opt:<domain>` for an hour.
pub struct GreylistingPolicy {
    cache: std::sync::Arc<Cache>,
    store: std::sync::Arc<dyn PolicyStore>,
    params: FieldGreylisting,
}

impl GreylistingPolicy {
    /// Assemble the policy from the shared state handles and its config
    /// section.
    #[must_use]
    pub fn new(
        cache: std::sync::Arc<Cache>,
        store: std::sync::Arc<dyn PolicyStore>,
        params: FieldGreylisting,
    ) -> Self {
        Self {
            cache,
            store,
            params,
        }
    }

    fn tuple_key(client: &str, sender: &str, recipient: &str) -> String {
        rediskey(PREFIX, &["tuple", client, sender, recipient])
    }

    fn client_key(client: &str) -> String {
        rediskey(PREFIX, &[client])
    }

    fn option_key(domain: &str) -> String {
        rediskey(PREFIX, &["opt", domain])
    }

    /// Is greylisting enforced for this recipient domain?  Cache-miss loads
    /// the domain flag from the store and mirrors it for an hour.
    async fn domain_gated(&self, domain: &str) -> Result<bool, PolicyError> {
        let key = Self::option_key(domain);
        if let Some(cached) = self.cache.get(&key).await? {
            return Ok(cached == "1");
        }
        let enforced = self.store.greylisting_on(domain).await?;
        self.cache
            .set_ex(&key, if enforced { "1" } else { "0" }, OPTION_TTL)
            .await?;
        tracing::debug!(domain, enforced, "Loaded greylisting flag from the store.");
        Ok(enforced)
    }

    /// Recipients whose domain has greylisting switched on.
    async fn gated_recipients<'r>(
        &self,
        request: &'r PolicyRequest,
    ) -> Result<Vec<&'r str>, PolicyError> {
        let mut gated = vec![];
        for recipient in request.recipients() {
            let Some(domain) = domain_part(recipient) else {
                continue;
            };
            if self.domain_gated(domain).await? {
                gated.push(recipient);
            }
        }
        Ok(gated)
    }

    async fn any_tuple_known(
        &self,
        client: &str,
        sender: &str,
        recipients: &[&str],
    ) -> Result<bool, PolicyError> {
        for recipient in recipients {
            if self
                .cache
                .get(&Self::tuple_key(client, sender, recipient))
                .await?
                .is_some()
            {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// One delivered message, one tally entry, keyed by instance id.
    async fn update_client_tally(
        &self,
        client: &str,
        instance: Option<&str>,
        now: u64,
    ) -> Result<(), PolicyError> {
        if self.params.whitelist_threshold == 0 {
            return Ok(());
        }
        let member = instance.map_or_else(|| now.to_string(), str::to_owned);
        self.cache
            .window_append(
                &Self::client_key(client),
                &member,
                now,
                CACHE_TTL,
                Some(self.params.whitelist_threshold),
            )
            .await
    }

    fn accept(&self) -> Status {
        Status::Next(self.params.acceptance_message.clone())
    }

    fn defer(&self) -> Status {
        Status::Deny(self.params.rejection_message.clone())
    }

    async fn evaluate(&self, request: &PolicyRequest) -> Result<Status, PolicyError> {
        let sender = match request.sender() {
            Some(sender) => sender,
            None if self.params.null_sender_ok => return Ok(self.accept()),
            None => return Ok(self.defer()),
        };
        let Some(client) = request.client_address() else {
            tracing::warn!(%request, "No client_address in inbound request, deferring.");
            return Ok(self.defer());
        };

        let gated = self.gated_recipients(request).await?;
        if gated.is_empty() {
            tracing::debug!(%request, "Greylisting not enforced for any recipient domain.");
            return Ok(self.accept());
        }

        let now = unix_now();
        let threshold = self.params.whitelist_threshold;
        let tally = if threshold > 0 {
            self.cache
                .window_tally(&Self::client_key(client), now, CACHE_TTL)
                .await?
        } else {
            0
        };
        // trusted clients never reach the tuple probes
        let known = if client_whitelisted(tally, threshold) {
            false
        } else {
            self.any_tuple_known(client, sender, &gated).await?
        };

        match grey_verdict(tally, threshold, known) {
            GreyVerdict::Whitelisted => {
                self.update_client_tally(client, request.instance(), now)
                    .await?;
                tracing::debug!(client, tally, "Client whitelisted.");
                Ok(self.accept())
            }
            GreyVerdict::KnownTuple => {
                self.update_client_tally(client, request.instance(), now)
                    .await?;
                tracing::debug!(client, sender, "Known tuple, accepting retry.");
                Ok(self.accept())
            }
            GreyVerdict::FirstSighting => {
                // mark every gated tuple, exactly once under contention
                for recipient in &gated {
                    self.cache
                        .set_nx_ex(
                            &Self::tuple_key(client, sender, recipient),
                            &now.to_string(),
                            CACHE_TTL,
                        )
                        .await?;
                }
                tracing::info!(client, sender, %request, "First sighting, deferring.");
                Ok(self.defer())
            }
        }
    }
}

#[async_trait::async_trait]
impl Policy for GreylistingPolicy {
    fn name(&self) -> &'static str {
        "GreylistingPolicy"
    }

    async fn approve(&self, request: &PolicyRequest) -> Result<Status, PolicyError> {
        self.evaluate(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::{client_whitelisted, grey_verdict, GreyVerdict, GreylistingPolicy};

    #[test]
    fn key_shapes_match_the_external_contract() {
        assert_eq!(
            GreylistingPolicy::tuple_key("1.2.3.4", "s@x", "r@y"),
            "grl:tuple:1.2.3.4:s@x:r@y"
        );
        assert_eq!(GreylistingPolicy::client_key("1.2.3.4"), "grl:1.2.3.4");
        assert_eq!(GreylistingPolicy::option_key("y.tld"), "grl:opt:y.tld");
    }

    #[test]
    fn first_sighting_defers_then_a_retry_accepts() {
        assert_eq!(grey_verdict(0, 10, false), GreyVerdict::FirstSighting);
        assert_eq!(grey_verdict(0, 10, true), GreyVerdict::KnownTuple);
    }

    #[test]
    fn reaching_the_threshold_skips_tuple_checks() {
        assert_eq!(grey_verdict(10, 10, false), GreyVerdict::Whitelisted);
        assert_eq!(grey_verdict(23, 10, true), GreyVerdict::Whitelisted);
        assert!(client_whitelisted(10, 10));
    }

    #[test]
    fn below_the_threshold_the_tuple_decides() {
        assert!(!client_whitelisted(9, 10));
        assert_eq!(grey_verdict(9, 10, true), GreyVerdict::KnownTuple);
        assert_eq!(grey_verdict(9, 10, false), GreyVerdict::FirstSighting);
    }

    #[test]
    fn zero_threshold_disables_whitelisting() {
        assert!(!client_whitelisted(100, 0));
        assert_eq!(grey_verdict(100, 0, true), GreyVerdict::KnownTuple);
        assert_eq!(grey_verdict(100, 0, false), GreyVerdict::FirstSighting);
    }
}
