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
    PolicyError,
};
use chapps_common::{Action, Status};
use chapps_protocol::PolicyRequest;

const PREFIX: &str = "handler";

/// How long an instance's aggregate action stays valid.  Postfix re-queries
/// the same instance within seconds; ten minutes is generous.
const INSTANCE_TTL: u64 = 600;

/// One composable policy.
///
/// The capability the pipeline cares about: look at a request, produce a
/// [`Status`].  Policies resolve their own yes/no outcomes into actions;
/// only pipeline-level conditions travel as [`PolicyError`].
#[async_trait::async_trait]
pub trait Policy: Send + Sync {
    /// Name used in logs, matching the policy's config section.
    fn name(&self) -> &'static str;

    /// Decide on one request.
    async fn approve(&self, request: &PolicyRequest) -> Result<Status, PolicyError>;
}

/// Composes policies in order and produces a single Postfix action.
///
/// Semantics: a `Deny` short-circuits; among `Next` actions the last
/// non-`DUNNO` one wins; SPF's `Greylist` verdict hands the request to the
/// greylisting policy, whose outcome is final.  The aggregate action is
/// cached per Postfix instance id under `handler:<instance>` so any worker
/// behind the load balancer serves a repeat query identically.
pub struct CascadingPolicyHandler {
    policies: Vec<std::sync::Arc<dyn Policy>>,
    greylist_target: Option<std::sync::Arc<dyn Policy>>,
    instance_cache: Option<std::sync::Arc<Cache>>,
    no_user_key_response: Action,
    fallback: Action,
}

impl CascadingPolicyHandler {
    /// A pipeline over `policies`, with `no_user_key_response` answering
    /// authentication failures.
    #[must_use]
    pub fn new(
        policies: Vec<std::sync::Arc<dyn Policy>>,
        no_user_key_response: Action,
    ) -> Self {
        Self {
            policies,
            greylist_target: None,
            instance_cache: None,
            no_user_key_response,
            fallback: Action::Dunno,
        }
    }

    /// Cache aggregate actions per instance id in Redis.
    #[must_use]
    pub fn with_instance_cache(mut self, cache: std::sync::Arc<Cache>) -> Self {
        self.instance_cache = Some(cache);
        self
    }

    /// Policy receiving requests that SPF marks for greylisting.
    #[must_use]
    pub fn with_greylist_target(mut self, policy: std::sync::Arc<dyn Policy>) -> Self {
        self.greylist_target = Some(policy);
        self
    }

    fn instance_key(instance: &str) -> String {
        rediskey(PREFIX, &[instance])
    }

    /// Produce the action for one request, consulting and maintaining the
    /// per-instance cache.  Never fails: anything unanswerable becomes the
    /// fallback action.
    pub async fn handle(&self, request: &PolicyRequest) -> Action {
        if let (Some(cache), Some(instance)) = (&self.instance_cache, request.instance()) {
            match cache.get(&Self::instance_key(instance)).await {
                Ok(Some(cached)) => {
                    if let Ok(action) = cached.parse::<Action>() {
                        tracing::debug!(instance, "Replaying cached instance action.");
                        return action;
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(%error, "Instance cache unavailable, evaluating anyway.");
                }
            }
        }

        let (action, cacheable) = self.run_policies(request).await;

        if cacheable {
            if let (Some(cache), Some(instance)) =
                (&self.instance_cache, request.instance())
            {
                if let Err(error) = cache
                    .set_ex(
                        &Self::instance_key(instance),
                        &action.to_string(),
                        INSTANCE_TTL,
                    )
                    .await
                {
                    tracing::warn!(%error, "Could not record instance action.");
                }
            }
        }
        action
    }

    async fn run_policies(&self, request: &PolicyRequest) -> (Action, bool) {
        let mut last = self.fallback.clone();
        for policy in &self.policies {
            match policy.approve(request).await {
                Ok(Status::Next(action)) => {
                    tracing::info!(policy = policy.name(), %request, action = %action, "PASS");
                    if action != Action::Dunno {
                        last = action;
                    }
                }
                Ok(Status::Deny(action)) => {
                    tracing::info!(policy = policy.name(), %request, action = %action, "FAIL");
                    return (action, true);
                }
                Ok(Status::Greylist {
                    reason,
                    pass_action,
                }) => {
                    return self.delegate_greylist(request, &reason, pass_action).await;
                }
                Err(error) => {
                    return (self.action_for_error(policy.name(), &error), false);
                }
            }
        }
        (last, true)
    }

    async fn delegate_greylist(
        &self,
        request: &PolicyRequest,
        reason: &str,
        pass_action: Action,
    ) -> (Action, bool) {
        let Some(greylist) = &self.greylist_target else {
            tracing::warn!(%request, "Greylist verdict but no greylisting policy wired in.");
            return (self.fallback.clone(), false);
        };
        match greylist.approve(request).await {
            Ok(Status::Next(_)) => {
                tracing::info!(%request, action = %pass_action, "Greylist retry honored.");
                (pass_action, true)
            }
            Ok(Status::Deny(action)) => {
                // carry the SPF explanation in the deferral text
                let action = match action {
                    Action::DeferIfPermit(text) => {
                        Action::DeferIfPermit(format!("{text} {reason}"))
                    }
                    other => other,
                };
                tracing::info!(%request, action = %action, "Greylisted on SPF result.");
                (action, true)
            }
            Ok(Status::Greylist { .. }) => {
                tracing::warn!(%request, "Greylisting policy produced a greylist verdict.");
                (self.fallback.clone(), false)
            }
            Err(error) => (
                self.action_for_error(greylist.name(), &error),
                false,
            ),
        }
    }

    fn action_for_error(&self, policy: &str, error: &PolicyError) -> Action {
        match error {
            PolicyError::AuthenticationFailed { tried } => {
                tracing::info!(policy, ?tried, "No user-identifier, refusing.");
                self.no_user_key_response.clone()
            }
            PolicyError::AdapterUnavailable(source) => {
                tracing::error!(policy, error = %source, "Policy store down, falling back.");
                self.fallback.clone()
            }
            PolicyError::CacheUnavailable(detail) => {
                tracing::error!(policy, detail, "Cache down, falling back.");
                self.fallback.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CascadingPolicyHandler, Policy};
    use crate::PolicyError;
    use chapps_common::{Action, Status};
    use chapps_protocol::PolicyRequest;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    struct Stub {
        status: Status,
        calls: AtomicUsize,
    }

    impl Stub {
        fn new(status: Status) -> Arc<Self> {
            Arc::new(Self {
                status,
                calls: AtomicUsize::new(0),
            })
        }
    }

    fn policies(stubs: &[&Arc<Stub>]) -> Vec<Arc<dyn Policy>> {
        stubs
            .iter()
            .map(|stub| Arc::clone(stub) as Arc<dyn Policy>)
            .collect()
    }

    #[async_trait::async_trait]
    impl Policy for Stub {
        fn name(&self) -> &'static str {
            "Stub"
        }

        async fn approve(&self, _: &PolicyRequest) -> Result<Status, PolicyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.status.clone())
        }
    }

    struct AuthFailing;

    #[async_trait::async_trait]
    impl Policy for AuthFailing {
        fn name(&self) -> &'static str {
            "AuthFailing"
        }

        async fn approve(&self, _: &PolicyRequest) -> Result<Status, PolicyError> {
            Err(PolicyError::AuthenticationFailed { tried: vec![] })
        }
    }

    fn request() -> PolicyRequest {
        PolicyRequest::parse(b"instance=abc.123\nsender=a@x.tld\n\n").unwrap()
    }

    fn no_user_key() -> Action {
        Action::Reject(Some("Rejected - Authentication failed".to_owned()))
    }

    #[tokio::test]
    async fn deny_short_circuits() {
        let first = Stub::new(Status::Deny(Action::Reject(None)));
        let second = Stub::new(Status::Next(Action::Okay));
        let handler =
            CascadingPolicyHandler::new(policies(&[&first, &second]), no_user_key());

        assert_eq!(handler.handle(&request()).await, Action::Reject(None));
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn last_non_dunno_action_wins() {
        let okay = Stub::new(Status::Next(Action::Okay));
        let dunno = Stub::new(Status::Next(Action::Dunno));
        let handler =
            CascadingPolicyHandler::new(policies(&[&okay, &dunno]), no_user_key());
        assert_eq!(handler.handle(&request()).await, Action::Okay);

        let first = Stub::new(Status::Next(Action::Dunno));
        let second = Stub::new(Status::Next(Action::Dunno));
        let handler =
            CascadingPolicyHandler::new(policies(&[&first, &second]), no_user_key());
        assert_eq!(handler.handle(&request()).await, Action::Dunno);
    }

    #[tokio::test]
    async fn greylist_pass_replays_the_spf_pass_action() {
        let spf = Stub::new(Status::Greylist {
            reason: "softfail".to_owned(),
            pass_action: Action::Prepend("Received-SPF: softfail".to_owned()),
        });
        let greylist = Stub::new(Status::Next(Action::Dunno));
        let handler = CascadingPolicyHandler::new(policies(&[&spf]), no_user_key())
            .with_greylist_target(greylist.clone());

        assert_eq!(
            handler.handle(&request()).await,
            Action::Prepend("Received-SPF: softfail".to_owned())
        );
        assert_eq!(greylist.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn greylist_defer_carries_the_spf_reason() {
        let spf = Stub::new(Status::Greylist {
            reason: "due to SPF enforcement policy".to_owned(),
            pass_action: Action::Dunno,
        });
        let greylist = Stub::new(Status::Deny(Action::DeferIfPermit(
            "Service temporarily unavailable - greylisted".to_owned(),
        )));
        let handler = CascadingPolicyHandler::new(policies(&[&spf]), no_user_key())
            .with_greylist_target(greylist);

        assert_eq!(
            handler.handle(&request()).await,
            Action::DeferIfPermit(
                "Service temporarily unavailable - greylisted \
                 due to SPF enforcement policy"
                    .to_owned()
            )
        );
    }

    #[tokio::test]
    async fn authentication_failure_maps_to_the_configured_response() {
        let handler = CascadingPolicyHandler::new(
            vec![Arc::new(AuthFailing) as Arc<dyn Policy>],
            no_user_key(),
        );
        assert_eq!(handler.handle(&request()).await, no_user_key());
    }

    #[tokio::test]
    async fn empty_pipeline_falls_back_to_dunno() {
        let handler = CascadingPolicyHandler::new(vec![], no_user_key());
        assert_eq!(handler.handle(&request()).await, Action::Dunno);
    }
}
