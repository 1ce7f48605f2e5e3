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

//! SPF enforcement (RFC 7208).
//!
//! Record evaluation itself is delegated to an external evaluator; this
//! module decides *whether* to evaluate (per-recipient-domain gating) and
//! *what to do* with the result (the configured `[PostfixSPFActions]`
//! table, including handing grey-ish results to the greylisting policy).

mod actions;
mod evaluator;

pub use actions::SpfActionTable;
pub use evaluator::{DnsSpfEvaluator, SpfEvaluator};

use crate::{
    cache::{rediskey, Cache},
    handler::Policy,
    store::PolicyStore,
    PolicyError,
};
use chapps_common::{domain_part, Action, Status};
use chapps_config::FieldSpf;
use chapps_protocol::PolicyRequest;

const PREFIX: &str = "spf";
const OPTION_TTL: u64 = 3_600;

/// Outcome of an SPF check, one of the RFC 7208 result values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum SpfValue {
    /// The client is authorized to inject mail for the domain.
    Pass,
    /// The client is explicitly not authorized.
    Fail,
    /// The domain discourages but does not forbid the client.
    SoftFail,
    /// The domain makes no strong assertion.
    Neutral,
    /// No SPF record was published.
    None,
    /// A transient error prevented evaluation.
    TempError,
    /// The published record is unusable.
    PermError,
}

/// What the evaluator handed back: the result value and its explanation
/// string, used for `{reason}` substitution and the `Received-SPF` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfOutcome {
    /// RFC 7208 result value; anything unrecognized collapses to
    /// [`SpfValue::TempError`].
    pub value: SpfValue,
    /// Human-readable cause: the matching mechanism or the problem.
    pub explanation: String,
}

impl SpfOutcome {
    /// A transient-failure outcome with the given explanation.
    #[must_use]
    pub fn temperror(explanation: impl Into<String>) -> Self {
        Self {
            value: SpfValue::TempError,
            explanation: explanation.into(),
        }
    }
}

/// `Received-SPF:` trace header recording the check for downstream filters
/// (RFC 7208 §9.1).
fn received_spf_header(
    outcome: &SpfOutcome,
    client_ip: &str,
    helo: &str,
    sender: &str,
) -> String {
    format!(
        "Received-SPF: {} ({}) client-ip={}; envelope-from={}; helo={};",
        outcome.value,
        outcome.explanation,
        client_ip,
        if sender.is_empty() { "<>" } else { sender },
        helo,
    )
}

/// SPF enforcement policy manager.
pub struct SpfEnforcementPolicy {
    cache: std::sync::Arc<Cache>,
    store: std::sync::Arc<dyn PolicyStore>,
    evaluator: std::sync::Arc<dyn SpfEvaluator>,
    params: FieldSpf,
    table: SpfActionTable,
}

impl SpfEnforcementPolicy {
    /// Assemble the policy from the shared state handles, the evaluator and
    /// its config sections.
    #[must_use]
    pub fn new(
        cache: std::sync::Arc<Cache>,
        store: std::sync::Arc<dyn PolicyStore>,
        evaluator: std::sync::Arc<dyn SpfEvaluator>,
        params: FieldSpf,
        table: SpfActionTable,
    ) -> Self {
        Self {
            cache,
            store,
            evaluator,
            params,
            table,
        }
    }

    fn option_key(domain: &str) -> String {
        rediskey(PREFIX, &["opt", domain])
    }

    async fn domain_gated(&self, domain: &str) -> Result<bool, PolicyError> {
        let key = Self::option_key(domain);
        if let Some(cached) = self.cache.get(&key).await? {
            return Ok(cached == "1");
        }
        let enforced = self.store.check_spf_on(domain).await?;
        self.cache
            .set_ex(&key, if enforced { "1" } else { "0" }, OPTION_TTL)
            .await?;
        tracing::debug!(domain, enforced, "Loaded SPF flag from the store.");
        Ok(enforced)
    }

    async fn any_recipient_gated(
        &self,
        request: &PolicyRequest,
    ) -> Result<bool, PolicyError> {
        for recipient in request.recipients() {
            let Some(domain) = domain_part(recipient) else {
                continue;
            };
            if self.domain_gated(domain).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn evaluate(&self, request: &PolicyRequest) -> Result<Status, PolicyError> {
        if !self.any_recipient_gated(request).await? {
            tracing::debug!(%request, "SPF not enforced for any recipient domain.");
            return Ok(Status::Next(Action::Dunno));
        }

        let helo = request.helo_name().unwrap_or_default();
        let sender = request.sender().unwrap_or_default();
        let client_ip = request.client_address().unwrap_or_default();

        let outcome = match client_ip.parse::<std::net::IpAddr>() {
            Ok(ip) => {
                match tokio::time::timeout(
                    self.params.timeout,
                    self.evaluator.resolve_spf(ip, helo, sender),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => SpfOutcome::temperror("SPF evaluation timed out"),
                }
            }
            Err(_) => SpfOutcome::temperror(format!("unusable client address {client_ip:?}")),
        };

        let header = received_spf_header(&outcome, client_ip, helo, sender);
        let status = self.table.status_for(&outcome, &header);
        tracing::info!(result = %outcome.value, verdict = status.as_ref(), %request, "SPF checked.");
        Ok(status)
    }
}

#[async_trait::async_trait]
impl Policy for SpfEnforcementPolicy {
    fn name(&self) -> &'static str {
        "SPFEnforcementPolicy"
    }

    async fn approve(&self, request: &PolicyRequest) -> Result<Status, PolicyError> {
        self.evaluate(request).await
    }
}

#[cfg(test)]
mod tests {
    use super::{received_spf_header, SpfOutcome, SpfValue};
    use std::str::FromStr;

    #[test]
    fn result_values_cover_the_rfc_set() {
        for (text, value) in [
            ("pass", SpfValue::Pass),
            ("fail", SpfValue::Fail),
            ("softfail", SpfValue::SoftFail),
            ("neutral", SpfValue::Neutral),
            ("none", SpfValue::None),
            ("temperror", SpfValue::TempError),
            ("permerror", SpfValue::PermError),
        ] {
            assert_eq!(SpfValue::from_str(text), Ok(value));
            assert_eq!(value.to_string(), text);
        }
    }

    #[test]
    fn unknown_results_collapse_to_temperror() {
        let value = SpfValue::from_str("ambiguous").unwrap_or(SpfValue::TempError);
        assert_eq!(value, SpfValue::TempError);
    }

    #[test]
    fn header_names_the_essentials() {
        let header = received_spf_header(
            &SpfOutcome {
                value: SpfValue::Pass,
                explanation: "mechanism ip4:10.10.10.0/24 matched".to_owned(),
            },
            "10.10.10.10",
            "helo.chapps.io",
            "caleb@chapps.io",
        );
        assert_eq!(
            header,
            "Received-SPF: pass (mechanism ip4:10.10.10.0/24 matched) \
             client-ip=10.10.10.10; envelope-from=caleb@chapps.io; helo=helo.chapps.io;"
        );
    }

    #[test]
    fn null_sender_shows_as_angle_brackets() {
        let header = received_spf_header(
            &SpfOutcome::temperror("x"),
            "10.0.0.1",
            "mx.tld",
            "",
        );
        assert!(header.contains("envelope-from=<>;"));
    }
}
