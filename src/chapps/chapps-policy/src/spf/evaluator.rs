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

use super::{SpfOutcome, SpfValue};

/// The external SPF evaluator the policy consults.
///
/// Errors do not surface: every failure mode maps onto one of the RFC 7208
/// result values (`temperror` / `permerror`), so the outcome is total.
#[async_trait::async_trait]
pub trait SpfEvaluator: Send + Sync {
    /// Evaluate the SPF policy published for `mail_from` (or the HELO
    /// identity when the sender is null) against the connecting `ip`.
    async fn resolve_spf(
        &self,
        ip: std::net::IpAddr,
        helo: &str,
        mail_from: &str,
    ) -> SpfOutcome;
}

fn outcome_of(result: viaspf::QueryResult) -> SpfOutcome {
    SpfOutcome {
        value: result
            .spf_result
            .to_string()
            .parse::<SpfValue>()
            .unwrap_or(SpfValue::TempError),
        explanation: result.cause.map_or_else(
            || "default".to_owned(),
            |cause| match cause {
                viaspf::SpfResultCause::Match(mechanism) => {
                    format!("mechanism {mechanism} matched")
                }
                viaspf::SpfResultCause::Error(error) => error.to_string(),
            },
        ),
    }
}

/// DNS-backed evaluator over `viaspf` and the trust-dns resolver.
///
/// The HELO identity is checked first; only a definitive `fail` there is
/// honored, anything else defers to the MAIL FROM identity (RFC 7208 §2.3).
pub struct DnsSpfEvaluator {
    resolver: trust_dns_resolver::TokioAsyncResolver,
    config: viaspf::Config,
}

impl DnsSpfEvaluator {
    /// Build an evaluator on the system resolver configuration, falling
    /// back to the library defaults off-Unix.
    ///
    /// # Errors
    ///
    /// * the resolver cannot be constructed at all
    pub fn new() -> Result<Self, trust_dns_resolver::error::ResolveError> {
        let resolver = trust_dns_resolver::TokioAsyncResolver::tokio_from_system_conf()
            .or_else(|_| {
                trust_dns_resolver::TokioAsyncResolver::tokio(
                    trust_dns_resolver::config::ResolverConfig::default(),
                    trust_dns_resolver::config::ResolverOpts::default(),
                )
            })?;
        Ok(Self {
            resolver,
            config: viaspf::Config::default(),
        })
    }

    async fn query(
        &self,
        ip: std::net::IpAddr,
        sender: &viaspf::Sender,
        helo_domain: Option<&viaspf::DomainName>,
    ) -> SpfOutcome {
        outcome_of(
            viaspf::evaluate_sender(&self.resolver, &self.config, ip, sender, helo_domain)
                .await,
        )
    }
}

#[async_trait::async_trait]
impl SpfEvaluator for DnsSpfEvaluator {
    async fn resolve_spf(
        &self,
        ip: std::net::IpAddr,
        helo: &str,
        mail_from: &str,
    ) -> SpfOutcome {
        let helo_domain = viaspf::DomainName::new(helo).ok();

        if let Some(domain) = &helo_domain {
            if let Ok(helo_sender) = viaspf::Sender::from_domain(helo) {
                let helo_outcome = self.query(ip, &helo_sender, Some(domain)).await;
                if helo_outcome.value == SpfValue::Fail || mail_from.is_empty() {
                    return helo_outcome;
                }
            }
        }

        match viaspf::Sender::from_address(mail_from) {
            Ok(sender) => self.query(ip, &sender, helo_domain.as_ref()).await,
            Err(error) => SpfOutcome {
                value: SpfValue::PermError,
                explanation: format!("unusable sender address {mail_from:?}: {error}"),
            },
        }
    }
}
