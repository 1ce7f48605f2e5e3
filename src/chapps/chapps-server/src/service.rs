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

use anyhow::Context as _;
use chapps_config::{Config, FieldListen};
use chapps_policy::{
    Cache, CascadingPolicyHandler, DnsSpfEvaluator, GreylistingPolicy,
    OutboundQuotaPolicy, PolicyStore, SenderDomainAuthPolicy, SpfActionTable,
    SpfEnforcementPolicy, SpfEvaluator, SqlPolicyStore,
};

/// The policy composition a `chappsd` process runs.  One process serves one
/// of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServiceKind {
    /// Outbound quota accounting only.
    OutboundQuota,
    /// Greylisting only.
    Greylisting,
    /// Sender-domain authorization only.
    SenderDomainAuth,
    /// SPF enforcement (with greylisting on grey results).
    Spf,
    /// Sender-domain authorization cascading into outbound quota.
    OutboundMulti,
    /// SPF enforcement handing grey results to greylisting.
    InboundMulti,
}

impl ServiceKind {
    /// The listener endpoint: the section of the first policy in the
    /// composition, as the multi-policy handlers have always done.
    #[must_use]
    pub fn listen<'c>(self, config: &'c Config) -> &'c FieldListen {
        match self {
            Self::OutboundQuota => &config.outbound_quota.listen,
            Self::Greylisting => &config.greylisting.listen,
            Self::SenderDomainAuth | Self::OutboundMulti => &config.sender_auth.listen,
            Self::Spf | Self::InboundMulti => &config.spf.listen,
        }
    }
}

/// Process-wide singletons: one Redis handle, one SQL pool, one SPF
/// evaluator.  Created at startup, shared by every pipeline built
/// afterwards, reload included.
pub struct ServiceContext {
    /// Redis, possibly Sentinel-backed.
    pub cache: std::sync::Arc<Cache>,
    /// Relational policy-config store.
    pub store: std::sync::Arc<dyn PolicyStore>,
    /// External SPF evaluator.
    pub evaluator: std::sync::Arc<dyn SpfEvaluator>,
}

impl ServiceContext {
    /// Connect the shared state from the configuration.
    ///
    /// # Errors
    ///
    /// * Redis or the SQL pool cannot be set up
    /// * the DNS resolver for SPF cannot be constructed
    pub async fn init(config: &Config) -> anyhow::Result<Self> {
        let cache = Cache::connect(&config.redis)
            .await
            .context("connecting to Redis")?;
        let store =
            SqlPolicyStore::connect(&config.adapter).context("preparing the SQL pool")?;
        let evaluator = DnsSpfEvaluator::new().context("constructing the DNS resolver")?;
        Ok(Self {
            cache: std::sync::Arc::new(cache),
            store: std::sync::Arc::new(store),
            evaluator: std::sync::Arc::new(evaluator),
        })
    }
}

/// Assemble the pipeline for `kind` from a config snapshot.
///
/// Called at startup and again on every `SIGHUP`; the context's handles are
/// reused, only the policy parameters change.
///
/// # Errors
///
/// * the `[PostfixSPFActions]` table does not validate
pub fn build_handler(
    kind: ServiceKind,
    config: &Config,
    ctx: &ServiceContext,
) -> anyhow::Result<CascadingPolicyHandler> {
    let quota = || {
        std::sync::Arc::new(OutboundQuotaPolicy::new(
            ctx.cache.clone(),
            ctx.store.clone(),
            config.chapps.clone(),
            config.outbound_quota.clone(),
        ))
    };
    let sender_auth = || {
        std::sync::Arc::new(SenderDomainAuthPolicy::new(
            ctx.cache.clone(),
            ctx.store.clone(),
            config.chapps.clone(),
            config.sender_auth.clone(),
        ))
    };
    let greylist = || {
        std::sync::Arc::new(GreylistingPolicy::new(
            ctx.cache.clone(),
            ctx.store.clone(),
            config.greylisting.clone(),
        ))
    };
    let spf = || -> anyhow::Result<std::sync::Arc<SpfEnforcementPolicy>> {
        let table = SpfActionTable::from_config(&config.spf_actions)
            .map_err(|reason| anyhow::anyhow!("[PostfixSPFActions] {reason}"))?;
        Ok(std::sync::Arc::new(SpfEnforcementPolicy::new(
            ctx.cache.clone(),
            ctx.store.clone(),
            ctx.evaluator.clone(),
            config.spf.clone(),
            table,
        )))
    };

    let no_user_key = config.chapps.no_user_key_response.clone();
    let handler = match kind {
        ServiceKind::OutboundQuota => {
            CascadingPolicyHandler::new(vec![quota()], no_user_key)
        }
        ServiceKind::Greylisting => {
            CascadingPolicyHandler::new(vec![greylist()], no_user_key)
        }
        ServiceKind::SenderDomainAuth => {
            CascadingPolicyHandler::new(vec![sender_auth()], no_user_key)
        }
        ServiceKind::OutboundMulti => {
            CascadingPolicyHandler::new(vec![sender_auth(), quota()], no_user_key)
        }
        ServiceKind::Spf | ServiceKind::InboundMulti => {
            CascadingPolicyHandler::new(vec![spf()?], no_user_key)
                .with_greylist_target(greylist())
        }
    };
    Ok(handler.with_instance_cache(ctx.cache.clone()))
}
