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

use chapps_common::Action;

/// `[CHAPPS]` section: behavior common to every policy service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldChapps {
    /// Text encoding of the Postfix payload.  Only `utf-8` is supported.
    pub payload_encoding: String,
    /// Primary attribute naming the user behind an outbound request.
    pub user_key: String,
    /// When set, only `user_key` is consulted and a missing value is an
    /// authentication failure.
    pub require_user_key: bool,
    /// Directive sent when no user-identifier can be extracted.
    pub no_user_key_response: Action,
}

/// Which relational backend serves the policy-config store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdapterBackend {
    /// MySQL / MariaDB over `sqlx`.
    #[default]
    Mysql,
}

impl std::str::FromStr for AdapterBackend {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mysql" | "mariadb" => Ok(Self::Mysql),
            _ => Err(()),
        }
    }
}

/// `[PolicyConfigAdapter]` section: how to reach the relational store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldAdapter {
    /// Selected backend, also settable through `CHAPPS_DB_MODULE`.
    pub adapter: AdapterBackend,
    /// Database server host.
    pub db_host: String,
    /// Database server port.
    pub db_port: u16,
    /// Database name.
    pub db_name: String,
    /// Login user.
    pub db_user: String,
    /// Login password.
    pub db_pass: String,
}

impl FieldAdapter {
    /// Connection URL for the pool.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "mysql://{}:{}@{}:{}/{}",
            self.db_user, self.db_pass, self.db_host, self.db_port, self.db_name
        )
    }
}

/// `[Redis]` section: either a plain server or a Sentinel ensemble.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRedis {
    /// Space-separated `host:port` Sentinel addresses; empty means no
    /// Sentinel.
    pub sentinel_servers: Vec<String>,
    /// Logical master name registered with Sentinel.
    pub sentinel_dataset: String,
    /// Redis host used when Sentinel is not configured.
    pub server: String,
    /// Redis port used when Sentinel is not configured.
    pub port: u16,
    /// Upper bound on any single Redis round-trip.
    pub op_timeout: std::time::Duration,
}

/// Listener endpoint of one policy service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldListen {
    /// Address to bind.
    pub address: String,
    /// Port to bind.
    pub port: u16,
}

/// Grace margin applied on top of a user's quota limit.
///
/// The INI value is either an integer (absolute message count) or a float:
/// `[0,1)` is a ratio of the limit, `[1,100)` a percentage.  A float of 100
/// or more is refused at load time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Margin {
    /// Absolute number of messages.
    Fixed(u64),
    /// Fraction of the limit, in `[0,1)`.
    Ratio(f64),
}

impl Margin {
    /// The margin in messages for a given limit.
    #[must_use]
    pub fn effective(&self, limit: u64) -> u64 {
        match *self {
            Self::Fixed(count) => count,
            #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
            #[allow(clippy::cast_sign_loss)]
            Self::Ratio(ratio) => (limit as f64 * ratio) as u64,
        }
    }
}

/// `[OutboundQuotaPolicy]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOutboundQuota {
    /// Where the standalone quota service listens.
    pub listen: FieldListen,
    /// Grace margin on top of the limit.
    pub margin: Margin,
    /// Experimental throttle: minimum seconds between two attempts of one
    /// user, `0` to disable.
    pub min_delta: u64,
    /// Count every recipient of a multi-recipient mail as one attempt.
    pub counting_recipients: bool,
    /// Directive sent when the quota is exhausted.
    pub rejection_message: Action,
    /// Directive sent when the mail is within quota.
    pub acceptance_message: Action,
    /// Whether mail from the null sender passes this policy.
    pub null_sender_ok: bool,
}

/// `[GreylistingPolicy]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldGreylisting {
    /// Where the standalone greylisting service listens.
    pub listen: FieldListen,
    /// Deliveries from one client within 24 h after which the client skips
    /// tuple checks; `0` disables client whitelisting.
    pub whitelist_threshold: u64,
    /// Directive sent on a first sighting.
    pub rejection_message: Action,
    /// Directive sent for a recognized tuple or whitelisted client.
    pub acceptance_message: Action,
    /// Whether mail from the null sender passes this policy.
    pub null_sender_ok: bool,
}

/// `[SenderDomainAuthPolicy]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSenderAuth {
    /// Where the standalone sender-auth service listens.
    pub listen: FieldListen,
    /// Directive sent for an unauthorized sender address.
    pub rejection_message: Action,
    /// Directive sent for an authorized sender address.
    pub acceptance_message: Action,
    /// Whether mail from the null sender passes this policy.
    pub null_sender_ok: bool,
}

/// `[SPFEnforcementPolicy]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpf {
    /// Where the standalone SPF service listens.
    pub listen: FieldListen,
    /// Total duration allowed for one SPF evaluation, DNS included; an
    /// overrun yields `temperror`.
    pub timeout: std::time::Duration,
    /// Whether mail from the null sender passes this policy.
    pub null_sender_ok: bool,
}

/// `[PostfixSPFActions]` section: one entry per SPF result.
///
/// Each value is either a symbolic built-in (`prepend`, `okay`, `dunno`,
/// `reject`, `defer_if_permit`, `greylist`) or a literal Postfix directive
/// which may embed `{reason}`.  Interpretation happens in the SPF policy;
/// here the strings are carried as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpfActions {
    /// Action on `pass` (key `passing`: `pass` is a reserved word in the
    /// original tooling and the key name is part of the config contract).
    pub passing: String,
    /// Action on `fail`.
    pub fail: String,
    /// Action on `temperror`, also used for evaluator timeouts.
    pub temperror: String,
    /// Action on `permerror`.
    pub permerror: String,
    /// Action shared by `none` and `neutral`.
    pub none_neutral: String,
    /// Action on `softfail`.
    pub softfail: String,
}
