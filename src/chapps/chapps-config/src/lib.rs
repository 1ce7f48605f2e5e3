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

//! Configuration of a CHAPPS instance.
//!
//! The on-disk format is an INI file, one section per concern
//! (`[CHAPPS]`, `[Redis]`, `[PolicyConfigAdapter]`, one per policy and
//! `[PostfixSPFActions]`).  The default location is
//! `/etc/chapps/chapps.ini`, overridable through the `CHAPPS_CONFIG`
//! environment variable; `CHAPPS_DB_MODULE` overrides the adapter backend.
//!
//! Every key has a default, so an empty file is a valid configuration.
//! Validation failures at load time are fatal; nothing else in the service
//! is.

mod default;
mod field;
mod parser;

pub use field::{
    AdapterBackend, FieldAdapter, FieldChapps, FieldGreylisting, FieldListen,
    FieldOutboundQuota, FieldRedis, FieldSenderAuth, FieldSpf, FieldSpfActions, Margin,
};

/// Environment variable naming the config file to read.
pub const ENV_CONFIG: &str = "CHAPPS_CONFIG";
/// Environment variable overriding `[PolicyConfigAdapter] adapter`.
pub const ENV_DB_MODULE: &str = "CHAPPS_DB_MODULE";
/// Where the config lives when nothing else is said.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/chapps/chapps.ini";

/// A loaded, validated configuration snapshot.
///
/// Snapshots are immutable; a `SIGHUP` reload produces a fresh instance and
/// swaps one shared reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Where this snapshot was read from.
    pub path: std::path::PathBuf,
    /// `[CHAPPS]`
    pub chapps: FieldChapps,
    /// `[Redis]`
    pub redis: FieldRedis,
    /// `[PolicyConfigAdapter]`
    pub adapter: FieldAdapter,
    /// `[OutboundQuotaPolicy]`
    pub outbound_quota: FieldOutboundQuota,
    /// `[GreylistingPolicy]`
    pub greylisting: FieldGreylisting,
    /// `[SenderDomainAuthPolicy]`
    pub sender_auth: FieldSenderAuth,
    /// `[SPFEnforcementPolicy]`
    pub spf: FieldSpf,
    /// `[PostfixSPFActions]`
    pub spf_actions: FieldSpfActions,
}

/// Failure while reading or validating the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read or parsed as INI.
    #[error("cannot read config file: {0}")]
    Ini(#[from] ini::Error),

    /// A key holds a value the service cannot use.
    #[error("[{section}] {key}: {reason}")]
    Invalid {
        /// INI section name.
        section: &'static str,
        /// Key within the section.
        key: &'static str,
        /// What was wrong with the value.
        reason: String,
    },
}

impl Config {
    /// Load the configuration named by `CHAPPS_CONFIG`, falling back to
    /// [`DEFAULT_CONFIG_PATH`].
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var(ENV_CONFIG)
            .map_or_else(|_| DEFAULT_CONFIG_PATH.into(), std::path::PathBuf::from);
        Self::load(&path)
    }

    /// Load and validate the file at `path`.  A missing file yields the
    /// built-in defaults, the way a freshly installed instance starts.
    ///
    /// # Errors
    ///
    /// * unreadable or unparsable INI
    /// * a value failing validation (bad margin, unknown backend,
    ///   unparsable Postfix directive, ...)
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let ini = if path.exists() {
            ini::Ini::load_from_file(path)?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults.");
            ini::Ini::new()
        };
        let mut config = parser::from_ini(path, &ini)?;

        if let Ok(backend) = std::env::var(ENV_DB_MODULE) {
            config.adapter.adapter = backend
                .parse::<AdapterBackend>()
                .map_err(|_| ConfigError::Invalid {
                    section: "PolicyConfigAdapter",
                    key: "adapter",
                    reason: format!("unsupported backend {backend:?} (from {ENV_DB_MODULE})"),
                })?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chapps_common::Action;

    fn load_str(content: &str) -> Result<Config, ConfigError> {
        let ini = ini::Ini::load_from_str(content).unwrap();
        parser::from_ini(std::path::Path::new("test.ini"), &ini)
    }

    #[test]
    fn empty_file_is_all_defaults() {
        let config = load_str("").unwrap();
        assert_eq!(config.chapps.user_key, "sasl_username");
        assert!(!config.chapps.require_user_key);
        assert_eq!(config.redis.server, "localhost");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.outbound_quota.listen.port, 10225);
        assert_eq!(config.greylisting.whitelist_threshold, 10);
        assert_eq!(config.outbound_quota.margin, Margin::Ratio(0.10));
        assert_eq!(config.outbound_quota.acceptance_message, Action::Dunno);
        assert_eq!(
            config.spf.timeout,
            std::time::Duration::from_secs(20)
        );
    }

    #[test]
    fn sections_override_defaults() {
        let config = load_str(
            "[CHAPPS]\n\
             require_user_key = True\n\
             user_key = ccert_subject\n\
             [Redis]\n\
             sentinel_servers = 10.0.0.1:26379 10.0.0.2:26379\n\
             sentinel_dataset = chapps-mail\n\
             [OutboundQuotaPolicy]\n\
             margin = 25\n\
             counting_recipients = False\n\
             listen_port = 10333\n",
        )
        .unwrap();
        assert!(config.chapps.require_user_key);
        assert_eq!(config.chapps.user_key, "ccert_subject");
        assert_eq!(
            config.redis.sentinel_servers,
            vec!["10.0.0.1:26379".to_owned(), "10.0.0.2:26379".to_owned()]
        );
        assert_eq!(config.outbound_quota.margin, Margin::Fixed(25));
        assert!(!config.outbound_quota.counting_recipients);
        assert_eq!(config.outbound_quota.listen.port, 10333);
    }

    #[test]
    fn margin_of_one_hundred_or_more_is_fatal() {
        assert!(load_str("[OutboundQuotaPolicy]\nmargin = 100.0\n").is_err());
        assert!(load_str("[OutboundQuotaPolicy]\nmargin = 250.5\n").is_err());
        // an *integer* >= 100 is a legal absolute margin
        assert!(load_str("[OutboundQuotaPolicy]\nmargin = 250\n").is_ok());
    }

    #[test]
    fn percentage_margins_scale_down() {
        let config = load_str("[OutboundQuotaPolicy]\nmargin = 10.0\n").unwrap();
        assert_eq!(config.outbound_quota.margin, Margin::Ratio(0.10));
        assert_eq!(config.outbound_quota.margin.effective(200), 20);
        assert_eq!(Margin::Fixed(7).effective(200), 7);
    }

    #[test]
    fn directives_are_validated_at_load() {
        assert!(load_str("[GreylistingPolicy]\nrejection_message = HOLD on\n").is_err());
        let config =
            load_str("[GreylistingPolicy]\nrejection_message = 451 4.7.1 come back later\n")
                .unwrap();
        assert_eq!(
            config.greylisting.rejection_message,
            Action::Enhanced("451 4.7.1 come back later".to_owned())
        );
    }

    #[test]
    fn require_user_key_needs_a_key() {
        assert!(load_str("[CHAPPS]\nrequire_user_key = True\nuser_key =\n").is_err());
    }
}
