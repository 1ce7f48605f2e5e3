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
    field::{FieldListen, Margin},
    Config, ConfigError,
};
use chapps_common::Action;

fn invalid(
    section: &'static str,
    key: &'static str,
    reason: impl Into<String>,
) -> ConfigError {
    ConfigError::Invalid {
        section,
        key,
        reason: reason.into(),
    }
}

/// Overlay `key` of `section` onto `value` when present, converting with
/// `parse`.
fn overlay<T>(
    ini: &ini::Ini,
    section: &'static str,
    key: &'static str,
    value: &mut T,
    parse: impl FnOnce(&str) -> Result<T, String>,
) -> Result<(), ConfigError> {
    if let Some(raw) = ini.section(Some(section)).and_then(|p| p.get(key)) {
        *value = parse(raw).map_err(|reason| invalid(section, key, reason))?;
    }
    Ok(())
}

fn parse_string(raw: &str) -> Result<String, String> {
    Ok(raw.to_owned())
}

// the INI dialect of the original tooling: capitalized booleans allowed
fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw {
        "true" | "True" => Ok(true),
        "false" | "False" => Ok(false),
        _ => Err(format!("expected a boolean, got {raw:?}")),
    }
}

fn parse_u16(raw: &str) -> Result<u16, String> {
    raw.parse::<u16>().map_err(|e| e.to_string())
}

fn parse_u64(raw: &str) -> Result<u64, String> {
    raw.parse::<u64>().map_err(|e| e.to_string())
}

fn parse_seconds(raw: &str) -> Result<std::time::Duration, String> {
    let seconds = raw.parse::<f64>().map_err(|e| e.to_string())?;
    if seconds <= 0.0 || !seconds.is_finite() {
        return Err(format!("expected a positive duration in seconds, got {raw:?}"));
    }
    Ok(std::time::Duration::from_secs_f64(seconds))
}

fn parse_action(raw: &str) -> Result<Action, String> {
    raw.parse::<Action>().map_err(|e| e.to_string())
}

/// Margin grammar: integer -> absolute count; float in `[0,1)` -> ratio of
/// the limit; float in `[1,100)` -> percentage; float `>= 100` -> refused.
fn parse_margin(raw: &str) -> Result<Margin, String> {
    if let Ok(count) = raw.parse::<u64>() {
        return Ok(Margin::Fixed(count));
    }
    let ratio = raw.parse::<f64>().map_err(|e| e.to_string())?;
    if !(0.0..100.0).contains(&ratio) {
        return Err(
            "margin must be a positive integer or a positive float less than 100 (a percentage)"
                .to_owned(),
        );
    }
    Ok(if ratio < 1.0 {
        Margin::Ratio(ratio)
    } else {
        Margin::Ratio(ratio / 100.0)
    })
}

fn overlay_listen(
    ini: &ini::Ini,
    section: &'static str,
    listen: &mut FieldListen,
) -> Result<(), ConfigError> {
    overlay(ini, section, "listen_address", &mut listen.address, parse_string)?;
    overlay(ini, section, "listen_port", &mut listen.port, parse_u16)
}

pub(crate) fn from_ini(path: &std::path::Path, ini: &ini::Ini) -> Result<Config, ConfigError> {
    let mut config = Config {
        path: path.to_owned(),
        chapps: Default::default(),
        redis: Default::default(),
        adapter: Default::default(),
        outbound_quota: Default::default(),
        greylisting: Default::default(),
        sender_auth: Default::default(),
        spf: Default::default(),
        spf_actions: Default::default(),
    };

    {
        const S: &str = "CHAPPS";
        let c = &mut config.chapps;
        overlay(ini, S, "payload_encoding", &mut c.payload_encoding, parse_string)?;
        if !c.payload_encoding.eq_ignore_ascii_case("utf-8") {
            return Err(invalid(
                S,
                "payload_encoding",
                format!("unsupported encoding {:?}", c.payload_encoding),
            ));
        }
        overlay(ini, S, "user_key", &mut c.user_key, parse_string)?;
        overlay(ini, S, "require_user_key", &mut c.require_user_key, parse_bool)?;
        overlay(
            ini,
            S,
            "no_user_key_response",
            &mut c.no_user_key_response,
            parse_action,
        )?;
        if c.require_user_key && c.user_key.trim().is_empty() {
            return Err(invalid(
                S,
                "user_key",
                "must be set when require_user_key is true",
            ));
        }
    }

    {
        const S: &str = "Redis";
        let r = &mut config.redis;
        overlay(ini, S, "sentinel_servers", &mut r.sentinel_servers, |raw| {
            Ok(raw.split_whitespace().map(str::to_owned).collect())
        })?;
        overlay(ini, S, "sentinel_dataset", &mut r.sentinel_dataset, parse_string)?;
        overlay(ini, S, "server", &mut r.server, parse_string)?;
        overlay(ini, S, "port", &mut r.port, parse_u16)?;
        overlay(ini, S, "op_timeout", &mut r.op_timeout, parse_seconds)?;
        if !r.sentinel_servers.is_empty() && r.sentinel_dataset.is_empty() {
            return Err(invalid(
                S,
                "sentinel_dataset",
                "must name the logical master when sentinel_servers is set",
            ));
        }
    }

    {
        const S: &str = "PolicyConfigAdapter";
        let a = &mut config.adapter;
        overlay(ini, S, "adapter", &mut a.adapter, |raw| {
            raw.parse()
                .map_err(|()| format!("unsupported backend {raw:?}"))
        })?;
        overlay(ini, S, "db_host", &mut a.db_host, parse_string)?;
        overlay(ini, S, "db_port", &mut a.db_port, parse_u16)?;
        overlay(ini, S, "db_name", &mut a.db_name, parse_string)?;
        overlay(ini, S, "db_user", &mut a.db_user, parse_string)?;
        overlay(ini, S, "db_pass", &mut a.db_pass, parse_string)?;
    }

    {
        const S: &str = "OutboundQuotaPolicy";
        let q = &mut config.outbound_quota;
        overlay_listen(ini, S, &mut q.listen)?;
        overlay(ini, S, "margin", &mut q.margin, parse_margin)?;
        overlay(ini, S, "min_delta", &mut q.min_delta, parse_u64)?;
        overlay(ini, S, "counting_recipients", &mut q.counting_recipients, parse_bool)?;
        overlay(ini, S, "rejection_message", &mut q.rejection_message, parse_action)?;
        overlay(ini, S, "acceptance_message", &mut q.acceptance_message, parse_action)?;
        overlay(ini, S, "null_sender_ok", &mut q.null_sender_ok, parse_bool)?;
    }

    {
        const S: &str = "GreylistingPolicy";
        let g = &mut config.greylisting;
        overlay_listen(ini, S, &mut g.listen)?;
        overlay(ini, S, "whitelist_threshold", &mut g.whitelist_threshold, parse_u64)?;
        overlay(ini, S, "rejection_message", &mut g.rejection_message, parse_action)?;
        overlay(ini, S, "acceptance_message", &mut g.acceptance_message, parse_action)?;
        overlay(ini, S, "null_sender_ok", &mut g.null_sender_ok, parse_bool)?;
    }

    {
        const S: &str = "SenderDomainAuthPolicy";
        let s = &mut config.sender_auth;
        overlay_listen(ini, S, &mut s.listen)?;
        overlay(ini, S, "rejection_message", &mut s.rejection_message, parse_action)?;
        overlay(ini, S, "acceptance_message", &mut s.acceptance_message, parse_action)?;
        overlay(ini, S, "null_sender_ok", &mut s.null_sender_ok, parse_bool)?;
    }

    {
        const S: &str = "SPFEnforcementPolicy";
        let s = &mut config.spf;
        overlay_listen(ini, S, &mut s.listen)?;
        overlay(ini, S, "timeout", &mut s.timeout, parse_seconds)?;
        overlay(ini, S, "null_sender_ok", &mut s.null_sender_ok, parse_bool)?;
    }

    {
        const S: &str = "PostfixSPFActions";
        let a = &mut config.spf_actions;
        overlay(ini, S, "passing", &mut a.passing, parse_string)?;
        overlay(ini, S, "fail", &mut a.fail, parse_string)?;
        overlay(ini, S, "temperror", &mut a.temperror, parse_string)?;
        overlay(ini, S, "permerror", &mut a.permerror, parse_string)?;
        overlay(ini, S, "none_neutral", &mut a.none_neutral, parse_string)?;
        overlay(ini, S, "softfail", &mut a.softfail, parse_string)?;
    }

    Ok(config)
}
