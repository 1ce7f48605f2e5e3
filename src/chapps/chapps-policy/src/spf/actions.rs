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
use chapps_common::{Action, Status};
use chapps_config::FieldSpfActions;

const DEFAULT_GREYLIST_REASON: &str = "due to SPF enforcement policy";

/// One entry of the `[PostfixSPFActions]` table: a symbolic built-in or a
/// literal directive with optional `{reason}` substitution.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SpfDirective {
    Prepend,
    Okay,
    Dunno,
    Reject,
    DeferIfPermit,
    Greylist,
    Literal(String),
}

impl SpfDirective {
    fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "prepend" => Ok(Self::Prepend),
            "okay" | "ok" => Ok(Self::Okay),
            "dunno" => Ok(Self::Dunno),
            "reject" => Ok(Self::Reject),
            "defer_if_permit" => Ok(Self::DeferIfPermit),
            "greylist" => Ok(Self::Greylist),
            literal => {
                // validate the template once, with the reason blanked
                literal
                    .replace("{reason}", "")
                    .trim()
                    .parse::<Action>()
                    .map_err(|e| e.to_string())?;
                Ok(Self::Literal(literal.to_owned()))
            }
        }
    }
}

/// The complete SPF-result-to-action mapping, validated at config load so a
/// typo fails startup rather than a mail transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfActionTable {
    passing: SpfDirective,
    fail: SpfDirective,
    softfail: SpfDirective,
    none_neutral: SpfDirective,
    temperror: SpfDirective,
    permerror: SpfDirective,
}

impl SpfActionTable {
    /// Interpret the raw `[PostfixSPFActions]` strings.
    ///
    /// # Errors
    ///
    /// * an entry is neither a symbolic built-in nor a parsable directive
    pub fn from_config(cfg: &FieldSpfActions) -> Result<Self, String> {
        let entry = |key: &str, raw: &str| {
            SpfDirective::parse(raw).map_err(|reason| format!("{key}: {reason}"))
        };
        Ok(Self {
            passing: entry("passing", &cfg.passing)?,
            fail: entry("fail", &cfg.fail)?,
            softfail: entry("softfail", &cfg.softfail)?,
            none_neutral: entry("none_neutral", &cfg.none_neutral)?,
            temperror: entry("temperror", &cfg.temperror)?,
            permerror: entry("permerror", &cfg.permerror)?,
        })
    }

    fn directive_for(&self, value: SpfValue) -> &SpfDirective {
        match value {
            SpfValue::Pass => &self.passing,
            SpfValue::Fail => &self.fail,
            SpfValue::SoftFail => &self.softfail,
            SpfValue::None | SpfValue::Neutral => &self.none_neutral,
            SpfValue::TempError => &self.temperror,
            SpfValue::PermError => &self.permerror,
        }
    }

    /// The action sent when the mail ultimately passes, carrying the trace
    /// header.  Used directly for `pass` and replayed after a successful
    /// greylist retry.
    fn pass_action(&self, header: &str) -> Action {
        match &self.passing {
            SpfDirective::Okay => Action::Okay,
            SpfDirective::Dunno => Action::Dunno,
            SpfDirective::Literal(template) => render(template, ""),
            // greylist/reject/defer make no sense for "passing"
            _ => Action::Prepend(header.to_owned()),
        }
    }

    /// Map an evaluator outcome onto the pipeline verdict.
    #[must_use]
    pub fn status_for(&self, outcome: &SpfOutcome, header: &str) -> Status {
        let reason = outcome.explanation.as_str();
        match self.directive_for(outcome.value) {
            SpfDirective::Prepend => Status::Next(Action::Prepend(header.to_owned())),
            SpfDirective::Okay => Status::Next(Action::Okay),
            SpfDirective::Dunno => Status::Next(Action::Dunno),
            SpfDirective::Reject => {
                Status::Deny(Action::Reject(Some(reason.to_owned())))
            }
            SpfDirective::DeferIfPermit => {
                Status::Deny(Action::DeferIfPermit(reason.to_owned()))
            }
            SpfDirective::Greylist => Status::Greylist {
                reason: if reason.is_empty() {
                    DEFAULT_GREYLIST_REASON.to_owned()
                } else {
                    reason.to_owned()
                },
                pass_action: self.pass_action(header),
            },
            SpfDirective::Literal(template) => {
                let action = render(template, reason);
                if action.is_passing() {
                    Status::Next(action)
                } else {
                    Status::Deny(action)
                }
            }
        }
    }
}

fn render(template: &str, reason: &str) -> Action {
    let rendered = template.replace("{reason}", reason);
    rendered.trim().parse::<Action>().unwrap_or_else(|error| {
        // templates are validated at load; reaching this means the reason
        // text broke the directive, which DUNNO survives
        tracing::error!(%error, template, "Configured SPF directive failed to render.");
        Action::Dunno
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> SpfActionTable {
        SpfActionTable::from_config(&FieldSpfActions::default()).unwrap()
    }

    fn outcome(value: SpfValue, explanation: &str) -> SpfOutcome {
        SpfOutcome {
            value,
            explanation: explanation.to_owned(),
        }
    }

    #[test]
    fn pass_prepends_the_trace_header() {
        let status = table().status_for(&outcome(SpfValue::Pass, "ok"), "Received-SPF: pass");
        assert_eq!(
            status,
            Status::Next(Action::Prepend("Received-SPF: pass".to_owned()))
        );
    }

    #[test]
    fn fail_renders_the_literal_with_reason() {
        let status = table().status_for(
            &outcome(SpfValue::Fail, "mechanism -all matched"),
            "Received-SPF: fail",
        );
        assert_eq!(
            status,
            Status::Deny(Action::Enhanced(
                "550 5.7.1 SPF check failed: mechanism -all matched".to_owned()
            ))
        );
    }

    #[test]
    fn temperror_defers_with_a_4xx() {
        let status = table().status_for(
            &outcome(SpfValue::TempError, "lookup timed out"),
            "Received-SPF: temperror",
        );
        match status {
            Status::Deny(Action::Enhanced(line)) => {
                assert!(line.starts_with("451 4.4.3"));
                assert!(line.ends_with("lookup timed out"));
            }
            other => panic!("expected a 451 denial, got {other:?}"),
        }
    }

    #[test]
    fn grey_results_delegate_to_greylisting() {
        for value in [SpfValue::SoftFail, SpfValue::None, SpfValue::Neutral] {
            let status = table().status_for(&outcome(value, ""), "Received-SPF: x");
            assert_eq!(
                status,
                Status::Greylist {
                    reason: "due to SPF enforcement policy".to_owned(),
                    pass_action: Action::Prepend("Received-SPF: x".to_owned()),
                }
            );
        }
    }

    #[test]
    fn every_result_value_has_a_defined_action() {
        let table = table();
        for value in [
            SpfValue::Pass,
            SpfValue::Fail,
            SpfValue::SoftFail,
            SpfValue::Neutral,
            SpfValue::None,
            SpfValue::TempError,
            SpfValue::PermError,
        ] {
            // totality: no result value panics or falls through
            let _ = table.status_for(&outcome(value, "r"), "h");
        }
    }

    #[test]
    fn bogus_table_entries_fail_at_load() {
        let cfg = FieldSpfActions {
            fail: "FROBNICATE {reason}".to_owned(),
            ..FieldSpfActions::default()
        };
        assert!(SpfActionTable::from_config(&cfg).is_err());
    }

    #[test]
    fn symbolic_entries_are_honored() {
        let cfg = FieldSpfActions {
            softfail: "defer_if_permit".to_owned(),
            none_neutral: "dunno".to_owned(),
            ..FieldSpfActions::default()
        };
        let table = SpfActionTable::from_config(&cfg).unwrap();
        assert_eq!(
            table.status_for(&outcome(SpfValue::SoftFail, "soft"), "h"),
            Status::Deny(Action::DeferIfPermit("soft".to_owned()))
        );
        assert_eq!(
            table.status_for(&outcome(SpfValue::None, "n"), "h"),
            Status::Next(Action::Dunno)
        );
    }
}
