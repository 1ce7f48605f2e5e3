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

/// A Postfix action directive, the single line sent back to the MTA as
/// `action=<directive>`.
///
/// See <http://www.postfix.org/SMTPD_POLICY_README.html> and
/// <http://www.postfix.org/access.5.html> for the meaning of each verb.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Action {
    /// No decision, let another restriction decide.
    Dunno,
    /// Accept the mail, skipping further restrictions of the same class.
    Okay,
    /// Permanent refusal, with an optional operator-supplied text.
    Reject(Option<String>),
    /// Temporary refusal, honoured only if the mail would otherwise be
    /// accepted.
    DeferIfPermit(String),
    /// Prepend a header line to the message.
    Prepend(String),
    /// An enhanced status directive such as `550 5.7.1 go away`, kept
    /// verbatim.
    Enhanced(String),
}

/// The directive could not be understood as a Postfix action.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("not a postfix directive: {0:?}")]
pub struct InvalidDirective(pub String);

impl Action {
    /// Does this directive let the mail through?
    ///
    /// `PREPEND` counts as passing since Postfix forwards the message once
    /// the header has been added.
    #[must_use]
    pub const fn is_passing(&self) -> bool {
        matches!(self, Self::Dunno | Self::Okay | Self::Prepend(_))
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Dunno => f.write_str("DUNNO"),
            Self::Okay => f.write_str("OK"),
            Self::Reject(None) => f.write_str("REJECT"),
            Self::Reject(Some(text)) => write!(f, "REJECT {text}"),
            Self::DeferIfPermit(text) => write!(f, "DEFER_IF_PERMIT {text}"),
            Self::Prepend(header) => write!(f, "PREPEND {header}"),
            Self::Enhanced(line) => f.write_str(line),
        }
    }
}

impl std::str::FromStr for Action {
    type Err = InvalidDirective;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (verb, rest) = s.split_once(' ').map_or((s, None), |(verb, rest)| {
            (verb, (!rest.is_empty()).then_some(rest))
        });

        match verb {
            "DUNNO" => Ok(Self::Dunno),
            "OK" => Ok(Self::Okay),
            "REJECT" => Ok(Self::Reject(rest.map(str::to_owned))),
            "DEFER_IF_PERMIT" => Ok(Self::DeferIfPermit(
                rest.ok_or_else(|| InvalidDirective(s.to_owned()))?.to_owned(),
            )),
            "PREPEND" => Ok(Self::Prepend(
                rest.ok_or_else(|| InvalidDirective(s.to_owned()))?.to_owned(),
            )),
            // a leading RFC 5321 code ("550 5.7.1 ...") is forwarded verbatim
            code if code.len() == 3 && code.bytes().all(|b| b.is_ascii_digit()) => {
                Ok(Self::Enhanced(s.to_owned()))
            }
            _ => Err(InvalidDirective(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_round_trip() {
        for directive in [
            "DUNNO",
            "OK",
            "REJECT",
            "REJECT Rejected - outbound quota fulfilled",
            "DEFER_IF_PERMIT Service temporarily unavailable - greylisted",
            "PREPEND Received-SPF: pass",
            "550 5.7.1 SPF check failed",
            "451 4.4.3 SPF record(s) temporarily unavailable",
        ] {
            let action = directive.parse::<Action>().unwrap();
            assert_eq!(action.to_string(), directive);
        }
    }

    #[test]
    fn reject_text_is_optional() {
        assert_eq!("REJECT".parse::<Action>(), Ok(Action::Reject(None)));
        assert_eq!(
            "REJECT nope".parse::<Action>(),
            Ok(Action::Reject(Some("nope".to_owned())))
        );
    }

    #[test]
    fn defer_if_permit_requires_text() {
        assert!("DEFER_IF_PERMIT".parse::<Action>().is_err());
    }

    #[test]
    fn unknown_verbs_are_refused() {
        assert!("HOLD it".parse::<Action>().is_err());
        assert!("42 too short".parse::<Action>().is_err());
        assert!("abcd 5.7.1 not a code".parse::<Action>().is_err());
    }

    #[test]
    fn passing_classification() {
        assert!(Action::Dunno.is_passing());
        assert!(Action::Prepend("Received-SPF: pass".to_owned()).is_passing());
        assert!(!Action::Reject(None).is_passing());
        assert!(!Action::Enhanced("550 5.7.1 no".to_owned()).is_passing());
    }
}
