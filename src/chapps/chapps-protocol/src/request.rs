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

use crate::Error;

/// A decoded Postfix policy request.
///
/// Attributes are kept in wire order with names and values untouched, so the
/// payload can be reproduced exactly.  Lookups return the *first* occurrence
/// of a name, matching what Postfix would have meant if it ever repeated one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRequest {
    attributes: Vec<(String, String)>,
}

fn valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphabetic() || b == b'_')
}

impl PolicyRequest {
    /// Decode one request payload, terminator included or not.
    ///
    /// Values may contain `=`; only the first one splits the pair.  Leading
    /// and trailing whitespace inside values is preserved.
    ///
    /// # Errors
    ///
    /// * the payload is not valid UTF-8
    /// * a non-empty line has no `=` or a name outside `[A-Za-z_]+`
    pub fn parse(payload: &[u8]) -> Result<Self, Error> {
        let text = std::str::from_utf8(payload)?;

        let mut attributes = Vec::new();
        for line in text.split('\n') {
            if line.is_empty() {
                break;
            }
            let (name, value) = line
                .split_once('=')
                .ok_or_else(|| Error::InvalidLine(line.to_owned()))?;
            if !valid_name(name) {
                return Err(Error::InvalidLine(line.to_owned()));
            }
            attributes.push((name.to_owned(), value.to_owned()));
        }
        Ok(Self { attributes })
    }

    /// First value recorded under `name`, if any.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Like [`Self::get`], treating an empty value as absent.  Postfix sends
    /// every attribute of the protocol stage, empty or not.
    #[must_use]
    pub fn get_non_empty(&self, name: &str) -> Option<&str> {
        self.get(name).filter(|v| !v.is_empty())
    }

    /// The Postfix-assigned transaction id, reused across re-queries about
    /// the same message.
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.get_non_empty("instance")
    }

    /// Envelope sender; empty for the null sender (bounces).
    #[must_use]
    pub fn sender(&self) -> Option<&str> {
        self.get_non_empty("sender")
    }

    /// IP address of the connecting client.
    #[must_use]
    pub fn client_address(&self) -> Option<&str> {
        self.get_non_empty("client_address")
    }

    /// HELO/EHLO name announced by the client.
    #[must_use]
    pub fn helo_name(&self) -> Option<&str> {
        self.get_non_empty("helo_name")
    }

    /// Recipient addresses, comma-split from the `recipient` attribute.
    ///
    /// Postfix reports `recipient_count=0` before the DATA stage, so the
    /// addresses are counted directly rather than trusting that attribute.
    #[must_use]
    pub fn recipients(&self) -> Vec<&str> {
        self.get_non_empty("recipient")
            .map(|r| r.split(',').collect())
            .unwrap_or_default()
    }

    /// Number of RCPT TO entries: the larger of `recipient_count` and the
    /// recipient list itself.
    #[must_use]
    pub fn recipient_count(&self) -> usize {
        let counted = self
            .get_non_empty("recipient_count")
            .and_then(|c| c.parse::<usize>().ok())
            .unwrap_or(0);
        counted.max(self.recipients().len())
    }

    /// Re-encode the request as it arrived, terminator included.
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (name, value) in &self.attributes {
            out.extend_from_slice(name.as_bytes());
            out.push(b'=');
            out.extend_from_slice(value.as_bytes());
            out.push(b'\n');
        }
        out.push(b'\n');
        out
    }

    /// Number of attributes carried.
    #[must_use]
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    /// Whether the request carried no attribute at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

/// Log-friendly one-liner naming the fields operators grep for.
impl std::fmt::Display for PolicyRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "i={} sender={} client_address={} recipient={}",
            self.instance().unwrap_or("-"),
            self.sender().unwrap_or("-"),
            self.client_address().unwrap_or("-"),
            self.get_non_empty("recipient").unwrap_or("-"),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::PolicyRequest;

    fn sample() -> &'static [u8] {
        b"request=smtpd_access_policy\n\
          protocol_state=RCPT\n\
          helo_name=helo.chapps.io\n\
          sender=unauth@easydns.com\n\
          recipient=bar@foo.tld,baz@foo.tld\n\
          recipient_count=0\n\
          client_address=10.10.10.10\n\
          instance=a483.61706bf9.17663.0\n\
          sasl_username=somebody@chapps.io\n\
          ccert_subject=\n\
          \n"
    }

    #[test]
    fn parses_the_postfix_sample_payload() {
        let ppr = PolicyRequest::parse(sample()).unwrap();
        assert_eq!(ppr.sender(), Some("unauth@easydns.com"));
        assert_eq!(ppr.client_address(), Some("10.10.10.10"));
        assert_eq!(ppr.instance(), Some("a483.61706bf9.17663.0"));
        assert_eq!(ppr.recipients(), vec!["bar@foo.tld", "baz@foo.tld"]);
        // recipient_count=0 before DATA; the address list wins
        assert_eq!(ppr.recipient_count(), 2);
        // present but empty reads as absent
        assert_eq!(ppr.get("ccert_subject"), Some(""));
        assert_eq!(ppr.get_non_empty("ccert_subject"), None);
    }

    #[test]
    fn only_the_first_equals_sign_splits() {
        let ppr =
            PolicyRequest::parse(b"ccert_subject=CN=mail.chapps.io, O=EasyDNS\n\n").unwrap();
        assert_eq!(
            ppr.get("ccert_subject"),
            Some("CN=mail.chapps.io, O=EasyDNS")
        );
    }

    #[test]
    fn whitespace_in_values_is_preserved() {
        let ppr = PolicyRequest::parse(b"stress=  yes \n\n").unwrap();
        assert_eq!(ppr.get("stress"), Some("  yes "));
    }

    #[test]
    fn round_trip_is_lossless() {
        let payload: &[u8] = b"a=x=y\nb_c= padded \nd=\n\n";
        let ppr = PolicyRequest::parse(payload).unwrap();
        assert_eq!(ppr.serialize(), payload);
        assert_eq!(PolicyRequest::parse(&ppr.serialize()).unwrap(), ppr);
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(PolicyRequest::parse(b"no-equals-here\n\n").is_err());
        assert!(PolicyRequest::parse(b"=value\n\n").is_err());
        assert!(PolicyRequest::parse(b"bad name=value\n\n").is_err());
        assert!(PolicyRequest::parse(b"\xff\xfe\n\n").is_err());
    }

    #[test]
    fn first_occurrence_wins() {
        let ppr = PolicyRequest::parse(b"sender=a@x\nsender=b@y\n\n").unwrap();
        assert_eq!(ppr.sender(), Some("a@x"));
    }
}
