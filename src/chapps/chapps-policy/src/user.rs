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

use crate::PolicyError;
use chapps_config::FieldChapps;
use chapps_protocol::PolicyRequest;

/// Fallback search path when the configured key yields nothing.
const DEFAULT_USER_KEYS: [&str; 4] =
    ["sasl_username", "ccert_subject", "sender", "client_address"];

/// Extract the user-identifier of an outbound request.
///
/// The identifier is the `users.name` every outbound lookup hinges on.  With
/// `require_user_key` set, only the configured attribute counts and its
/// absence is an authentication failure; otherwise the configured attribute
/// is tried first and the usual suspects after it.  The value is only ever
/// used as a lookup string.
///
/// # Errors
///
/// * [`PolicyError::AuthenticationFailed`] when no candidate has a value
pub fn extract_user(
    request: &PolicyRequest,
    cfg: &FieldChapps,
) -> Result<String, PolicyError> {
    let mut keys: Vec<&str> = vec![cfg.user_key.as_str()];
    if !cfg.require_user_key {
        keys.extend(
            DEFAULT_USER_KEYS
                .iter()
                .filter(|k| **k != cfg.user_key.as_str()),
        );
    }

    keys.iter()
        .find_map(|key| request.get_non_empty(key))
        .map(str::to_owned)
        .ok_or_else(|| PolicyError::AuthenticationFailed {
            tried: keys.iter().map(|k| (*k).to_owned()).collect(),
        })
}

#[cfg(test)]
mod tests {
    use super::extract_user;
    use crate::PolicyError;
    use chapps_config::FieldChapps;
    use chapps_protocol::PolicyRequest;

    fn request(payload: &[u8]) -> PolicyRequest {
        PolicyRequest::parse(payload).unwrap()
    }

    #[test]
    fn primary_key_wins() {
        let ppr = request(b"sasl_username=caleb@chapps.io\nsender=other@x.tld\n\n");
        let user = extract_user(&ppr, &FieldChapps::default()).unwrap();
        assert_eq!(user, "caleb@chapps.io");
    }

    #[test]
    fn falls_through_the_search_path() {
        let ppr = request(
            b"sasl_username=\nccert_subject=\nsender=\nclient_address=10.10.10.10\n\n",
        );
        let user = extract_user(&ppr, &FieldChapps::default()).unwrap();
        assert_eq!(user, "10.10.10.10");
    }

    #[test]
    fn configured_key_goes_first() {
        let cfg = FieldChapps {
            user_key: "ccert_subject".to_owned(),
            ..FieldChapps::default()
        };
        let ppr = request(b"sasl_username=one@x\nccert_subject=two@y\n\n");
        assert_eq!(extract_user(&ppr, &cfg).unwrap(), "two@y");
    }

    #[test]
    fn require_user_key_consults_nothing_else() {
        let cfg = FieldChapps {
            require_user_key: true,
            ..FieldChapps::default()
        };
        let ppr = request(b"sender=someone@x.tld\nclient_address=10.0.0.1\n\n");
        match extract_user(&ppr, &cfg) {
            Err(PolicyError::AuthenticationFailed { tried }) => {
                assert_eq!(tried, vec!["sasl_username".to_owned()]);
            }
            other => panic!("expected AuthenticationFailed, got {other:?}"),
        }
    }
}
