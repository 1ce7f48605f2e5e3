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

use crate::field::{
    AdapterBackend, FieldAdapter, FieldChapps, FieldGreylisting, FieldListen,
    FieldOutboundQuota, FieldRedis, FieldSenderAuth, FieldSpf, FieldSpfActions, Margin,
};
use chapps_common::Action;

impl Default for FieldChapps {
    fn default() -> Self {
        Self {
            payload_encoding: "utf-8".to_owned(),
            user_key: "sasl_username".to_owned(),
            require_user_key: false,
            no_user_key_response: Action::Reject(Some(
                "Rejected - Authentication failed".to_owned(),
            )),
        }
    }
}

impl Default for FieldAdapter {
    fn default() -> Self {
        Self {
            adapter: AdapterBackend::Mysql,
            db_host: "localhost".to_owned(),
            db_port: 3306,
            db_name: "chapps".to_owned(),
            db_user: "chapps".to_owned(),
            db_pass: "chapps".to_owned(),
        }
    }
}

impl Default for FieldRedis {
    fn default() -> Self {
        Self {
            sentinel_servers: vec![],
            sentinel_dataset: String::new(),
            server: "localhost".to_owned(),
            port: 6379,
            op_timeout: std::time::Duration::from_secs(2),
        }
    }
}

impl FieldListen {
    pub(crate) fn localhost(port: u16) -> Self {
        Self {
            address: "localhost".to_owned(),
            port,
        }
    }
}

impl Default for FieldOutboundQuota {
    fn default() -> Self {
        Self {
            listen: FieldListen::localhost(10225),
            margin: Margin::Ratio(0.10),
            min_delta: 0,
            counting_recipients: true,
            rejection_message: Action::Reject(Some(
                "Rejected - outbound quota fulfilled".to_owned(),
            )),
            acceptance_message: Action::Dunno,
            null_sender_ok: false,
        }
    }
}

impl Default for FieldGreylisting {
    fn default() -> Self {
        Self {
            listen: FieldListen::localhost(10226),
            whitelist_threshold: 10,
            rejection_message: Action::DeferIfPermit(
                "Service temporarily unavailable - greylisted".to_owned(),
            ),
            acceptance_message: Action::Dunno,
            null_sender_ok: false,
        }
    }
}

impl Default for FieldSenderAuth {
    fn default() -> Self {
        Self {
            listen: FieldListen::localhost(10225),
            rejection_message: Action::Reject(Some(
                "Rejected - not allowed to send mail from this domain".to_owned(),
            )),
            acceptance_message: Action::Dunno,
            null_sender_ok: false,
        }
    }
}

impl Default for FieldSpf {
    fn default() -> Self {
        Self {
            listen: FieldListen::localhost(10227),
            timeout: std::time::Duration::from_secs(20),
            null_sender_ok: false,
        }
    }
}

impl Default for FieldSpfActions {
    fn default() -> Self {
        Self {
            passing: "prepend".to_owned(),
            fail: "550 5.7.1 SPF check failed: {reason}".to_owned(),
            temperror: "451 4.4.3 SPF record(s) temporarily unavailable: {reason}".to_owned(),
            permerror: "550 5.5.2 SPF record(s) are malformed: {reason}".to_owned(),
            none_neutral: "greylist".to_owned(),
            softfail: "greylist".to_owned(),
        }
    }
}
