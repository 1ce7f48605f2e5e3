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

//! The wire protocol spoken between Postfix and a policy delegate.
//!
//! A request is a sequence of `name=value\n` attribute lines terminated by a
//! bare `\n`; the response is a single `action=<directive>\n\n`.  The
//! connection is long-lived and carries many request/response pairs, strictly
//! in order.
//!
//! See <http://www.postfix.org/SMTPD_POLICY_README.html>.

mod error;
mod reader;
mod request;
mod writer;

pub use error::Error;
pub use reader::Reader;
pub use request::PolicyRequest;
pub use writer::Writer;

/// Upper bound on a single request, shared default of reader construction
/// and configuration.
pub const DEFAULT_REQUEST_SIZE_MAX: usize = 64 * 1024;
