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

//! Policy managers of CHAPPS and the pipeline that composes them.
//!
//! Each policy consults Redis first and falls through to the relational
//! policy-config store on a miss, mirroring what it learned back into Redis
//! under its own key prefix.  The [`handler::CascadingPolicyHandler`] runs
//! several policies over one request and reduces their verdicts to the
//! single action Postfix expects.

pub mod cache;
mod error;
mod greylist;
pub mod handler;
mod outbound_quota;
mod sender_auth;
pub mod spf;
mod store;
mod user;

pub use cache::Cache;
pub use error::PolicyError;
pub use greylist::GreylistingPolicy;
pub use handler::{CascadingPolicyHandler, Policy};
pub use outbound_quota::OutboundQuotaPolicy;
pub use sender_auth::{SdaStatus, SenderDomainAuthPolicy};
pub use spf::{DnsSpfEvaluator, SpfActionTable, SpfEnforcementPolicy, SpfEvaluator};
pub use store::{PolicyStore, SqlPolicyStore};
pub use user::extract_user;
