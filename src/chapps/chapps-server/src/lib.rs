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

//! The long-running side of CHAPPS: one TCP listener per policy service,
//! one task per Postfix connection, strict request ordering within a
//! connection, and a process that recovers from everything except a bad
//! configuration at startup.

pub mod server;
pub mod service;
pub mod session;

/// Ceiling on the processing of a single request; overruns yield the
/// fallback action instead of a hanging connection.
pub const REQUEST_BUDGET: std::time::Duration = std::time::Duration::from_secs(10);
