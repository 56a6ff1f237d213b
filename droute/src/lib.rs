// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Routing and serving mechanism for the resolver: configuration
//! loading, upstream dispatch, the query pipeline, and the request-log
//! sink.

/// Configuration loading and validation (C3).
pub mod config;
/// Upstream dispatch (C5).
pub mod dispatch;
/// Error types shared by configuration and dispatch.
pub mod error;
/// The request-log sink (C4).
pub mod log_sink;
/// The query pipeline (C6).
pub mod pipeline;

pub use config::Config;
pub use dispatch::AddressFamily;
pub use log_sink::{LogSink, RequestLog};
pub use pipeline::Pipeline;
