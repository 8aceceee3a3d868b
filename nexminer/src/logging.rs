// Copyright (C) 2020  Nexminer contributors
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
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Logging setup and the macro prelude used across all nexminer crates.
//!
//! Import as `use nexminer::logging::macros::*;` to get the usual leveled
//! macros in scope.

pub mod macros {
    pub use tracing::{debug, error, info, trace, warn};
}

/// Initialize logging for an application binary. The `NEXMINER_LOG`
/// environment variable overrides the default `info` filter.
pub fn setup_for_app() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("NEXMINER_LOG")
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
