// Copyright (C) Microsoft Corporation. All rights reserved.

//! Test attribute that routes `tracing` output of the SeP crates to the test
//! harness.
//!
//! Use `#[test_with_tracing::test]` (or `use test_with_tracing::test;` followed
//! by a plain `#[test]`) in place of the built-in attribute.

// Test support only; `expect` is acceptable when the subscriber cannot start.
#![allow(clippy::expect_used)]

#[cfg(test)]
extern crate self as test_with_tracing;

pub use test_with_tracing_macro::test;
use tracing::metadata::LevelFilter;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::prelude::*;

/// Default verbosity per crate when `RUST_LOG` is not set. The descriptor
/// queue and the simulated device are chatty at `trace`.
fn default_targets() -> Targets {
    Targets::new()
        .with_target("sep_driver", LevelFilter::DEBUG)
        .with_target("sep_sim", LevelFilter::INFO)
        .with_target("sep_interface", LevelFilter::INFO)
        .with_default(LevelFilter::WARN)
}

#[doc(hidden)]
/// Installs the test subscriber once per test binary.
pub fn init() {
    static ONCE: std::sync::Once = std::sync::Once::new();

    ONCE.call_once(|| {
        let targets = match std::env::var("RUST_LOG") {
            Ok(var) => var
                .parse()
                .expect("Failed to parse RUST_LOG environment variable"),
            Err(_) => default_targets(),
        };

        tracing_subscriber::fmt()
            .with_ansi(false)
            .log_internal_errors(true)
            .with_test_writer()
            .with_max_level(LevelFilter::TRACE)
            .with_thread_names(true)
            .finish()
            .with(targets)
            .init();
    });
}

#[cfg(test)]
mod tests {
    use super::test;

    #[test]
    fn init_is_idempotent() {
        super::init();
        super::init();
        tracing::debug!(target: "sep_driver", "subscriber installed");
    }

    #[test]
    fn bridges_log_records() {
        log::info!("log record reaches the test writer");
    }

    #[test]
    fn supports_result_return() -> Result<(), Box<dyn std::error::Error>> {
        tracing::info!("ok");
        Ok(())
    }
}
