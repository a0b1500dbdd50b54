// Copyright (c) Anza Technology, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logging setup.
//!
//! Library code logs through the [`log`] facade; this module wires the facade
//! to [`logforth`] with a compact stderr layout. Initialization is optional
//! and idempotent, so tests and binaries can both call [`init`] freely. The
//! filter comes from the standard `RUST_LOG` environment variable.

use std::sync::Once;

use logforth::color::LevelColor;
use logforth::filter::EnvFilter;
use logforth::{Layout, append};

static INIT: Once = Once::new();

/// Compact layout: colored level, message, nothing else.
#[derive(Debug, Clone, Copy)]
struct CompactLayout;

impl Layout for CompactLayout {
    fn format(
        &self,
        record: &log::Record,
        _: &[Box<dyn logforth::Diagnostic>],
    ) -> anyhow::Result<Vec<u8>> {
        let colors = LevelColor::default();
        let level = colors.colorize_record_level(false, record.level());
        let message = record.args();
        Ok(format!("{level:>5} {message}").into_bytes())
    }
}

/// Installs the compact stderr logger. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        logforth::builder()
            .dispatch(|d| {
                d.filter(EnvFilter::from_default_env())
                    .append(append::Stderr::default().with_layout(CompactLayout))
            })
            .apply();
    });
}

/// Installs the default logforth stderr appender instead of the compact one.
pub fn init_verbose() {
    INIT.call_once(|| {
        logforth::builder()
            .dispatch(|d| {
                d.filter(EnvFilter::from_default_env())
                    .append(append::Stderr::default())
            })
            .apply();
    });
}
