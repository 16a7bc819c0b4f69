//! Process-wide `tracing` setup.
//!
//! Logs go to stderr so stdout stays free for pipeline output. The filter is
//! read from `GRIDDLE_LOG` using `EnvFilter` syntax, e.g.
//! `GRIDDLE_LOG=griddle=debug,info`; the default level is `info`.

use std::sync::Once;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

pub const LOG_ENV: &str = "GRIDDLE_LOG";

/// Dependencies that are only interesting when something is broken.
const QUIET_TARGETS: &[&str] = &["hyper=warn", "hyper_util=warn", "reqwest=warn", "rustls=warn", "h2=warn"];

static INIT: Once = Once::new();

/// Installs the stderr subscriber. Only the first call has any effect, and
/// a subscriber installed by someone else is left in place.
pub fn init() {
    INIT.call_once(|| {
        let layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_filter(filters());
        // Fails only when a global subscriber already exists.
        let _ = tracing_subscriber::registry().with(layer).try_init();
    });
}

fn filters() -> EnvFilter {
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .with_env_var(LOG_ENV)
        .from_env_lossy();
    for target in QUIET_TARGETS {
        if let Ok(directive) = target.parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}
