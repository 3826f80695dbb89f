//! Logging setup. Every process installs its own subscriber; the
//! `LOG (brief|verbose)` control command flips the filter at runtime
//! through the reload handle.

use std::sync::Mutex;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry};

static HANDLE: Mutex<Option<reload::Handle<EnvFilter, Registry>>> = Mutex::new(None);

fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Install the subscriber. RUST_LOG wins over the -v level.
pub fn init(verbose: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(verbose)));
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .try_init()
        .map_err(|e| anyhow::anyhow!("logger init: {e}"))?;
    *HANDLE.lock().unwrap() = Some(handle);
    Ok(())
}

/// Runtime switch driven by the control socket.
pub fn set_verbose(verbose: bool) {
    let filter = EnvFilter::new(if verbose { "debug" } else { "info" });
    if let Some(handle) = HANDLE.lock().unwrap().as_ref() {
        if let Err(e) = handle.reload(filter) {
            eprintln!("log level reload failed: {e}");
        }
    }
}
