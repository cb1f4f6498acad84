use std::fmt;
use std::fmt::Write;

use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::{prelude::*, registry::Registry, EnvFilter};

use super::error::Result;

pub mod prelude {
    pub use tracing::{debug, error, info, trace, warn};
    pub use tracing::{debug_span, error_span, info_span, trace_span, warn_span};
    pub use tracing::{event, field::Empty, instrument, span};
}

/// Install the global subscriber: an env-filtered fmt layer on stderr.
///
/// `RUST_LOG` controls the filter; defaults to `info` for this crate.
pub fn setup() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("batchsim=info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_timer(ISOTimeFormat)
        .with_writer(std::io::stderr);
    Registry::default().with(filter).with(fmt).try_init()?;
    Ok(())
}

struct ISOTimeFormat;

impl FormatTime for ISOTimeFormat {
    fn format_time(&self, w: &mut dyn Write) -> fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}
