use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

/// Directive used when `RUST_LOG` is unset or unparsable.
const DEFAULT_DIRECTIVE: &str = "info";

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global fmt subscriber. Later calls are no-ops, so tests and
/// the binary can both call it.
pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
        if let Err(err) = fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
        {
            // another global subscriber owns the output; report through it
            tracing::debug!(%err, "tracing subscriber already installed");
        }
    });
}
