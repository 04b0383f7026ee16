//! Log setup shared by the binaries

use tracing_subscriber::EnvFilter;
use tracing_subscriber::FmtSubscriber;

/// Install the global compact fmt subscriber.
///
/// `RUST_LOG` takes precedence over `level` when set.
pub fn init(level: &str) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(false)
        .with_line_number(false)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
