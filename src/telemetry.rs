use tracing_subscriber::{EnvFilter, Registry, prelude::*};

/// Initialize tracing
///
/// Filtering follows `RUST_LOG` (default `info`); `LOG_FORMAT=json` switches
/// to structured output.
pub async fn init() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    // Decide on layers
    let reg = Registry::default().with(env_filter);
    if json {
        reg.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        reg.with(tracing_subscriber::fmt::layer().compact()).init();
    }
}
