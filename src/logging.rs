use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "querybox=info";

/// Install a global fmt subscriber filtered by `RUST_LOG` (default `querybox=info`).
///
/// Safe to call more than once; later calls are ignored.
pub fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let result = if json {
        fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .json()
            .try_init()
    } else {
        fmt()
            .with_env_filter(filter)
            .with_thread_names(true)
            .try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repeated_init_is_harmless() {
        init_logging(false);
        init_logging(true);
        tracing::info!("still logging");
    }
}
