use tracing_subscriber::{EnvFilter, fmt};

/// Builds the filter from `log_filter`, falling back to `RUST_LOG`, then `info`.
fn build_filter(log_filter: &str) -> EnvFilter {
    EnvFilter::try_new(log_filter)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

pub fn init_tracing(service_name: &str, log_filter: &str) {
    let _ = fmt()
        .with_target(false)
        .with_env_filter(build_filter(log_filter))
        .compact()
        .try_init();

    tracing::info!(service = service_name, log_filter, "tracing initialized");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_is_safe_to_call_twice() {
        init_tracing("observability-test", "info");
        init_tracing("observability-test", "debug");
    }
}
