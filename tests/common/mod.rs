use std::sync::Once;

static INIT: Once = Once::new();

/// Shared test setup: coroutine stack size and quiet tracing.
pub fn init() {
    INIT.call_once(|| {
        may::config().set_stack_size(0x10000);
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
    });
}
