use std::sync::Once;

static INIT: Once = Once::new();

/// 统一测试环境初始化（tracing）；多次调用只生效一次。
pub fn init_test_env() {
    INIT.call_once(|| {
        if std::env::var("RUST_LOG").is_err() {
            std::env::set_var("RUST_LOG", "info");
        }
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
