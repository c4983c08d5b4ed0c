use std::sync::Once;

pub struct TestContext {
    pub crate_root: String,
}

pub static INIT_TEST_ONCE: Once = Once::new();

/// Loads optional env files and configures logging once per test binary.
#[macro_export]
macro_rules! setup_test {
    () => {{
        $crate::test_utils::helpers::INIT_TEST_ONCE.call_once(|| {
            $crate::env::configure_env().unwrap();
            $crate::logging::configure_logging().unwrap();
        });

        $crate::test_utils::helpers::TestContext {
            crate_root: env!("CARGO_MANIFEST_DIR").to_string(),
        }
    }};
}
