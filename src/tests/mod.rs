// Test modules for Marketchat
// Each module tests the corresponding source module; shared fixtures live in `helpers`

/// Poll an (async) condition until it holds, failing the test after 3 seconds
macro_rules! wait_for {
    ($cond:expr) => {{
        let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
        loop {
            if $cond {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for: {}",
                stringify!($cond)
            );
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }};
}

mod helpers;
