pub mod mock_source;
pub mod mock_ws;

use std::time::Duration;

/// Poll `condition` every 20ms until it holds or `limit` passes.
pub async fn wait_for<F>(limit: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(limit, async {
        loop {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}
