// 监听循环公用的 accept 退避

use std::future::Future;
use std::io;
use std::time::Duration;

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// 反复调用 `accept` 直到成功
///
/// 单次失败（EMFILE、ECONNABORTED 等）只记录日志并退避，不结束监听。
pub(crate) async fn accept_with_backoff<T, F, Fut>(listener: &'static str, mut accept: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = io::Result<T>>,
{
    let mut backoff = ACCEPT_BACKOFF_MIN;
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                tracing::warn!(
                    target: "gb28181::net",
                    listener,
                    backoff_ms = backoff.as_millis() as u64,
                    "Accept failed: {}",
                    e
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
            }
        }
    }
}
