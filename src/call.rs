//! Call orchestration shared by both directions.
//!
//! A caller is single-flight: its result-channel receiver lives behind a
//! tokio `Mutex`, and holding that lock is the in-flight permit.  With one
//! outstanding call per caller, a plain channel replaces a correlation
//! table -- any result that does not match the awaited
//! (waiter, method, suffix) triple is defensive noise and is dropped.

use crate::codec::{JsonMap, ResultEnvelope};
use crate::error::RpcError;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::debug;

/// Default window an outbound call waits for its result.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(3);

/// Four random alphanumerics, unique enough for one in-flight call.
pub(crate) fn correlation_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(4)
        .map(char::from)
        .collect()
}

/// Await the result matching `(waiter, method, suffix)` on `rx`.
///
/// Channel closure means the connection's close path dropped the sender:
/// the call resolves with `disconnect`.  The deadline covers the whole
/// wait, including time burned skipping non-matching results.
pub(crate) async fn await_result(
    rx: &mut mpsc::Receiver<ResultEnvelope>,
    waiter: &str,
    method: &str,
    suffix: &str,
    window: Duration,
) -> Result<JsonMap, RpcError> {
    let deadline = Instant::now() + window;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, rx.recv()).await {
            Err(_) => return Err(RpcError::CallTimeout),
            Ok(None) => return Err(RpcError::Disconnect),
            Ok(Some(result))
                if result.waiter == waiter
                    && result.method == method
                    && result.correlation == suffix =>
            {
                if result.err.is_empty() {
                    return Ok(result.output);
                }
                return Err(RpcError::from_wire(result.err));
            }
            Ok(Some(stray)) => {
                debug!(
                    waiter = %stray.waiter,
                    method = %stray.method,
                    "dropping result that matches no in-flight call"
                );
            }
        }
    }
}
