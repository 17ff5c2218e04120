//! Panic recovery at dispatch boundaries.
//!
//! Exactly two places wrap work with these guards: the server-side envelope
//! handler and the router's local and remote call paths. A panic inside a
//! component handler is logged with a backtrace and turned into
//! `Error::Server`; it never unwinds into the caller or kills the serving
//! process.

use futures::FutureExt;
use std::backtrace::Backtrace;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use crate::types::{Error, Result};

/// Run a future with panic recovery.
///
/// If the future panics while being polled, the panic is captured, logged,
/// and converted to `Error::Server`.
pub async fn with_recovery_async<Fut, T>(future: Fut, operation_name: &str) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => result,
        Err(panic_payload) => {
            let panic_msg = extract_panic_message(panic_payload.as_ref());
            let backtrace = Backtrace::force_capture();
            tracing::error!(
                operation = operation_name,
                panic = %panic_msg,
                backtrace = %backtrace,
                "panic_recovered"
            );

            Err(Error::server(format!(
                "Panic in {}: {}",
                operation_name, panic_msg
            )))
        }
    }
}

/// Extract panic message from panic payload.
fn extract_panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic (no message)".to_string()
    }
}
