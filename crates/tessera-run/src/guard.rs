//! Converts a panic inside a run's own task into an ordinary failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tracing::error;

/// Run `future`, returning the panic message if it panicked.
pub async fn catch_panic<F, T>(future: F) -> Result<T, String>
where
  F: Future<Output = T>,
{
  match AssertUnwindSafe(future).catch_unwind().await {
    Ok(value) => Ok(value),
    Err(payload) => {
      let message = panic_message(payload.as_ref());
      error!(panic = %message, "run_panicked");
      Err(message)
    }
  }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "unknown panic".to_string()
  }
}
