//! Driving async work from the synchronous pipeline path.

use crate::error::Result;
use crate::PipelineError;
use std::future::Future;

/// Run `fut` to completion on a private current-thread runtime.
///
/// Refuses to run when called from inside a tokio runtime, where blocking
/// would stall the executor; callers there should use the async pipeline.
/// Failures are reported against `transformer` so the orchestrator treats
/// them as a recoverable step failure.
pub(crate) fn block_on<F: Future>(transformer: &str, fut: F) -> Result<F::Output> {
    if tokio::runtime::Handle::try_current().is_ok() {
        return Err(PipelineError::transform(
            transformer,
            "synchronous run inside an async runtime; use run_async",
        ));
    }
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            PipelineError::transform(transformer, format!("runtime start failed: {}", e))
        })?;
    Ok(runtime.block_on(fut))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on_outside_runtime() {
        assert_eq!(block_on("t", async { 41 + 1 }).unwrap(), 42);
    }

    #[tokio::test]
    async fn test_block_on_inside_runtime_refuses() {
        let err = block_on("embed", async {}).unwrap_err();
        assert!(err.is_recoverable());
        assert!(err.to_string().contains("run_async"));
    }
}
