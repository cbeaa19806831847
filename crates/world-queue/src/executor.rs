//! The executor seam
//!
//! The queue never imports the engine that actually runs workflow and step
//! logic; it is handed something callable and dispatches every leased job
//! through it. A handler error is a plain string so the queue can store it
//! on the job row verbatim.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;

use crate::message::MessageData;

/// Outcome of one dispatch; `Err` carries the text recorded on the job row
pub type DispatchResult = std::result::Result<(), String>;

/// Receives every leased job.
///
/// `queue_name` is the reconstructed caller-side name
/// (`__wkf_workflow_<id>` / `__wkf_step_<id>`), not the job-queue name the
/// row was stored under.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn call(&self, queue_name: &str, message: MessageData) -> DispatchResult;
}

type BoxedHandler = Box<
    dyn Fn(String, MessageData) -> Pin<Box<dyn Future<Output = DispatchResult> + Send>>
        + Send
        + Sync,
>;

/// Adapter turning a plain async closure into an [`Executor`]
pub struct FnExecutor {
    handler: BoxedHandler,
}

#[async_trait]
impl Executor for FnExecutor {
    async fn call(&self, queue_name: &str, message: MessageData) -> DispatchResult {
        (self.handler)(queue_name.to_string(), message).await
    }
}

/// Wrap an async closure as an executor
///
/// ```ignore
/// let executor = executor_fn(|queue_name, message| async move {
///     engine.dispatch(&queue_name, message).await.map_err(|e| e.to_string())
/// });
/// ```
pub fn executor_fn<F, Fut>(handler: F) -> FnExecutor
where
    F: Fn(String, MessageData) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = DispatchResult> + Send + 'static,
{
    FnExecutor {
        handler: Box::new(move |queue_name, message| Box::pin(handler(queue_name, message))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_fn_executor_dispatches() {
        let executor = executor_fn(|queue_name, message| async move {
            if queue_name == "__wkf_workflow_ok" && message.attempt == 1 {
                Ok(())
            } else {
                Err("unexpected dispatch".to_string())
            }
        });

        let message = MessageData {
            id: "ok".into(),
            data: json!({}),
            attempt: 1,
            message_id: "msg_1".into(),
            idempotency_key: None,
        };

        assert!(executor.call("__wkf_workflow_ok", message.clone()).await.is_ok());
        assert!(executor.call("__wkf_step_other", message).await.is_err());
    }
}
