//! Execute a task and wait for it to finish.
//!
//! `execute` calls return immediately with a queued [`Update`]. The helpers
//! here poll `read/GetUpdate` until the update reaches `Complete`.

use std::time::Duration;

use futures_util::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

use crate::retry::with_timeout;
use crate::rpc::{ClientDefaults, KomodoClient, RpcError};
use crate::stream::proto::{BatchExecutionItem, Update};

/// How `read/GetUpdate` is polled while waiting for completion.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PollOptions {
    /// Sleep before each status read.
    pub interval: Duration,
    /// Total time allowed for one update to complete. `None` waits forever.
    pub timeout: Option<Duration>,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            interval: ClientDefaults::POLL_INTERVAL,
            timeout: None,
        }
    }
}

/// Failure while executing or waiting for an update.
#[derive(Debug, Error)]
pub enum PollError {
    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("update {id} did not complete within {timeout:?}")]
    TimedOut { id: String, timeout: Duration },

    #[error("execution response did not include an update id")]
    MissingUpdateId,
}

/// Raw `execute` response: a single update or one item per batch target.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ExecuteResponse {
    Batch(Vec<BatchExecutionItem>),
    Single(Update),
}

/// Completed form of a batch item.
///
/// Serializes exactly like the server payload it stands for: failed items
/// unchanged, successful ones as the completed update.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PolledBatchItem {
    Failed(BatchExecutionItem),
    Complete(Update),
}

/// Result of [`KomodoClient::execute_and_poll`], shaped like the `execute` response.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum PolledExecution {
    Single(Update),
    Batch(Vec<PolledBatchItem>),
}

impl KomodoClient {
    /// Runs `execute/{operation}` and waits for every resulting update.
    ///
    /// Batch items are polled concurrently; the output keeps the response
    /// order and passes failed items through untouched.
    pub async fn execute_and_poll<P>(
        &self,
        operation: &str,
        params: &P,
    ) -> Result<PolledExecution, PollError>
    where
        P: Serialize + ?Sized,
    {
        let response: ExecuteResponse = self.execute(operation, params).await?;

        match response {
            ExecuteResponse::Single(update) => {
                let id = update.id().ok_or(PollError::MissingUpdateId)?;
                let complete = self.poll_update_until_complete(id).await?;
                Ok(PolledExecution::Single(complete))
            }
            ExecuteResponse::Batch(items) => {
                debug!(event = "batch_execution_submitted", operation, items = items.len());
                let polled = try_join_all(items.into_iter().map(|item| self.poll_batch_item(item)))
                    .await?;
                Ok(PolledExecution::Batch(polled))
            }
        }
    }

    /// Polls with the client's [`PollOptions`].
    pub async fn poll_update_until_complete(&self, id: &str) -> Result<Update, PollError> {
        let options = self.poll_options().clone();
        self.poll_update_until_complete_with(id, &options).await
    }

    /// Polls update `id` until it is `Complete`, using `options`.
    pub async fn poll_update_until_complete_with(
        &self,
        id: &str,
        options: &PollOptions,
    ) -> Result<Update, PollError> {
        let Some(timeout) = options.timeout else {
            return self.poll_loop(id, options.interval).await;
        };

        with_timeout(timeout, self.poll_loop(id, options.interval))
            .await
            .map_err(|_| PollError::TimedOut {
                id: id.to_string(),
                timeout,
            })?
    }

    async fn poll_batch_item(&self, item: BatchExecutionItem) -> Result<PolledBatchItem, PollError> {
        let update = match item {
            BatchExecutionItem::Ok(update) => update,
            failed @ BatchExecutionItem::Err(_) => return Ok(PolledBatchItem::Failed(failed)),
        };
        let id = update.id().ok_or(PollError::MissingUpdateId)?;
        let complete = self.poll_update_until_complete(id).await?;
        Ok(PolledBatchItem::Complete(complete))
    }

    async fn poll_loop(&self, id: &str, interval: Duration) -> Result<Update, PollError> {
        let mut polls: u64 = 0;
        loop {
            tokio::time::sleep(interval).await;
            polls += 1;

            let update: Update = self.read("GetUpdate", &json!({ "id": id })).await?;
            if update.is_complete() {
                debug!(event = "update_complete", id, polls);
                return Ok(update);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{ExecuteResponse, PolledBatchItem, PolledExecution, PollOptions};
    use crate::stream::proto::{BatchExecutionItem, Update};

    #[test]
    fn execute_response_distinguishes_batch_from_single() {
        let single: ExecuteResponse =
            serde_json::from_value(json!({"_id": {"$oid": "u1"}, "status": "Queued"}))
                .expect("parse single");
        assert!(matches!(single, ExecuteResponse::Single(_)));

        let batch: ExecuteResponse = serde_json::from_value(json!([
            {"status": "Ok", "data": {"_id": {"$oid": "u1"}, "status": "Queued"}}
        ]))
        .expect("parse batch");
        assert!(matches!(batch, ExecuteResponse::Batch(items) if items.len() == 1));
    }

    #[test]
    fn polled_batch_serializes_like_the_server_payload() {
        let failed = json!({"status": "Err", "data": {"name": "web", "error": {"error": "x", "trace": []}}});
        let complete = json!({"_id": {"$oid": "u1"}, "status": "Complete", "success": true});

        let output = PolledExecution::Batch(vec![
            PolledBatchItem::Failed(
                serde_json::from_value::<BatchExecutionItem>(failed.clone()).expect("parse err"),
            ),
            PolledBatchItem::Complete(
                serde_json::from_value::<Update>(complete.clone()).expect("parse update"),
            ),
        ]);

        assert_eq!(
            serde_json::to_value(output).expect("serialize"),
            json!([failed, complete])
        );
    }

    #[test]
    fn default_poll_options_wait_one_second_without_deadline() {
        let options = PollOptions::default();
        assert_eq!(options.interval.as_millis(), 1000);
        assert!(options.timeout.is_none());
    }
}
