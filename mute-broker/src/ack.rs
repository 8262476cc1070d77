//! Hands tasks to capture clients and waits for them to be acknowledged.
//!
//! A task is acknowledged twice: once when a client receives it (the receipt)
//! and once when the client reports whether applying it worked (the completion).
//! Both channels are subscribed before the task is queued,
//! so a marker published immediately after the push cannot be missed.

use crate::keys::Keys;
use crate::queue::TaskQueue;
use crate::store::{Store, Subscription};
use crate::task::ModifyTask;
use crate::timeout::TimeoutOr;
use crate::validate::ConnectCode;
use slog::Logger;
use std::sync::Arc;
use std::time::Duration;

/// Marker published on a completion channel when the task was applied
pub const SUCCESS_MARKER: &str = "true";
/// Marker published on a completion channel when the task could not be applied
pub const FAILURE_MARKER: &str = "false";

#[derive(Debug, thiserror::Error)]
#[error("subscription closed before a marker arrived")]
pub struct SubscriptionClosed;

/// Races the first message of a subscription against a timer
pub async fn await_marker(
    subscription: &mut Subscription,
    timeout: Duration,
) -> Result<String, TimeoutOr<SubscriptionClosed>> {
    crate::timeout::timeout(timeout, async {
        subscription.next().await.ok_or(SubscriptionClosed)
    })
    .await
}

#[derive(Clone, Copy, Debug)]
pub struct AckTimeouts {
    pub receipt: Duration,
    pub completion: Duration,
}

pub struct AckCoordinator {
    store: Arc<dyn Store>,
    tasks: Arc<TaskQueue>,
    keys: Keys,
    timeouts: AckTimeouts,
    logger: Logger,
}

impl AckCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        tasks: Arc<TaskQueue>,
        keys: Keys,
        timeouts: AckTimeouts,
        logger: Logger,
    ) -> Self {
        Self {
            store,
            tasks,
            keys,
            timeouts,
            logger,
        }
    }

    /// Queues the task for the capture client behind `code`
    /// and reports whether it was applied within the timeouts
    pub async fn dispatch_and_await_ack(&self, task: &ModifyTask, code: &ConnectCode) -> bool {
        let logger = self.logger.new(slog::o!(
            "task_id" => task.task_id.clone(),
            "connect_code" => code.to_string(),
            "guild_id" => task.guild_id,
        ));

        let receipt_channel = self.keys.receipt_ack(&task.task_id);
        let completion_channel = self.keys.completion_ack(&task.task_id);
        let subscriptions = futures::try_join!(
            self.store.subscribe(&receipt_channel),
            self.store.subscribe(&completion_channel),
        );
        let (mut receipt, mut completion) = match subscriptions {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                slog::error!(logger, "failed to subscribe to task ack channels"; "error" => ?err);
                return false;
            }
        };

        let payload = match self.tasks.push(code, task).await {
            Ok(payload) => payload,
            Err(err) => {
                slog::error!(logger, "failed to queue task for capture client"; "error" => ?err);
                return false;
            }
        };

        if let Err(err) = await_marker(&mut receipt, self.timeouts.receipt).await {
            // A task that can no longer be withdrawn was taken by a client
            // whose receipt is late, so its completion is still worth waiting for
            match self.tasks.retract(code, &payload).await {
                Ok(false) => {
                    slog::debug!(logger, "task consumed without a timely receipt"; "error" => ?err);
                }
                Ok(true) => {
                    slog::info!(logger, "no capture client received task"; "error" => ?err);
                    return false;
                }
                Err(retract_err) => {
                    slog::warn!(
                        logger,
                        "no capture client received task and it could not be withdrawn";
                        "error" => ?err,
                        "retract_error" => ?retract_err,
                    );
                    return false;
                }
            }
        }
        drop(receipt);

        match await_marker(&mut completion, self.timeouts.completion).await {
            Ok(marker) if marker == SUCCESS_MARKER => {
                slog::debug!(logger, "capture client completed task");
                true
            }
            Ok(marker) => {
                slog::info!(logger, "capture client failed task"; "marker" => marker);
                false
            }
            Err(err) => {
                slog::info!(logger, "capture client did not complete task"; "error" => ?err);
                false
            }
        }
    }
}
