//! Bounded telemetry consumer.
//!
//! A consume call walks `Idle -> Subscribed -> Polling` and leaves through
//! exactly one of `Collected`, `TimedOut`, `Cancelled` or `Failed`, after
//! which the subscription is closed. The call returns after the first
//! message; draining a backlog takes one call per message.

use crate::broker::{Broker, Subscription};
use crate::config::DEFAULT_POLL_TIMEOUT;
use crate::errors::ConsumeTransportError;
use crate::metrics::{CONSUME_DURATION_SECONDS, CONSUME_TOTAL};
use crate::model::ConsumptionResult;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    Collected,
    TimedOut,
    Cancelled,
    Failed,
}

impl ConsumeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumeOutcome::Collected => "collected",
            ConsumeOutcome::TimedOut => "timed_out",
            ConsumeOutcome::Cancelled => "cancelled",
            ConsumeOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for ConsumeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transport failure together with whatever was collected before it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumeFailure {
    pub error: ConsumeTransportError,
    pub partial: ConsumptionResult,
}

impl fmt::Display for ConsumeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({} message(s) collected before failure)",
            self.error,
            self.partial.messages.len()
        )
    }
}

impl std::error::Error for ConsumeFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

enum Exit {
    Collected,
    TimedOut,
    Cancelled,
    Failed(ConsumeTransportError),
}

pub struct TelemetryConsumer<B> {
    broker: Arc<B>,
    poll_timeout: Duration,
}

impl<B> Clone for TelemetryConsumer<B> {
    fn clone(&self) -> Self {
        Self {
            broker: Arc::clone(&self.broker),
            poll_timeout: self.poll_timeout,
        }
    }
}

impl<B: Broker> TelemetryConsumer<B> {
    pub fn new(broker: Arc<B>) -> Self {
        Self::with_poll_timeout(broker, DEFAULT_POLL_TIMEOUT)
    }

    /// `poll_timeout` bounds each poll attempt and therefore how long a
    /// cancellation can go unnoticed.
    pub fn with_poll_timeout(broker: Arc<B>, poll_timeout: Duration) -> Self {
        Self {
            broker,
            poll_timeout,
        }
    }

    /// Collects at most one message from `topic` within `budget`.
    ///
    /// Transport failures are logged and the partial result is returned;
    /// use [`try_consume`](Self::try_consume) to handle them explicitly.
    pub async fn consume(
        &self,
        topic: &str,
        group_id: &str,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> ConsumptionResult {
        match self.try_consume(topic, group_id, budget, cancel).await {
            Ok(result) => result,
            Err(failure) => {
                error!(topic, group_id, "Consume error: {}", failure);
                failure.partial
            }
        }
    }

    pub async fn try_consume(
        &self,
        topic: &str,
        group_id: &str,
        budget: Duration,
        cancel: &CancellationToken,
    ) -> Result<ConsumptionResult, ConsumeFailure> {
        let started = Instant::now();
        let deadline = started + budget;

        if cancel.is_cancelled() {
            return finish(started, Exit::Cancelled, Vec::new());
        }

        // The handshake counts against the budget. Dropping an unfinished
        // subscribe leaves nothing open.
        let subscribed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return finish(started, Exit::Cancelled, Vec::new()),
            subscribed = self.broker.subscribe(topic, group_id) => subscribed,
            _ = tokio::time::sleep_until(deadline) => {
                warn!(topic, group_id, "Subscribe did not complete within the budget");
                return finish(started, Exit::TimedOut, Vec::new());
            }
        };
        let mut subscription = match subscribed {
            Ok(subscription) => subscription,
            Err(error) => return finish(started, Exit::Failed(error), Vec::new()),
        };
        debug!(topic, group_id, budget_ms = budget.as_millis() as u64, "Subscribed, polling");

        let mut messages = Vec::new();
        let exit = self
            .poll_until_exit(&mut subscription, &mut messages, deadline, cancel)
            .await;

        // Closing gets at most one more poll interval, and never past the
        // budget plus one poll.
        let close_by = (deadline + self.poll_timeout).min(Instant::now() + self.poll_timeout);
        if tokio::time::timeout_at(close_by, subscription.close()).await.is_err() {
            warn!(topic, group_id, "Subscription close cut short");
        } else {
            debug!(topic, group_id, "Subscription closed");
        }

        finish(started, exit, messages)
    }

    async fn poll_until_exit(
        &self,
        subscription: &mut B::Subscription,
        messages: &mut Vec<String>,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Exit {
        loop {
            if cancel.is_cancelled() {
                return Exit::Cancelled;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Exit::TimedOut;
            }

            match subscription.poll(remaining.min(self.poll_timeout)).await {
                Ok(Some(payload)) => {
                    info!("Consumed message: {}", payload);
                    messages.push(payload);
                    return Exit::Collected;
                }
                Ok(None) => continue,
                Err(e) => return Exit::Failed(e),
            }
        }
    }
}

fn finish(
    started: Instant,
    exit: Exit,
    messages: Vec<String>,
) -> Result<ConsumptionResult, ConsumeFailure> {
    let outcome = match exit {
        Exit::Collected => ConsumeOutcome::Collected,
        Exit::TimedOut => ConsumeOutcome::TimedOut,
        Exit::Cancelled => ConsumeOutcome::Cancelled,
        Exit::Failed(_) => ConsumeOutcome::Failed,
    };

    let elapsed = started.elapsed();
    CONSUME_TOTAL.with_label_values(&[outcome.as_str()]).inc();
    CONSUME_DURATION_SECONDS.observe(elapsed.as_secs_f64());
    debug!(%outcome, elapsed_ms = elapsed.as_millis() as u64, "Consume finished");

    match exit {
        Exit::Collected => Ok(ConsumptionResult::collected(messages)),
        Exit::TimedOut => {
            info!("No messages received within the timeout period");
            Ok(ConsumptionResult::timed_out())
        }
        Exit::Cancelled => {
            info!("Consume cancelled");
            Ok(ConsumptionResult::cancelled(messages))
        }
        Exit::Failed(error) => Err(ConsumeFailure {
            error,
            partial: ConsumptionResult::collected(messages),
        }),
    }
}
