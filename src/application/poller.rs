//! Per-order accrual polling.
//!
//! Each order in flight has exactly one pending or running attempt: an
//! attempt classifies the accrual service's answer and then either schedules
//! the next attempt on the dispatcher or drops the order from `in_flight`.
//! Writes to an order record therefore never race each other.
//!
//! A `PROCESSED` order is settled once its accrual is credited and the order
//! is marked as credited. Both steps are retried like any other failure and
//! the ledger credits an order at most once, so a crash in between is
//! repaired by the next recovery sweep.

use crate::application::dispatcher::{Abandoned, TaskDispatcher};
use crate::application::ledger::BalanceLedger;
use crate::domain::accrual::{AccrualReport, AccrualStatus, LoyaltyError};
use crate::domain::balance::Points;
use crate::domain::order::{OrderNumber, OrderStatus, OrderUpdate};
use crate::domain::ports::{SharedLoyaltyClient, SharedOrderStore};
use crate::error::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::Instrument;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Counted retries allowed after the first attempt. Rate-limit retries are not counted.
    pub max_attempts: u32,
    /// Delay before re-asking about an order that is not finished yet.
    pub retry_delay: Duration,
    /// Delay after the accrual service answered "too many requests".
    pub rate_limit_cooldown: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: DEFAULT_RETRY_DELAY,
            rate_limit_cooldown: DEFAULT_RATE_LIMIT_COOLDOWN,
        }
    }
}

/// Bookkeeping for an order being polled. Lives only in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempts: u32,
    pub rate_limited: u32,
    /// Last status written to the order record.
    pub status: OrderStatus,
    pub next_attempt_at: Instant,
}

enum Step {
    Retry(Duration),
    Done,
}

pub struct AccrualPoller {
    orders: SharedOrderStore,
    ledger: Arc<BalanceLedger>,
    client: SharedLoyaltyClient,
    dispatcher: TaskDispatcher,
    settings: PollSettings,
    in_flight: DashMap<OrderNumber, RetryState>,
    idle: Notify,
    span: tracing::Span,
}

impl AccrualPoller {
    pub fn new(
        orders: SharedOrderStore,
        ledger: Arc<BalanceLedger>,
        client: SharedLoyaltyClient,
        settings: PollSettings,
        concurrency: usize,
    ) -> Result<Arc<Self>> {
        let dispatcher = TaskDispatcher::new(concurrency)?;
        Ok(Arc::new(Self {
            orders,
            ledger,
            client,
            dispatcher,
            settings,
            in_flight: DashMap::new(),
            idle: Notify::new(),
            span: tracing::info_span!("accrual_poller"),
        }))
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }

    /// Starts polling `order` unless an attempt for it is already pending.
    ///
    /// Returns `false` when the order was already in flight.
    pub fn track(self: &Arc<Self>, order: OrderNumber, status: OrderStatus) -> Result<bool> {
        match self.in_flight.entry(order.clone()) {
            Entry::Occupied(_) => {
                tracing::debug!(%order, "order already being polled");
                return Ok(false);
            }
            Entry::Vacant(slot) => {
                slot.insert(RetryState {
                    attempts: 0,
                    rate_limited: 0,
                    status,
                    next_attempt_at: Instant::now(),
                });
            }
        }

        let poller = self.clone();
        let task_order = order.clone();
        let task = async move { poller.attempt(task_order).await }.instrument(self.span.clone());
        if let Err(e) = self.dispatcher.submit(task) {
            self.finish(&order);
            return Err(e);
        }
        tracing::debug!(%order, %status, "polling started");
        Ok(true)
    }

    /// Resumes every order the store has not settled: `NEW` and `PROCESSING`
    /// orders are polled again, uncredited `PROCESSED` orders are credited.
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let pending = self.orders.unsettled().await?;
        let mut resumed = 0;
        for order in pending {
            if self.track(order.number, order.status)? {
                resumed += 1;
            }
        }
        tracing::info!(resumed, "recovery sweep finished");
        Ok(resumed)
    }

    pub fn retry_state(&self, order: &OrderNumber) -> Option<RetryState> {
        self.in_flight.get(order).map(|state| *state)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Attempts still executing, including those that outlived a shutdown.
    pub fn running(&self) -> usize {
        self.dispatcher.active()
    }

    /// Resolves once no order is being polled.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stops the dispatcher and forgets every order still in flight.
    ///
    /// Those orders stay unsettled in storage and are picked up again by
    /// the next [`recover`](Self::recover). Attempts that outlive `timeout`
    /// are reported by [`running`](Self::running) until they finish.
    pub async fn shutdown(&self, timeout: Duration) -> Abandoned {
        let abandoned = self.dispatcher.shutdown(timeout).await;
        let parked = self.in_flight.len();
        self.in_flight.clear();
        self.idle.notify_waiters();
        if parked > 0 {
            tracing::info!(parked, "polling stopped, orders resume on next start");
        }
        abandoned
    }

    async fn attempt(self: Arc<Self>, order: OrderNumber) {
        let status = self.in_flight.get(&order).map(|state| state.status);
        let step = if status == Some(OrderStatus::Processed) {
            self.settle(&order).await
        } else {
            let response = self.client.query(&order).await;
            self.advance(&order, response).await
        };
        match step {
            Step::Retry(delay) => self.reschedule(order, delay),
            Step::Done => self.finish(&order),
        }
    }

    async fn advance(
        &self,
        order: &OrderNumber,
        response: std::result::Result<AccrualReport, LoyaltyError>,
    ) -> Step {
        match response {
            Err(LoyaltyError::RateLimited) => {
                let rate_limited = self
                    .with_state(order, |state| {
                        state.rate_limited += 1;
                        state.rate_limited
                    })
                    .unwrap_or_default();
                tracing::debug!(
                    %order,
                    rate_limited,
                    delay_secs = self.settings.rate_limit_cooldown.as_secs(),
                    "accrual service rate limited, cooling down"
                );
                Step::Retry(self.settings.rate_limit_cooldown)
            }
            Err(LoyaltyError::NotRegistered) => self.count_attempt(order, "not registered yet"),
            Err(error) => {
                tracing::warn!(%order, %error, "accrual query failed");
                self.count_attempt(order, "accrual query failed")
            }
            Ok(report) => match report.status {
                AccrualStatus::Registered | AccrualStatus::Processing => {
                    match self.mark_processing(order).await {
                        Ok(true) => self.count_attempt(order, "still processing"),
                        Ok(false) => Step::Done,
                        Err(error) => {
                            tracing::error!(%order, %error, "failed to store PROCESSING status");
                            self.count_attempt(order, "failed to store PROCESSING")
                        }
                    }
                }
                AccrualStatus::Invalid => self.complete(order, OrderStatus::Invalid, None).await,
                AccrualStatus::Processed => {
                    let accrual = report.accrual.map(Points::new);
                    if accrual.is_some_and(|points| points.is_negative()) {
                        tracing::warn!(
                            %order,
                            accrual = ?report.accrual,
                            "negative accrual reported"
                        );
                        return self.count_attempt(order, "negative accrual");
                    }
                    self.complete(order, OrderStatus::Processed, accrual).await
                }
            },
        }
    }

    fn count_attempt(&self, order: &OrderNumber, reason: &'static str) -> Step {
        let Some(attempts) = self.with_state(order, |state| {
            state.attempts += 1;
            state.attempts
        }) else {
            return Step::Done;
        };

        if attempts > self.settings.max_attempts {
            tracing::warn!(
                %order,
                attempts,
                reason,
                "retry budget exhausted, order left for the next recovery sweep"
            );
            return Step::Done;
        }

        tracing::debug!(
            %order,
            attempts,
            reason,
            delay_secs = self.settings.retry_delay.as_secs(),
            "retrying"
        );
        Step::Retry(self.settings.retry_delay)
    }

    /// Writes `PROCESSING` once, on the first acknowledgement of a `NEW` order.
    ///
    /// Returns `false` if the order turned out to be terminal already.
    async fn mark_processing(&self, order: &OrderNumber) -> Result<bool> {
        let status = self.in_flight.get(order).map(|state| state.status);
        if status != Some(OrderStatus::New) {
            return Ok(true);
        }

        match self
            .orders
            .update(order, OrderStatus::Processing, None)
            .await?
        {
            OrderUpdate::Applied(_) => {
                self.with_state(order, |state| state.status = OrderStatus::Processing);
                Ok(true)
            }
            OrderUpdate::AlreadyTerminal(stored) => {
                tracing::warn!(
                    %order,
                    status = %stored.status,
                    "order already terminal, polling stopped"
                );
                Ok(false)
            }
        }
    }

    async fn complete(
        &self,
        order: &OrderNumber,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> Step {
        match self.orders.update(order, status, accrual).await {
            Ok(OrderUpdate::Applied(stored)) => {
                tracing::info!(
                    %order,
                    user = %stored.user,
                    %status,
                    accrual = ?stored.accrual.map(|points| points.value()),
                    "order reached terminal status"
                );
                if status != OrderStatus::Processed {
                    return Step::Done;
                }
                self.with_state(order, |state| state.status = OrderStatus::Processed);
                self.settle(order).await
            }
            Ok(OrderUpdate::AlreadyTerminal(stored))
                if stored.status == OrderStatus::Processed && !stored.credited =>
            {
                self.with_state(order, |state| state.status = OrderStatus::Processed);
                self.settle(order).await
            }
            Ok(OrderUpdate::AlreadyTerminal(stored)) => {
                tracing::warn!(
                    %order,
                    status = %stored.status,
                    "order already terminal, result ignored"
                );
                Step::Done
            }
            Err(error) => {
                tracing::error!(%order, %error, "failed to store polling result");
                self.count_attempt(order, "failed to store result")
            }
        }
    }

    /// Credits a `PROCESSED` order's accrual and marks the order as credited.
    async fn settle(&self, order: &OrderNumber) -> Step {
        let stored = match self.orders.get(order).await {
            Ok(Some(stored)) => stored,
            Ok(None) => {
                tracing::error!(%order, "processed order missing from storage");
                return Step::Done;
            }
            Err(error) => {
                tracing::error!(%order, %error, "failed to load processed order");
                return self.count_attempt(order, "failed to load order");
            }
        };

        let points = stored.accrual.unwrap_or(Points::ZERO);
        if let Err(error) = self.ledger.credit(&stored.user, order, points).await {
            tracing::error!(
                %order,
                user = %stored.user,
                %points,
                %error,
                "order processed but accrual was not credited"
            );
            return self.count_attempt(order, "credit failed");
        }
        if let Err(error) = self.orders.mark_credited(order).await {
            tracing::error!(%order, %error, "accrual credited but order not marked");
            return self.count_attempt(order, "failed to mark credited");
        }

        tracing::info!(%order, user = %stored.user, %points, "accrual settled");
        Step::Done
    }

    fn reschedule(self: Arc<Self>, order: OrderNumber, delay: Duration) {
        let due = Instant::now() + delay;
        if self
            .with_state(&order, |state| state.next_attempt_at = due)
            .is_none()
        {
            return;
        }

        let poller = self.clone();
        let task_order = order.clone();
        let task = async move { poller.attempt(task_order).await }.instrument(self.span.clone());
        if let Err(error) = self.dispatcher.submit_at(due, task) {
            tracing::info!(
                %order,
                %error,
                "retry not scheduled, order left for the next recovery sweep"
            );
            self.finish(&order);
        }
    }

    fn with_state<T>(
        &self,
        order: &OrderNumber,
        f: impl FnOnce(&mut RetryState) -> T,
    ) -> Option<T> {
        self.in_flight
            .get_mut(order)
            .map(|mut state| f(state.value_mut()))
    }

    fn finish(&self, order: &OrderNumber) {
        self.in_flight.remove(order);
        if self.in_flight.is_empty() {
            self.idle.notify_waiters();
        }
    }
}
