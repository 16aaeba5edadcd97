use crate::application::dispatcher::Abandoned;
use crate::application::ledger::BalanceLedger;
use crate::application::poller::{AccrualPoller, PollSettings};
use crate::domain::balance::{Balance, Withdrawal};
use crate::domain::order::{Order, OrderNumber, SaveOutcome};
use crate::domain::ports::{SharedLedgerStore, SharedLoyaltyClient, SharedOrderStore};
use crate::domain::user::UserId;
use crate::error::{AccrualError, Result};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Outcome of a successful order submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The order was stored as `NEW` and will be polled.
    Accepted,
    /// The same user had already submitted this order.
    AlreadyStored,
}

/// The main entry point for the accrual synchronization engine.
///
/// `AccrualEngine` owns the storage backends, the balance ledger and, once
/// started, the synchronizer that polls the accrual service.
pub struct AccrualEngine {
    orders: SharedOrderStore,
    ledger: Arc<BalanceLedger>,
    client: SharedLoyaltyClient,
    settings: PollSettings,
    synchronizer: RwLock<Option<Arc<AccrualPoller>>>,
    /// A stopped synchronizer whose attempts outlived the shutdown timeout.
    retired: Mutex<Option<Arc<AccrualPoller>>>,
}

impl AccrualEngine {
    /// Creates a new `AccrualEngine` instance.
    ///
    /// # Arguments
    ///
    /// * `orders` - The store for submitted orders.
    /// * `ledger_store` - The store for balances and withdrawals.
    /// * `client` - The accrual service client.
    /// * `settings` - Retry delays and budget for polling.
    pub fn new(
        orders: SharedOrderStore,
        ledger_store: SharedLedgerStore,
        client: SharedLoyaltyClient,
        settings: PollSettings,
    ) -> Self {
        Self {
            orders,
            ledger: Arc::new(BalanceLedger::new(ledger_store)),
            client,
            settings,
            synchronizer: RwLock::new(None),
            retired: Mutex::new(None),
        }
    }

    /// Validates and stores an order, then starts polling it if the
    /// synchronizer is running.
    ///
    /// Orders accepted while the synchronizer is stopped stay `NEW` until the
    /// next recovery sweep.
    pub async fn submit_order(&self, number: &str, user: &UserId) -> Result<SubmitOutcome> {
        let number = OrderNumber::parse(number)?;
        let order = Order::new(number.clone(), user.clone());
        let status = order.status;

        match self.orders.save_new(order).await? {
            SaveOutcome::Created => {}
            SaveOutcome::AlreadyStored => return Ok(SubmitOutcome::AlreadyStored),
            SaveOutcome::OwnedByAnotherUser => {
                return Err(AccrualError::OrderOwnedByAnotherUser(number.to_string()));
            }
        }
        tracing::info!(order = %number, %user, "order accepted");

        if let Some(poller) = self.synchronizer.read().await.as_ref() {
            poller.track(number, status)?;
        }
        Ok(SubmitOutcome::Accepted)
    }

    /// The user's orders, oldest first.
    pub async fn list_orders(&self, user: &UserId) -> Result<Vec<Order>> {
        self.orders.by_user(user).await
    }

    pub async fn balance(&self, user: &UserId) -> Result<Balance> {
        self.ledger.balance(user).await
    }

    pub async fn withdraw(
        &self,
        user: &UserId,
        order_ref: &str,
        amount: Decimal,
    ) -> Result<Withdrawal> {
        self.ledger.withdraw(user, order_ref, amount).await
    }

    /// Withdrawal history, most recent first.
    pub async fn withdrawals(&self, user: &UserId) -> Result<Vec<Withdrawal>> {
        self.ledger.withdrawals(user).await
    }

    /// Starts polling with at most `concurrency` queries in flight and runs the
    /// recovery sweep. Returns how many stored orders were resumed.
    ///
    /// Fails with `SynchronizerDraining` while attempts of the previous
    /// synchronizer are still running, since the sweep would otherwise start
    /// a second chain for their orders. If the sweep fails the synchronizer
    /// is torn down again and the error is returned.
    pub async fn start_synchronizer(&self, concurrency: usize) -> Result<usize> {
        let mut slot = self.synchronizer.write().await;
        if slot.is_some() {
            return Err(AccrualError::SynchronizerRunning);
        }
        {
            let mut retired = self.retired.lock().await;
            if let Some(previous) = retired.as_ref() {
                let running = previous.running();
                if running > 0 {
                    return Err(AccrualError::SynchronizerDraining(running));
                }
            }
            *retired = None;
        }

        let poller = AccrualPoller::new(
            self.orders.clone(),
            self.ledger.clone(),
            self.client.clone(),
            self.settings,
            concurrency,
        )?;

        // Holding the slot keeps submissions out until the sweep has run.
        match poller.recover().await {
            Ok(resumed) => {
                *slot = Some(poller);
                tracing::info!(concurrency, resumed, "synchronizer started");
                Ok(resumed)
            }
            Err(e) => {
                poller.shutdown(Duration::ZERO).await;
                Err(e)
            }
        }
    }

    /// Stops the synchronizer, waiting up to `timeout` for running attempts.
    ///
    /// Returns `None` if it was not running.
    pub async fn stop(&self, timeout: Duration) -> Option<Abandoned> {
        let poller = self.synchronizer.write().await.take()?;
        let abandoned = poller.shutdown(timeout).await;
        let running = poller.running();
        tracing::info!(
            queued = abandoned.queued,
            delayed = abandoned.delayed,
            running,
            "synchronizer stopped"
        );
        if running > 0 {
            *self.retired.lock().await = Some(poller);
        }
        Some(abandoned)
    }

    pub async fn synchronizer(&self) -> Option<Arc<AccrualPoller>> {
        self.synchronizer.read().await.clone()
    }

    /// Number of orders currently being polled.
    pub async fn in_flight(&self) -> usize {
        self.synchronizer()
            .await
            .map_or(0, |poller| poller.in_flight())
    }

    /// Resolves once no order is being polled. Returns at once if stopped.
    pub async fn wait_idle(&self) {
        if let Some(poller) = self.synchronizer().await {
            poller.wait_idle().await;
        }
    }
}
