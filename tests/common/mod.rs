#![allow(dead_code)]

use accrual_engine::application::engine::AccrualEngine;
use accrual_engine::application::poller::PollSettings;
use accrual_engine::domain::accrual::{AccrualReport, AccrualStatus, LoyaltyError};
use accrual_engine::domain::order::OrderNumber;
use accrual_engine::domain::ports::LoyaltyClient;
use accrual_engine::domain::user::UserId;
use accrual_engine::infrastructure::in_memory::{InMemoryLedgerStore, InMemoryOrderStore};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

pub type Answer = Result<AccrualReport, LoyaltyError>;

/// Accrual service double answering from a per-order script.
///
/// Once an order's script runs out its last answer repeats; orders without a
/// script are reported as not registered. Every query is timestamped.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Answer>>>,
    last: Mutex<HashMap<String, Answer>>,
    calls: Mutex<Vec<(String, Instant)>>,
    latency: Duration,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every query takes `latency` before answering.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn script(&self, order: &str, answers: Vec<Answer>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(order.to_string(), answers.into());
    }

    pub fn calls(&self, order: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(number, _)| number == order)
            .map(|(_, at)| *at)
            .collect()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    fn next_answer(&self, order: &str) -> Answer {
        let next = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(order)
            .and_then(|answers| answers.pop_front());
        let mut last = self.last.lock().unwrap();
        if let Some(answer) = next {
            last.insert(order.to_string(), answer);
        }
        last.get(order)
            .cloned()
            .unwrap_or(Err(LoyaltyError::NotRegistered))
    }
}

#[async_trait]
impl LoyaltyClient for ScriptedClient {
    async fn query(&self, order: &OrderNumber) -> Answer {
        self.calls
            .lock()
            .unwrap()
            .push((order.to_string(), Instant::now()));
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(running, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        self.active.fetch_sub(1, Ordering::SeqCst);
        self.next_answer(order.as_str())
    }
}

pub fn report(order: &str, status: AccrualStatus, accrual: Option<Decimal>) -> Answer {
    Ok(AccrualReport {
        order: order.to_string(),
        status,
        accrual,
    })
}

pub fn processing(order: &str) -> Answer {
    report(order, AccrualStatus::Processing, None)
}

pub fn processed(order: &str, accrual: Decimal) -> Answer {
    report(order, AccrualStatus::Processed, Some(accrual))
}

pub fn invalid(order: &str) -> Answer {
    report(order, AccrualStatus::Invalid, None)
}

pub fn user(id: &str) -> UserId {
    UserId::new(id).unwrap()
}

pub fn number(n: &str) -> OrderNumber {
    OrderNumber::parse(n).unwrap()
}

/// Stores that can be shared by several engines to simulate a restart.
#[derive(Clone, Default)]
pub struct Stores {
    pub orders: InMemoryOrderStore,
    pub ledger: InMemoryLedgerStore,
}

impl Stores {
    pub fn engine(&self, client: Arc<ScriptedClient>, settings: PollSettings) -> AccrualEngine {
        AccrualEngine::new(
            Arc::new(self.orders.clone()),
            Arc::new(self.ledger.clone()),
            client,
            settings,
        )
    }
}

pub fn engine(client: Arc<ScriptedClient>) -> AccrualEngine {
    Stores::default().engine(client, PollSettings::default())
}
