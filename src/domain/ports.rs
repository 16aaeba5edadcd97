use super::accrual::{AccrualReport, LoyaltyError};
use super::balance::{Balance, Points, Withdrawal};
use super::order::{Order, OrderNumber, OrderStatus, OrderUpdate, SaveOutcome};
use super::user::UserId;
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Stores a new order unless its number is already taken.
    async fn save_new(&self, order: Order) -> Result<SaveOutcome>;
    /// Writes a polling result. Terminal orders are left untouched.
    async fn update(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> Result<OrderUpdate>;
    async fn get(&self, number: &OrderNumber) -> Result<Option<Order>>;
    async fn by_user(&self, user: &UserId) -> Result<Vec<Order>>;
    /// Records that a `Processed` order's accrual reached the balance.
    async fn mark_credited(&self, number: &OrderNumber) -> Result<()>;
    /// Orders the recovery sweep resumes: `NEW`, `PROCESSING`, and `PROCESSED`
    /// ones not credited yet.
    async fn unsettled(&self) -> Result<Vec<Order>>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn balance(&self, user: &UserId) -> Result<Option<Balance>>;
    /// Persists the credited balance together with a marker for `order`.
    ///
    /// Fails with `NegativeBalance` rather than storing a negative `current`.
    async fn record_accrual(&self, balance: Balance, order: &OrderNumber) -> Result<()>;
    /// Whether `order`'s accrual was already recorded.
    async fn is_credited(&self, order: &OrderNumber) -> Result<bool>;
    /// Persists the debited balance together with the withdrawal that caused it.
    async fn record_withdrawal(&self, balance: Balance, withdrawal: Withdrawal) -> Result<()>;
    async fn withdrawals(&self, user: &UserId) -> Result<Vec<Withdrawal>>;
}

#[async_trait]
pub trait LoyaltyClient: Send + Sync {
    async fn query(
        &self,
        order: &OrderNumber,
    ) -> std::result::Result<AccrualReport, LoyaltyError>;
}

pub type SharedOrderStore = Arc<dyn OrderStore>;
pub type SharedLedgerStore = Arc<dyn LedgerStore>;
pub type SharedLoyaltyClient = Arc<dyn LoyaltyClient>;
