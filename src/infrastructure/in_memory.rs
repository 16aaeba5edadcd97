use crate::domain::balance::{Balance, Points, Withdrawal};
use crate::domain::order::{Order, OrderNumber, OrderStatus, OrderUpdate, SaveOutcome};
use crate::domain::ports::{LedgerStore, OrderStore};
use crate::domain::user::UserId;
use crate::error::{AccrualError, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;

/// A thread-safe in-memory store for orders.
///
/// Uses `Arc<RwLock<HashMap<OrderNumber, Order>>>` to allow shared concurrent access.
/// Clones share the same map, which lets tests hand one store to several engines
/// to simulate a restart.
#[derive(Default, Clone)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderNumber, Order>>>,
}

impl InMemoryOrderStore {
    /// Creates a new, empty in-memory order store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn save_new(&self, order: Order) -> Result<SaveOutcome> {
        let mut orders = self.orders.write().await;
        if let Some(existing) = orders.get(&order.number) {
            return Ok(if existing.user == order.user {
                SaveOutcome::AlreadyStored
            } else {
                SaveOutcome::OwnedByAnotherUser
            });
        }
        orders.insert(order.number.clone(), order);
        Ok(SaveOutcome::Created)
    }

    async fn update(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> Result<OrderUpdate> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(number)
            .ok_or_else(|| AccrualError::OrderNotFound(number.to_string()))?;

        if order.update_status(status, accrual) {
            Ok(OrderUpdate::Applied(order.clone()))
        } else {
            Ok(OrderUpdate::AlreadyTerminal(order.clone()))
        }
    }

    async fn get(&self, number: &OrderNumber) -> Result<Option<Order>> {
        let orders = self.orders.read().await;
        Ok(orders.get(number).cloned())
    }

    async fn by_user(&self, user: &UserId) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        let mut owned: Vec<Order> = orders
            .values()
            .filter(|order| &order.user == user)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        Ok(owned)
    }

    async fn mark_credited(&self, number: &OrderNumber) -> Result<()> {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(number)
            .ok_or_else(|| AccrualError::OrderNotFound(number.to_string()))?;
        order.credited = true;
        Ok(())
    }

    async fn unsettled(&self) -> Result<Vec<Order>> {
        let orders = self.orders.read().await;
        Ok(orders
            .values()
            .filter(|order| !order.is_settled())
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<UserId, Balance>,
    withdrawals: HashMap<UserId, Vec<Withdrawal>>,
    credited: HashSet<OrderNumber>,
}

/// A thread-safe in-memory store for balances and withdrawals.
///
/// Both live behind a single lock so a withdrawal and the balance it debits
/// are written together.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    /// Creates a new, empty in-memory ledger store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn ensure_non_negative(balance: &Balance) -> Result<()> {
    if balance.current.is_negative() {
        return Err(AccrualError::NegativeBalance(balance.user.to_string()));
    }
    Ok(())
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn balance(&self, user: &UserId) -> Result<Option<Balance>> {
        let state = self.state.read().await;
        Ok(state.balances.get(user).cloned())
    }

    async fn record_accrual(&self, balance: Balance, order: &OrderNumber) -> Result<()> {
        ensure_non_negative(&balance)?;
        let mut state = self.state.write().await;
        state.credited.insert(order.clone());
        state.balances.insert(balance.user.clone(), balance);
        Ok(())
    }

    async fn is_credited(&self, order: &OrderNumber) -> Result<bool> {
        let state = self.state.read().await;
        Ok(state.credited.contains(order))
    }

    async fn record_withdrawal(&self, balance: Balance, withdrawal: Withdrawal) -> Result<()> {
        ensure_non_negative(&balance)?;
        let mut state = self.state.write().await;
        state
            .withdrawals
            .entry(withdrawal.user.clone())
            .or_default()
            .push(withdrawal);
        state.balances.insert(balance.user.clone(), balance);
        Ok(())
    }

    async fn withdrawals(&self, user: &UserId) -> Result<Vec<Withdrawal>> {
        let state = self.state.read().await;
        Ok(state.withdrawals.get(user).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::balance::Amount;
    use rust_decimal_macros::dec;

    fn number(n: &str) -> OrderNumber {
        OrderNumber::parse(n).unwrap()
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn order(n: &str, id: &str) -> Order {
        Order::new(number(n), user(id))
    }

    #[tokio::test]
    async fn test_save_new_detects_owner_conflicts() {
        let store = InMemoryOrderStore::new();
        let first = order("12345678903", "alice");

        assert_eq!(store.save_new(first.clone()).await.unwrap(), SaveOutcome::Created);
        assert_eq!(
            store.save_new(order("12345678903", "alice")).await.unwrap(),
            SaveOutcome::AlreadyStored
        );
        assert_eq!(
            store.save_new(order("12345678903", "bob")).await.unwrap(),
            SaveOutcome::OwnedByAnotherUser
        );

        let stored = store.get(&first.number).await.unwrap().unwrap();
        assert_eq!(stored.user, user("alice"));
    }

    #[tokio::test]
    async fn test_second_terminal_update_is_not_applied() {
        let store = InMemoryOrderStore::new();
        let first = order("12345678903", "alice");
        store.save_new(first.clone()).await.unwrap();
        let accrual = Some(Points::new(dec!(100)));

        let applied = store
            .update(&first.number, OrderStatus::Processed, accrual)
            .await
            .unwrap();
        assert!(matches!(
            applied,
            OrderUpdate::Applied(ref o) if o.status == OrderStatus::Processed
        ));

        let second = store
            .update(&first.number, OrderStatus::Processed, accrual)
            .await
            .unwrap();
        assert!(matches!(second, OrderUpdate::AlreadyTerminal(_)));
    }

    #[tokio::test]
    async fn test_update_unknown_order() {
        let store = InMemoryOrderStore::new();
        let result = store
            .update(&number("12345678903"), OrderStatus::Invalid, None)
            .await;
        assert!(matches!(result, Err(AccrualError::OrderNotFound(_))));
        let result = store.mark_credited(&number("12345678903")).await;
        assert!(matches!(result, Err(AccrualError::OrderNotFound(_))));
    }

    #[tokio::test]
    async fn test_unsettled_and_by_user() {
        let store = InMemoryOrderStore::new();
        store.save_new(order("12345678903", "alice")).await.unwrap();
        store.save_new(order("79927398713", "alice")).await.unwrap();
        store.save_new(order("4561261212345467", "bob")).await.unwrap();
        store
            .update(&number("79927398713"), OrderStatus::Invalid, None)
            .await
            .unwrap();

        let pending = store.unsettled().await.unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().all(|o| o.status == OrderStatus::New));

        let alice = store.by_user(&user("alice")).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert!(store.by_user(&user("carol")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_processed_order_is_unsettled_until_credited() {
        let store = InMemoryOrderStore::new();
        let first = order("12345678903", "alice");
        store.save_new(first.clone()).await.unwrap();
        store
            .update(&first.number, OrderStatus::Processed, Some(Points::new(dec!(5))))
            .await
            .unwrap();

        let pending = store.unsettled().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, OrderStatus::Processed);

        store.mark_credited(&first.number).await.unwrap();
        assert!(store.unsettled().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ledger_store_rejects_negative_balance() {
        let store = InMemoryLedgerStore::new();
        let mut balance = Balance::new(user("alice"));
        balance.current = Points::new(dec!(-1));

        let result = store.record_accrual(balance, &number("12345678903")).await;
        assert!(matches!(result, Err(AccrualError::NegativeBalance(_))));
        assert!(store.balance(&user("alice")).await.unwrap().is_none());
        assert!(!store.is_credited(&number("12345678903")).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_accrual_marks_order() {
        let store = InMemoryLedgerStore::new();
        let mut balance = Balance::new(user("alice"));
        balance.credit(Points::new(dec!(10))).unwrap();

        store
            .record_accrual(balance.clone(), &number("12345678903"))
            .await
            .unwrap();

        assert_eq!(store.balance(&user("alice")).await.unwrap(), Some(balance));
        assert!(store.is_credited(&number("12345678903")).await.unwrap());
        assert!(!store.is_credited(&number("79927398713")).await.unwrap());
    }

    #[tokio::test]
    async fn test_record_withdrawal_writes_both() {
        let store = InMemoryLedgerStore::new();
        let mut balance = Balance::new(user("alice"));
        balance.current = Points::new(dec!(50));
        let amount = Amount::new(dec!(20)).unwrap();
        balance.debit(amount).unwrap();
        let withdrawal = Withdrawal::new(user("alice"), number("12345678903"), amount);

        store
            .record_withdrawal(balance.clone(), withdrawal.clone())
            .await
            .unwrap();

        assert_eq!(store.balance(&user("alice")).await.unwrap(), Some(balance));
        assert_eq!(
            store.withdrawals(&user("alice")).await.unwrap(),
            vec![withdrawal]
        );
        assert!(store.withdrawals(&user("bob")).await.unwrap().is_empty());
    }
}
