use crate::domain::balance::{Amount, Balance, Points, Withdrawal};
use crate::domain::order::OrderNumber;
use crate::domain::ports::SharedLedgerStore;
use crate::domain::user::UserId;
use crate::error::Result;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::sync::Mutex;

/// The single authority over spendable balances.
///
/// Every mutation runs check-then-write under a lock scoped to the user, so
/// credits and withdrawals for one user are linearizable while different users
/// never wait on each other. `current` can never be observed below zero.
pub struct BalanceLedger {
    store: SharedLedgerStore,
    locks: DashMap<UserId, Arc<Mutex<()>>>,
}

impl BalanceLedger {
    pub fn new(store: SharedLedgerStore) -> Self {
        Self {
            store,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user: &UserId) -> Arc<Mutex<()>> {
        self.locks.entry(user.clone()).or_default().clone()
    }

    async fn load(&self, user: &UserId) -> Result<Balance> {
        Ok(self
            .store
            .balance(user)
            .await?
            .unwrap_or_else(|| Balance::new(user.clone())))
    }

    /// Adds the accrual of `order` to the user's balance.
    ///
    /// Crediting an order that was already credited returns the balance
    /// unchanged, so a failed settlement can simply be retried.
    pub async fn credit(
        &self,
        user: &UserId,
        order: &OrderNumber,
        points: Points,
    ) -> Result<Balance> {
        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        let mut balance = self.load(user).await?;
        if self.store.is_credited(order).await? {
            tracing::debug!(%user, %order, "accrual already credited");
            return Ok(balance);
        }
        balance.credit(points)?;
        self.store.record_accrual(balance.clone(), order).await?;

        tracing::debug!(%user, %order, %points, current = %balance.current, "credited accrual");
        Ok(balance)
    }

    /// Spends `amount` points against `order_ref`.
    ///
    /// Fails with `InvalidOrderNumber`, `InvalidAmount` or `InsufficientFunds`
    /// without touching the balance or the withdrawal history.
    pub async fn withdraw(
        &self,
        user: &UserId,
        order_ref: &str,
        amount: Decimal,
    ) -> Result<Withdrawal> {
        let order = OrderNumber::parse(order_ref)?;
        let amount = Amount::new(amount)?;

        let lock = self.lock_for(user);
        let _guard = lock.lock().await;

        let mut balance = self.load(user).await?;
        balance.debit(amount)?;
        let withdrawal = Withdrawal::new(user.clone(), order, amount);
        self.store
            .record_withdrawal(balance.clone(), withdrawal.clone())
            .await?;

        tracing::info!(
            %user,
            order = %withdrawal.order,
            sum = %amount,
            current = %balance.current,
            "withdrawal recorded"
        );
        Ok(withdrawal)
    }

    pub async fn balance(&self, user: &UserId) -> Result<Balance> {
        self.load(user).await
    }

    /// Withdrawal history, most recent first.
    pub async fn withdrawals(&self, user: &UserId) -> Result<Vec<Withdrawal>> {
        let mut withdrawals = self.store.withdrawals(user).await?;
        withdrawals.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(withdrawals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AccrualError;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use rand::Rng;
    use rust_decimal_macros::dec;

    const ORDER_REF: &str = "2377225624";
    const ORDER: &str = "12345678903";

    fn ledger() -> BalanceLedger {
        BalanceLedger::new(Arc::new(InMemoryLedgerStore::new()))
    }

    fn user(id: &str) -> UserId {
        UserId::new(id).unwrap()
    }

    fn number(n: &str) -> OrderNumber {
        OrderNumber::parse(n).unwrap()
    }

    /// Distinct Luhn-valid order number for the `seq`-th credit.
    fn nth_order(seq: u64) -> OrderNumber {
        let payload = format!("{}", 1000 + seq);
        let sum: u32 = payload
            .chars()
            .rev()
            .enumerate()
            .map(|(i, c)| {
                let digit = c.to_digit(10).unwrap();
                if i % 2 == 0 {
                    let doubled = digit * 2;
                    if doubled > 9 { doubled - 9 } else { doubled }
                } else {
                    digit
                }
            })
            .sum();
        number(&format!("{payload}{}", (10 - sum % 10) % 10))
    }

    #[tokio::test]
    async fn test_unknown_user_has_empty_balance() {
        let ledger = ledger();
        let balance = ledger.balance(&user("alice")).await.unwrap();
        assert_eq!(balance.current, Points::ZERO);
        assert_eq!(balance.withdrawn, Points::ZERO);
        assert!(ledger.withdrawals(&user("alice")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credit_then_withdraw() {
        let ledger = ledger();
        let alice = user("alice");

        ledger
            .credit(&alice, &number(ORDER), Points::new(dec!(729.98)))
            .await
            .unwrap();
        let withdrawal = ledger.withdraw(&alice, ORDER_REF, dec!(500)).await.unwrap();
        assert_eq!(withdrawal.order.as_str(), ORDER_REF);
        assert_eq!(withdrawal.sum.value(), dec!(500));

        let balance = ledger.balance(&alice).await.unwrap();
        assert_eq!(balance.current, Points::new(dec!(229.98)));
        assert_eq!(balance.withdrawn, Points::new(dec!(500)));
        assert_eq!(ledger.withdrawals(&alice).await.unwrap(), vec![withdrawal]);
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_state_unchanged() {
        let ledger = ledger();
        let alice = user("alice");
        ledger
            .credit(&alice, &number(ORDER), Points::new(dec!(100)))
            .await
            .unwrap();
        ledger.withdraw(&alice, ORDER_REF, dec!(30)).await.unwrap();

        let result = ledger.withdraw(&alice, ORDER_REF, dec!(70.01)).await;
        assert!(matches!(result, Err(AccrualError::InsufficientFunds { .. })));

        let balance = ledger.balance(&alice).await.unwrap();
        assert_eq!(balance.current, Points::new(dec!(70)));
        assert_eq!(balance.withdrawn, Points::new(dec!(30)));
        assert_eq!(ledger.withdrawals(&alice).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_withdraw_validates_order_reference() {
        let ledger = ledger();
        let alice = user("alice");
        ledger
            .credit(&alice, &number(ORDER), Points::new(dec!(100)))
            .await
            .unwrap();

        let result = ledger.withdraw(&alice, "123456789", dec!(10)).await;
        assert!(matches!(result, Err(AccrualError::InvalidOrderNumber(_))));
        let result = ledger.withdraw(&alice, "", dec!(10)).await;
        assert!(matches!(result, Err(AccrualError::InvalidOrderNumber(_))));

        assert_eq!(
            ledger.balance(&alice).await.unwrap().current,
            Points::new(dec!(100))
        );
    }

    #[tokio::test]
    async fn test_withdraw_requires_positive_amount() {
        let ledger = ledger();
        let alice = user("alice");
        ledger
            .credit(&alice, &number(ORDER), Points::new(dec!(100)))
            .await
            .unwrap();

        for amount in [dec!(0), dec!(-5)] {
            let result = ledger.withdraw(&alice, ORDER_REF, amount).await;
            assert!(matches!(result, Err(AccrualError::InvalidAmount(_))));
        }
        assert!(ledger.withdrawals(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_credit_rejects_negative_points() {
        let ledger = ledger();
        let result = ledger
            .credit(&user("alice"), &number(ORDER), Points::new(dec!(-1)))
            .await;
        assert!(matches!(result, Err(AccrualError::InvalidAmount(_))));
    }

    #[tokio::test]
    async fn test_order_is_credited_once() {
        let ledger = ledger();
        let alice = user("alice");
        let order = number(ORDER);

        ledger
            .credit(&alice, &order, Points::new(dec!(40)))
            .await
            .unwrap();
        let again = ledger
            .credit(&alice, &order, Points::new(dec!(40)))
            .await
            .unwrap();
        assert_eq!(again.current, Points::new(dec!(40)));

        ledger
            .credit(&alice, &number("79927398713"), Points::new(dec!(2)))
            .await
            .unwrap();
        assert_eq!(
            ledger.balance(&alice).await.unwrap().current,
            Points::new(dec!(42))
        );
    }

    #[tokio::test]
    async fn test_users_are_isolated() {
        let ledger = ledger();
        ledger
            .credit(&user("alice"), &number(ORDER), Points::new(dec!(10)))
            .await
            .unwrap();

        let result = ledger.withdraw(&user("bob"), ORDER_REF, dec!(5)).await;
        assert!(matches!(result, Err(AccrualError::InsufficientFunds { .. })));
        assert_eq!(
            ledger.balance(&user("alice")).await.unwrap().current,
            Points::new(dec!(10))
        );
    }

    #[tokio::test]
    async fn test_random_operations_never_go_negative() {
        let ledger = ledger();
        let alice = user("alice");
        let mut rng = rand::thread_rng();
        let mut expected_current = dec!(0);
        let mut expected_withdrawn = dec!(0);

        for seq in 0..500 {
            let cents: i64 = rng.gen_range(1..=20_000);
            let amount = Decimal::new(cents, 2);
            if rng.gen_bool(0.5) {
                ledger
                    .credit(&alice, &nth_order(seq), Points::new(amount))
                    .await
                    .unwrap();
                expected_current += amount;
            } else {
                match ledger.withdraw(&alice, ORDER_REF, amount).await {
                    Ok(_) => {
                        expected_current -= amount;
                        expected_withdrawn += amount;
                    }
                    Err(AccrualError::InsufficientFunds { .. }) => {
                        assert!(amount > expected_current);
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }

            let balance = ledger.balance(&alice).await.unwrap();
            assert!(balance.current >= Points::ZERO);
            assert_eq!(balance.current.value(), expected_current);
            assert_eq!(balance.withdrawn.value(), expected_withdrawn);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_withdrawals_never_overdraw() {
        let ledger = Arc::new(ledger());
        let alice = user("alice");
        ledger
            .credit(&alice, &number(ORDER), Points::new(dec!(100)))
            .await
            .unwrap();

        let mut handles = Vec::new();
        for _ in 0..50 {
            let ledger = ledger.clone();
            let alice = alice.clone();
            handles.push(tokio::spawn(async move {
                ledger.withdraw(&alice, ORDER_REF, dec!(7)).await.is_ok()
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap() {
                succeeded += 1;
            }
        }

        // 100 / 7 = 14 withdrawals fit, leaving 2 points.
        assert_eq!(succeeded, 14);
        let balance = ledger.balance(&alice).await.unwrap();
        assert_eq!(balance.current, Points::new(dec!(2)));
        assert_eq!(balance.withdrawn, Points::new(dec!(98)));
        assert_eq!(ledger.withdrawals(&alice).await.unwrap().len(), 14);
    }
}
