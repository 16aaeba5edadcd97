use crate::domain::balance::{Balance, Points, Withdrawal};
use crate::domain::order::{Order, OrderNumber, OrderStatus, OrderUpdate, SaveOutcome};
use crate::domain::ports::{LedgerStore, OrderStore};
use crate::domain::user::UserId;
use crate::error::{AccrualError, Result};
use async_trait::async_trait;
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Column Family for storing orders, keyed by order number.
pub const CF_ORDERS: &str = "orders";
/// Column Family for storing balances, keyed by user id.
pub const CF_BALANCES: &str = "balances";
/// Column Family for the append-only withdrawal log, keyed by user, time and order.
pub const CF_WITHDRAWALS: &str = "withdrawals";
/// Column Family marking orders whose accrual was credited, keyed by order number.
pub const CF_CREDITS: &str = "credits";

/// A persistent store implementation using RocksDB.
///
/// Handles storage for orders, balances, withdrawals and credit markers using separate Column
/// Families. Read-modify-write sequences are serialized through `write_lock`.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_lock: Arc<Mutex<()>>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at the specified path.
    ///
    /// Ensures that the required column families exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = [CF_ORDERS, CF_BALANCES, CF_WITHDRAWALS, CF_CREDITS]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            AccrualError::storage(
                format!("opening column family {name}"),
                std::io::Error::other("column family not found"),
            )
        })
    }

    fn read<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mode = if prefix.is_empty() {
            IteratorMode::Start
        } else {
            IteratorMode::From(prefix, rocksdb::Direction::Forward)
        };

        let mut items = Vec::new();
        for item in self.db.iterator_cf(cf, mode) {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            items.push(serde_json::from_slice(&value)?);
        }
        Ok(items)
    }

    fn withdrawal_key(withdrawal: &Withdrawal) -> Vec<u8> {
        let nanos = withdrawal
            .processed_at
            .timestamp_nanos_opt()
            .unwrap_or_default();
        let mut key = Self::user_prefix(&withdrawal.user);
        key.extend_from_slice(&nanos.to_be_bytes());
        key.extend_from_slice(withdrawal.order.as_str().as_bytes());
        key
    }

    fn user_prefix(user: &UserId) -> Vec<u8> {
        let mut prefix = user.as_str().as_bytes().to_vec();
        prefix.push(0);
        prefix
    }
}

fn ensure_non_negative(balance: &Balance) -> Result<()> {
    if balance.current.is_negative() {
        return Err(AccrualError::NegativeBalance(balance.user.to_string()));
    }
    Ok(())
}

#[async_trait]
impl OrderStore for RocksDBStore {
    async fn save_new(&self, order: Order) -> Result<SaveOutcome> {
        let _guard = self.write_lock.lock().await;
        let key = order.number.as_str().as_bytes();

        if let Some(existing) = self.read::<Order>(CF_ORDERS, key)? {
            return Ok(if existing.user == order.user {
                SaveOutcome::AlreadyStored
            } else {
                SaveOutcome::OwnedByAnotherUser
            });
        }

        let cf = self.cf(CF_ORDERS)?;
        self.db.put_cf(cf, key, serde_json::to_vec(&order)?)?;
        Ok(SaveOutcome::Created)
    }

    async fn update(
        &self,
        number: &OrderNumber,
        status: OrderStatus,
        accrual: Option<Points>,
    ) -> Result<OrderUpdate> {
        let _guard = self.write_lock.lock().await;
        let key = number.as_str().as_bytes();
        let mut order: Order = self
            .read(CF_ORDERS, key)?
            .ok_or_else(|| AccrualError::OrderNotFound(number.to_string()))?;

        if !order.update_status(status, accrual) {
            return Ok(OrderUpdate::AlreadyTerminal(order));
        }

        let cf = self.cf(CF_ORDERS)?;
        self.db.put_cf(cf, key, serde_json::to_vec(&order)?)?;
        Ok(OrderUpdate::Applied(order))
    }

    async fn get(&self, number: &OrderNumber) -> Result<Option<Order>> {
        self.read(CF_ORDERS, number.as_str().as_bytes())
    }

    async fn by_user(&self, user: &UserId) -> Result<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .scan::<Order>(CF_ORDERS, &[])?
            .into_iter()
            .filter(|order| &order.user == user)
            .collect();
        orders.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at));
        Ok(orders)
    }

    async fn mark_credited(&self, number: &OrderNumber) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let key = number.as_str().as_bytes();
        let mut order: Order = self
            .read(CF_ORDERS, key)?
            .ok_or_else(|| AccrualError::OrderNotFound(number.to_string()))?;

        order.credited = true;
        let cf = self.cf(CF_ORDERS)?;
        self.db.put_cf(cf, key, serde_json::to_vec(&order)?)?;
        Ok(())
    }

    async fn unsettled(&self) -> Result<Vec<Order>> {
        Ok(self
            .scan::<Order>(CF_ORDERS, &[])?
            .into_iter()
            .filter(|order| !order.is_settled())
            .collect())
    }
}

#[async_trait]
impl LedgerStore for RocksDBStore {
    async fn balance(&self, user: &UserId) -> Result<Option<Balance>> {
        self.read(CF_BALANCES, user.as_str().as_bytes())
    }

    async fn record_accrual(&self, balance: Balance, order: &OrderNumber) -> Result<()> {
        ensure_non_negative(&balance)?;
        let balances = self.cf(CF_BALANCES)?;
        let credits = self.cf(CF_CREDITS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            balances,
            balance.user.as_str().as_bytes(),
            serde_json::to_vec(&balance)?,
        );
        batch.put_cf(
            credits,
            order.as_str().as_bytes(),
            serde_json::to_vec(&balance.user)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn is_credited(&self, order: &OrderNumber) -> Result<bool> {
        let cf = self.cf(CF_CREDITS)?;
        Ok(self.db.get_cf(cf, order.as_str().as_bytes())?.is_some())
    }

    async fn record_withdrawal(&self, balance: Balance, withdrawal: Withdrawal) -> Result<()> {
        ensure_non_negative(&balance)?;
        let balances = self.cf(CF_BALANCES)?;
        let withdrawals = self.cf(CF_WITHDRAWALS)?;

        let mut batch = WriteBatch::default();
        batch.put_cf(
            balances,
            balance.user.as_str().as_bytes(),
            serde_json::to_vec(&balance)?,
        );
        batch.put_cf(
            withdrawals,
            Self::withdrawal_key(&withdrawal),
            serde_json::to_vec(&withdrawal)?,
        );
        self.db.write(batch)?;
        Ok(())
    }

    async fn withdrawals(&self, user: &UserId) -> Result<Vec<Withdrawal>> {
        self.scan(CF_WITHDRAWALS, &Self::user_prefix(user))
    }
}
