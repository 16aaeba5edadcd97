//! Application layer containing the accrual synchronization logic.
//!
//! `AccrualEngine` is the entry point. It stores submitted orders, owns the
//! `BalanceLedger`, and runs an `AccrualPoller` on top of a bounded
//! `TaskDispatcher` while the synchronizer is started.

pub mod dispatcher;
pub mod engine;
pub mod ledger;
pub mod poller;
