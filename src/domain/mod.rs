//! Domain model: order numbers and their accrual lifecycle, point balances,
//! and the ports the application layer drives.

pub mod accrual;
pub mod balance;
pub mod order;
pub mod ports;
pub mod user;
