use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

/// Status of an order as reported by the accrual service.
#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccrualStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

/// Answer of the accrual service for one order.
#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct AccrualReport {
    pub order: String,
    pub status: AccrualStatus,
    #[serde(default)]
    pub accrual: Option<Decimal>,
}

/// Reasons a query to the accrual service did not produce a report.
///
/// None of these are surfaced to whoever submitted the order; they only decide
/// how the poller retries.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LoyaltyError {
    #[error("accrual service responded: too many requests")]
    RateLimited,
    #[error("order is not registered in the accrual service yet")]
    NotRegistered,
    #[error("accrual service unreachable: {0}")]
    Unavailable(String),
    #[error("accrual service responded with status {0}")]
    UnexpectedStatus(u16),
    #[error("malformed accrual service response: {0}")]
    MalformedResponse(String),
}
