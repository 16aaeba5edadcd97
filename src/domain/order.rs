use super::balance::Points;
use super::user::UserId;
use crate::error::{AccrualError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Checks an order number against the mod-10 (Luhn) checksum.
///
/// Digits are scanned from the rightmost one; every second digit is doubled
/// and reduced by 9 when the doubled value exceeds 9. The number is valid when
/// the digit sum is a multiple of 10. Empty input and anything other than
/// ASCII digits is rejected.
pub fn validate(number: &str) -> bool {
    if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }

    let checksum: u32 = number
        .bytes()
        .rev()
        .enumerate()
        .map(|(position, byte)| {
            let digit = u32::from(byte - b'0');
            if position % 2 == 1 {
                let doubled = digit * 2;
                if doubled > 9 { doubled - 9 } else { doubled }
            } else {
                digit
            }
        })
        .sum();

    checksum % 10 == 0
}

/// A syntactically valid order number.
///
/// Can only be constructed through [`OrderNumber::parse`], so holding one
/// means the checksum already passed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OrderNumber(String);

impl OrderNumber {
    pub fn parse(number: &str) -> Result<Self> {
        if validate(number) {
            Ok(Self(number.to_string()))
        } else {
            Err(AccrualError::InvalidOrderNumber(number.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for OrderNumber {
    type Err = AccrualError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for OrderNumber {
    type Error = AccrualError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<OrderNumber> for String {
    fn from(number: OrderNumber) -> Self {
        number.0
    }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of an order's accrual.
///
/// `New` and `Processing` are still being polled; `Processed` and `Invalid`
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Invalid | Self::Processed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "NEW",
            Self::Processing => "PROCESSING",
            Self::Invalid => "INVALID",
            Self::Processed => "PROCESSED",
        };
        f.write_str(name)
    }
}

/// An uploaded order and the accrual it earned, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub number: OrderNumber,
    /// The only user this order ever belongs to.
    pub user: UserId,
    pub status: OrderStatus,
    /// Set only once the order is `Processed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accrual: Option<Points>,
    /// Set once the accrual of a `Processed` order reached the user's balance.
    #[serde(default)]
    pub credited: bool,
    pub uploaded_at: DateTime<Utc>,
}

impl Order {
    pub fn new(number: OrderNumber, user: UserId) -> Self {
        Self {
            number,
            user,
            status: OrderStatus::New,
            accrual: None,
            credited: false,
            uploaded_at: Utc::now(),
        }
    }

    /// `INVALID`, or `PROCESSED` with the accrual already credited. Anything
    /// else still needs the poller.
    pub fn is_settled(&self) -> bool {
        match self.status {
            OrderStatus::Invalid => true,
            OrderStatus::Processed => self.credited,
            OrderStatus::New | OrderStatus::Processing => false,
        }
    }

    /// Moves the order to `status`, unless it already reached a terminal one.
    ///
    /// Returns `false` when the order was terminal and nothing changed.
    pub fn update_status(&mut self, status: OrderStatus, accrual: Option<Points>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = status;
        self.accrual = match status {
            OrderStatus::Processed => accrual,
            _ => None,
        };
        true
    }
}

/// Outcome of storing a freshly submitted order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Created,
    AlreadyStored,
    OwnedByAnotherUser,
}

/// Outcome of writing a polling result back to an order record.
#[derive(Debug, Clone, PartialEq)]
pub enum OrderUpdate {
    /// The write went through; carries the order as stored afterwards.
    Applied(Order),
    /// The order was already terminal and was left untouched.
    AlreadyTerminal(Order),
}
