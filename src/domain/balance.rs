use super::order::OrderNumber;
use super::user::UserId;
use crate::error::{AccrualError, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Number of decimal places points are kept with.
pub const POINTS_SCALE: u32 = 2;

/// A quantity of loyalty points, fixed to two decimal places.
///
/// This is a wrapper around `rust_decimal::Decimal` to enforce domain-specific rules
/// and provide type safety for balance calculations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Points(Decimal);

/// A strictly positive amount of points, as requested by a withdrawal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Points {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Self {
        Self(value.round_dp(POINTS_SCALE))
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_negative(&self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }
}

impl Amount {
    pub fn new(value: Decimal) -> Result<Self> {
        let rounded = value.round_dp(POINTS_SCALE);
        if rounded > Decimal::ZERO {
            Ok(Self(rounded))
        } else {
            Err(AccrualError::InvalidAmount(value))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = AccrualError;

    fn try_from(value: Decimal) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<Amount> for Points {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl fmt::Display for Points {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl Add for Points {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Points {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Points {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Points {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// A user's spendable points and lifetime withdrawals.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Balance {
    pub user: UserId,
    /// Points available for withdrawal. Never negative.
    pub current: Points,
    /// Total of all withdrawals so far. Only ever grows.
    pub withdrawn: Points,
}

impl Balance {
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            current: Points::ZERO,
            withdrawn: Points::ZERO,
        }
    }

    /// Adds accrued points to the current balance.
    pub fn credit(&mut self, points: Points) -> Result<()> {
        if points.is_negative() {
            return Err(AccrualError::InvalidAmount(points.value()));
        }
        self.current += points;
        Ok(())
    }

    /// Moves `amount` from current to withdrawn if the balance covers it.
    pub fn debit(&mut self, amount: Amount) -> Result<()> {
        let amount = Points::from(amount);
        if self.current >= amount {
            self.current -= amount;
            self.withdrawn += amount;
            Ok(())
        } else {
            Err(AccrualError::InsufficientFunds {
                requested: amount.value(),
                available: self.current.value(),
            })
        }
    }
}

/// A spend of points against an order number.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct Withdrawal {
    pub user: UserId,
    /// Validated like any order number, but need not be an uploaded order.
    pub order: OrderNumber,
    pub sum: Amount,
    pub processed_at: DateTime<Utc>,
}

impl Withdrawal {
    pub fn new(user: UserId, order: OrderNumber, sum: Amount) -> Self {
        Self {
            user,
            order,
            sum,
            processed_at: Utc::now(),
        }
    }
}
