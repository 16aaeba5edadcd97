use crate::domain::user::UserId;
use crate::error::{AccrualError, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Read;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CommandType {
    /// Submit an order for accrual.
    Order,
    /// Spend points against an order reference.
    Withdraw,
}

/// One line of a replay file: `type, user, order, amount`.
///
/// `amount` is only read for withdrawals. The order number is kept as typed so
/// that a malformed one is reported by the engine, not by the reader.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Command {
    #[serde(rename = "type")]
    pub kind: CommandType,
    pub user: UserId,
    pub order: String,
    #[serde(default)]
    pub amount: Option<Decimal>,
}

/// Reads commands from a CSV source.
///
/// This reader wraps `csv::Reader` and provides an iterator over `Result<Command>`.
/// It trims whitespace and accepts rows without the trailing `amount` column.
pub struct CommandReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> CommandReader<R> {
    /// Creates a new `CommandReader` from any `Read` source (e.g., File, Stdin).
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Returns an iterator that lazily reads and deserializes commands.
    pub fn commands(self) -> impl Iterator<Item = Result<Command>> {
        self.reader
            .into_deserialize()
            .map(|result| result.map_err(AccrualError::from))
    }
}
