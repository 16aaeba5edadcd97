use crate::domain::balance::Balance;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct BalanceRow<'a> {
    user: &'a str,
    current: String,
    withdrawn: String,
}

/// Writes balances as `user,current,withdrawn` with two decimal places.
pub struct BalanceWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> BalanceWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_balances<'a>(
        &mut self,
        balances: impl IntoIterator<Item = &'a Balance>,
    ) -> Result<()> {
        for balance in balances {
            self.writer.serialize(BalanceRow {
                user: balance.user.as_str(),
                current: balance.current.to_string(),
                withdrawn: balance.withdrawn.to_string(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
