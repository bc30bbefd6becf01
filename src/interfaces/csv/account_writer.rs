use crate::domain::account::{Balance, LedgerAccount};
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct AccountRow<'a> {
    employer: &'a str,
    balance: Balance,
    locked: Balance,
    available: Balance,
    parked: usize,
}

/// Writes the ledger accounts as `employer,balance,locked,available,parked`.
pub struct AccountWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> AccountWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_accounts(&mut self, accounts: &[LedgerAccount]) -> Result<()> {
        if accounts.is_empty() {
            self.writer
                .write_record(["employer", "balance", "locked", "available", "parked"])?;
        }
        for account in accounts {
            self.writer.serialize(AccountRow {
                employer: &account.employer_id,
                balance: account.balance.normalized(),
                locked: account.locked.normalized(),
                available: account.available().normalized(),
                parked: account.parked.len(),
            })?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
