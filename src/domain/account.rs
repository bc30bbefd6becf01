use crate::domain::endorsement::RequestId;
use crate::error::LedgerError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// A monetary balance in fixed-point decimal.
///
/// Wraps `rust_decimal::Decimal` so balance arithmetic never goes through
/// floating point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Balance(pub Decimal);

/// A non-negative monetary amount.
///
/// Direction (debit or credit) is carried by the transaction kind, never by
/// the sign of the amount.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(try_from = "Decimal", into = "Decimal")]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(value: Decimal) -> Result<Self, LedgerError> {
        if value >= Decimal::ZERO {
            Ok(Self(value))
        } else {
            Err(LedgerError::InvalidAmount(format!(
                "amount must not be negative, got {value}"
            )))
        }
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl TryFrom<Decimal> for Amount {
    type Error = LedgerError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Amount> for Decimal {
    fn from(amount: Amount) -> Self {
        amount.0
    }
}

impl From<Amount> for Balance {
    fn from(amount: Amount) -> Self {
        Self(amount.0)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Balance {
    pub const ZERO: Self = Self(Decimal::ZERO);

    pub fn new(amount: Decimal) -> Self {
        Self(amount)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }

    /// Same value without trailing zeros, for reports.
    pub fn normalized(self) -> Self {
        Self(self.0.normalize())
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add for Balance {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sub for Balance {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Self(self.0 - rhs.0)
    }
}

impl AddAssign for Balance {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl SubAssign for Balance {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

/// The endorsement account of one employer.
///
/// `available = balance - locked` is never observably negative: every
/// mutation happens inside the ledger's per-employer section and `reserve`
/// checks capacity in the same step that takes it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
pub struct LedgerAccount {
    pub employer_id: String,
    /// Committed, cleared funds.
    pub balance: Balance,
    /// Reserved but not yet committed debits.
    pub locked: Balance,
    /// Requests parked for lack of funds, in the order they were parked.
    #[serde(default)]
    pub parked: Vec<RequestId>,
}

impl LedgerAccount {
    pub fn new(employer_id: impl Into<String>) -> Self {
        Self {
            employer_id: employer_id.into(),
            balance: Balance::ZERO,
            locked: Balance::ZERO,
            parked: Vec::new(),
        }
    }

    pub fn available(&self) -> Balance {
        self.balance - self.locked
    }

    /// Locks `amount` if capacity exists. Returns whether it did.
    pub fn reserve(&mut self, amount: Amount) -> bool {
        if self.available() >= amount.into() {
            self.locked += amount.into();
            true
        } else {
            false
        }
    }

    /// Applies a reserved debit: the lock is consumed and the balance charged.
    pub fn settle_debit(&mut self, amount: Amount) -> Result<(), LedgerError> {
        self.unlock(amount)?;
        self.balance -= amount.into();
        Ok(())
    }

    /// Drops a reserved debit without charging the balance.
    pub fn unlock(&mut self, amount: Amount) -> Result<(), LedgerError> {
        if self.locked >= amount.into() {
            self.locked -= amount.into();
            Ok(())
        } else {
            Err(LedgerError::LockedUnderflow(self.employer_id.clone()))
        }
    }

    pub fn credit(&mut self, amount: Amount) {
        self.balance += amount.into();
    }

    pub fn park(&mut self, request_id: &RequestId) {
        if !self.parked.contains(request_id) {
            self.parked.push(request_id.clone());
        }
    }

    pub fn unpark(&mut self, request_id: &RequestId) -> bool {
        let before = self.parked.len();
        self.parked.retain(|parked| parked != request_id);
        before != self.parked.len()
    }

    pub fn has_parked(&self) -> bool {
        !self.parked.is_empty()
    }
}
