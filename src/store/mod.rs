//! Appointment storage.
//!
//! The booking core talks to storage only through [`AppointmentStore`] and
//! [`StoreTransaction`]. The appointment table has no uniqueness or
//! exclusion constraint on time ranges: keeping slots disjoint is the job of
//! the reservation protocol in `booking::reserve`, which relies on the
//! transaction isolation level chosen here.

mod memory;
mod table;
mod writer;

pub use memory::{MemoryStore, MemoryTransaction};
pub use table::Table;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::NaiveDateTime;

use crate::model::*;

/// How much of other transactions' uncommitted work a transaction can see.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Rows inserted by in-flight transactions are visible (dirty reads).
    #[default]
    ReadUncommitted,
    /// Only committed rows plus this transaction's own inserts are visible.
    ReadCommitted,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => f.write_str("read_uncommitted"),
            IsolationLevel::ReadCommitted => f.write_str("read_committed"),
        }
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_uncommitted" => Ok(IsolationLevel::ReadUncommitted),
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            other => Err(format!("unknown isolation level: {other}")),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("donor not found: {0}")]
    UnknownDonor(DonorId),
    #[error("donor already registered: {0}")]
    DuplicateDonor(String),
    #[error("transaction {0} is no longer open")]
    TransactionClosed(u64),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    Wal(String),
}

/// A unit of work against the appointment table.
///
/// Dropping an open transaction rolls it back.
#[async_trait]
pub trait StoreTransaction: Send + Sync + Sized {
    fn isolation(&self) -> IsolationLevel;

    /// Stage a new appointment row and return its store-assigned id.
    /// Fails with [`StoreError::UnknownDonor`] if the donor does not exist.
    async fn insert_appointment(
        &mut self,
        donor_id: DonorId,
        span: Span,
    ) -> Result<AppointmentId, StoreError>;

    /// Count rows conflicting with `span` as seen from this transaction.
    async fn count_overlapping(&self, span: &Span) -> Result<usize, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AppointmentStore: Send + Sync {
    type Transaction: StoreTransaction;

    async fn begin(&self, isolation: IsolationLevel) -> Result<Self::Transaction, StoreError>;

    /// Count committed rows conflicting with `span`, outside any transaction.
    async fn count_overlapping(&self, span: &Span) -> Result<usize, StoreError>;

    async fn register_donor(&self, donor: Donor) -> Result<(), StoreError>;

    async fn get_donor(&self, id: DonorId) -> Result<Option<Donor>, StoreError>;

    async fn list_donors(&self) -> Result<Vec<Donor>, StoreError>;

    /// Returns false if no such appointment exists.
    async fn delete_appointment(&self, id: AppointmentId) -> Result<bool, StoreError>;

    /// Delete the donor's appointment starting exactly at `start`.
    /// Returns false if there is none.
    async fn delete_appointment_by_start(
        &self,
        donor_id: DonorId,
        start: NaiveDateTime,
    ) -> Result<bool, StoreError>;

    /// All committed appointments, ordered by start.
    async fn list_appointments(&self) -> Result<Vec<Appointment>, StoreError>;

    async fn list_appointments_by_donor(
        &self,
        donor_id: DonorId,
    ) -> Result<Vec<Appointment>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn isolation_level_parse() {
        assert_eq!(
            "READ UNCOMMITTED".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadUncommitted
        );
        assert_eq!(
            "read-committed".parse::<IsolationLevel>().unwrap(),
            IsolationLevel::ReadCommitted
        );
        assert!("serializable".parse::<IsolationLevel>().is_err());
        assert_eq!(IsolationLevel::default().to_string(), "read_uncommitted");
    }
}
