use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDateTime;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::booking::is_conflict_free;
use crate::limits::*;
use crate::model::*;
use crate::wal::Wal;

use super::table::{Table, TxnId, View};
use super::writer::{wal_writer_loop, WalCommand};
use super::{AppointmentStore, IsolationLevel, StoreError, StoreTransaction};

struct Shared {
    table: Arc<RwLock<Table>>,
    wal_tx: mpsc::Sender<WalCommand>,
    next_txn: AtomicU64,
}

impl Shared {
    /// Write events to the WAL via the background group-commit writer.
    async fn wal_append(&self, events: Vec<Event>) -> Result<(), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()))
    }

    async fn lock_table(&self) -> OwnedRwLockWriteGuard<Table> {
        self.table.clone().write_owned().await
    }

    /// WAL-append then apply, with the table write lock already held.
    ///
    /// The pair runs on its own task that owns the lock, so once this future
    /// is first polled the WAL and the table end up agreeing even if the
    /// caller stops waiting.
    async fn persist_and_apply(
        self: &Arc<Self>,
        mut table: OwnedRwLockWriteGuard<Table>,
        event: Event,
    ) -> Result<(), StoreError> {
        let shared = self.clone();
        join_durable(tokio::spawn(async move {
            shared.wal_append(vec![event.clone()]).await?;
            table.apply(&event);
            Ok(())
        }))
        .await
    }
}

async fn join_durable(handle: JoinHandle<Result<(), StoreError>>) -> Result<(), StoreError> {
    handle
        .await
        .map_err(|e| StoreError::Wal(format!("WAL task failed: {e}")))?
}

/// In-memory appointment store made durable by a write-ahead log.
///
/// All state lives behind one table lock. Writers hold the write lock across
/// the WAL append so a change is visible only once it is durable.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Replay the WAL at `wal_path` and start its writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let mut table = Table::new();
        for event in &events {
            table.apply(event);
        }
        debug!(
            "replayed {} events: {} donors, {} appointments",
            events.len(),
            table.donor_count(),
            table.appointments().len()
        );
        if !is_conflict_free(table.appointments()) {
            warn!("replayed appointments contain overlapping slots");
        }

        Ok(Self {
            shared: Arc::new(Shared {
                table: Arc::new(RwLock::new(table)),
                wal_tx,
                next_txn: AtomicU64::new(1),
            }),
        })
    }

    /// Rows staged by transactions that have neither committed nor rolled back.
    pub async fn in_flight_rows(&self) -> usize {
        self.shared.table.read().await.staged_total()
    }

    /// Rewrite the WAL with only the events needed to rebuild committed state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        // Held for the whole rewrite so no commit lands between snapshot and swap.
        let table = self.shared.table.write().await;
        let events = table.snapshot_events();
        let (tx, rx) = oneshot::channel();
        self.shared
            .wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::Wal("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| StoreError::Wal("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Wal(e.to_string()));
        drop(table);
        result
    }

    /// Keep the WAL writer busy for `delay` before it handles anything queued
    /// after this call.
    #[cfg(test)]
    pub(crate) async fn stall_wal_writer(&self, delay: std::time::Duration) {
        let _ = self.shared.wal_tx.send(WalCommand::Stall { delay }).await;
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .shared
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

#[async_trait]
impl AppointmentStore for MemoryStore {
    type Transaction = MemoryTransaction;

    async fn begin(&self, isolation: IsolationLevel) -> Result<MemoryTransaction, StoreError> {
        let id = self.shared.next_txn.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryTransaction {
            shared: self.shared.clone(),
            id,
            isolation,
            open: true,
        })
    }

    async fn count_overlapping(&self, span: &Span) -> Result<usize, StoreError> {
        let table = self.shared.table.read().await;
        Ok(table.count_visible(span, View::Committed))
    }

    async fn register_donor(&self, donor: Donor) -> Result<(), StoreError> {
        if donor.name.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("donor name too long"));
        }
        let table = self.shared.lock_table().await;
        if table.donor_count() >= MAX_DONORS {
            return Err(StoreError::LimitExceeded("too many donors"));
        }
        if table.donor(&donor.id).is_some() {
            return Err(StoreError::DuplicateDonor(donor.id.to_string()));
        }
        if table.contains_cpr(&donor.cpr) {
            return Err(StoreError::DuplicateDonor(donor.cpr.formatted()));
        }

        let event = Event::DonorRegistered {
            id: donor.id,
            cpr: donor.cpr,
            name: donor.name,
        };
        self.shared.persist_and_apply(table, event).await
    }

    async fn get_donor(&self, id: DonorId) -> Result<Option<Donor>, StoreError> {
        Ok(self.shared.table.read().await.donor(&id).cloned())
    }

    async fn list_donors(&self) -> Result<Vec<Donor>, StoreError> {
        let table = self.shared.table.read().await;
        let mut donors: Vec<Donor> = table.donors().cloned().collect();
        donors.sort_by_key(|d| d.id);
        Ok(donors)
    }

    async fn delete_appointment(&self, id: AppointmentId) -> Result<bool, StoreError> {
        let table = self.shared.lock_table().await;
        if !table.appointments().iter().any(|a| a.id == id) {
            return Ok(false);
        }
        self.shared
            .persist_and_apply(table, Event::AppointmentDeleted { id })
            .await?;
        Ok(true)
    }

    async fn delete_appointment_by_start(
        &self,
        donor_id: DonorId,
        start: NaiveDateTime,
    ) -> Result<bool, StoreError> {
        let table = self.shared.lock_table().await;
        let Some(id) = table.find_by_start(donor_id, start) else {
            return Ok(false);
        };
        self.shared
            .persist_and_apply(table, Event::AppointmentDeleted { id })
            .await?;
        Ok(true)
    }

    async fn list_appointments(&self) -> Result<Vec<Appointment>, StoreError> {
        Ok(self.shared.table.read().await.appointments().to_vec())
    }

    async fn list_appointments_by_donor(
        &self,
        donor_id: DonorId,
    ) -> Result<Vec<Appointment>, StoreError> {
        let table = self.shared.table.read().await;
        Ok(table
            .appointments()
            .iter()
            .filter(|a| a.donor_id == donor_id)
            .cloned()
            .collect())
    }
}

pub struct MemoryTransaction {
    shared: Arc<Shared>,
    id: TxnId,
    isolation: IsolationLevel,
    open: bool,
}

impl MemoryTransaction {
    pub fn id(&self) -> TxnId {
        self.id
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.open {
            Ok(())
        } else {
            Err(StoreError::TransactionClosed(self.id))
        }
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    async fn insert_appointment(
        &mut self,
        donor_id: DonorId,
        span: Span,
    ) -> Result<AppointmentId, StoreError> {
        self.ensure_open()?;
        let mut table = self.shared.table.write().await;
        if table.donor(&donor_id).is_none() {
            return Err(StoreError::UnknownDonor(donor_id));
        }
        if table.staged_count(self.id) >= MAX_ROWS_PER_TRANSACTION {
            return Err(StoreError::LimitExceeded("too many rows in transaction"));
        }
        if table.appointments().len() >= MAX_APPOINTMENTS {
            return Err(StoreError::LimitExceeded("too many appointments"));
        }

        let id = Ulid::new();
        table.stage(self.id, Appointment { id, donor_id, span });
        Ok(id)
    }

    async fn count_overlapping(&self, span: &Span) -> Result<usize, StoreError> {
        self.ensure_open()?;
        let table = self.shared.table.read().await;
        Ok(table.count_visible(
            span,
            View::Transaction {
                txn: self.id,
                isolation: self.isolation,
            },
        ))
    }

    async fn commit(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        let mut table = self.shared.lock_table().await;
        // The commit task owns the staged rows from here on; Drop must not
        // discard them while their append is in flight.
        self.open = false;
        let txn = self.id;
        let events: Vec<Event> = table
            .staged_rows(txn)
            .into_iter()
            .map(|a| Event::AppointmentBooked {
                id: a.id,
                donor_id: a.donor_id,
                span: a.span,
            })
            .collect();

        if events.is_empty() {
            table.promote(txn);
            return Ok(());
        }

        let shared = self.shared.clone();
        join_durable(tokio::spawn(async move {
            if let Err(e) = shared.wal_append(events).await {
                table.discard(txn);
                return Err(e);
            }
            table.promote(txn);
            Ok(())
        }))
        .await
    }

    async fn rollback(mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        self.shared.table.write().await.discard(self.id);
        self.open = false;
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.open {
            return;
        }
        let txn = self.id;
        debug!("transaction {txn} dropped while open, rolling back");
        if let Ok(mut table) = self.shared.table.try_write() {
            table.discard(txn);
            return;
        }
        let shared = self.shared.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    shared.table.write().await.discard(txn);
                });
            }
            Err(_) => warn!("transaction {txn} dropped outside a runtime; staged rows leaked"),
        }
    }
}
