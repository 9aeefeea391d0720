//! Slot reservation under concurrent access.
//!
//! The appointment table carries no constraint that keeps slots disjoint, so
//! reservation is optimistic: insert the row inside a transaction, then
//! recount conflicting rows through that same transaction. At
//! `ReadUncommitted` the recount also sees competitors' in-flight inserts.
//! Exactly one visible row means ours is alone and we commit; more than one
//! means someone is racing us, so we roll back, sleep a random interval and
//! try again within a fixed budget.

use std::time::Duration;

use chrono::NaiveDateTime;
use rand::Rng;
use tracing::{debug, error, warn};

use crate::limits::MAX_BACKOFF_MS;
use crate::model::*;
use crate::observability::{RESERVE_ATTEMPTS_TOTAL, RESERVE_BACKOFF_SECONDS};
use crate::store::{AppointmentStore, IsolationLevel, StoreError, StoreTransaction};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservePolicy {
    /// Transactional attempts before giving up.
    pub max_attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Isolation for the insert-and-recount transaction. Raising it to
    /// `ReadCommitted` hides racing inserts from the recount.
    pub isolation: IsolationLevel,
}

impl Default for ReservePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_min: Duration::from_millis(1000),
            backoff_max: Duration::from_millis(2500),
            isolation: IsolationLevel::ReadUncommitted,
        }
    }
}

impl ReservePolicy {
    /// A uniformly random delay in `[backoff_min, backoff_max]`.
    pub fn backoff(&self) -> Duration {
        let lo = self.backoff_min.as_millis().min(MAX_BACKOFF_MS as u128) as u64;
        let hi = self.backoff_max.as_millis().min(MAX_BACKOFF_MS as u128) as u64;
        if hi <= lo {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::thread_rng().gen_range(lo..=hi))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved(AppointmentId),
    /// The slot conflicts with a committed appointment.
    Rejected,
}

/// What the last contended attempt saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("{overlapping} conflicting rows visible after insert")]
pub struct Contention {
    pub overlapping: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum ReserveError {
    #[error("{op} failed: {source}")]
    Store {
        op: &'static str,
        #[source]
        source: StoreError,
    },
    #[error("inserted appointment {id} was not visible to its own transaction")]
    ConsistencyAnomaly { id: AppointmentId },
    #[error("slot still contended after {attempts} attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Contention,
    },
}

impl ReserveError {
    /// The underlying store error, if this is one.
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            ReserveError::Store { source, .. } => Some(source),
            _ => None,
        }
    }
}

fn store_err(op: &'static str) -> impl FnOnce(StoreError) -> ReserveError {
    move |source| ReserveError::Store { op, source }
}

enum Attempt {
    Committed(AppointmentId),
    Contended(Contention),
}

/// Reserve the slot starting at `start` for `donor_id`.
///
/// Callers validate the start time and horizon first; nothing is re-checked
/// here. On success exactly one row was committed; on any other outcome
/// every attempt was rolled back.
pub async fn reserve_slot<S: AppointmentStore>(
    store: &S,
    start: NaiveDateTime,
    donor_id: DonorId,
    policy: &ReservePolicy,
) -> Result<Reservation, ReserveError> {
    let span = Span::slot(start);

    // Fail fast against committed rows before opening any transaction.
    let committed = store
        .count_overlapping(&span)
        .await
        .map_err(store_err("count committed overlaps"))?;
    if committed != 0 {
        debug!("slot {start} rejected: {committed} committed conflicts");
        return Ok(Reservation::Rejected);
    }

    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        metrics::counter!(RESERVE_ATTEMPTS_TOTAL).increment(1);

        let contention = match try_reserve(store, &span, donor_id, policy.isolation).await? {
            Attempt::Committed(id) => {
                debug!("slot {start} reserved as {id} on attempt {attempt}");
                return Ok(Reservation::Reserved(id));
            }
            Attempt::Contended(c) => c,
        };

        if attempt >= attempts {
            warn!("slot {start} still contended after {attempts} attempts ({contention})");
            return Err(ReserveError::RetriesExhausted {
                attempts,
                last: contention,
            });
        }

        let delay = policy.backoff();
        debug!(
            "slot {start} contended on attempt {attempt} ({contention}), retrying in {}ms",
            delay.as_millis()
        );
        metrics::histogram!(RESERVE_BACKOFF_SECONDS).record(delay.as_secs_f64());
        tokio::time::sleep(delay).await;

        // The competitor may have committed while we slept.
        let committed = store
            .count_overlapping(&span)
            .await
            .map_err(store_err("count committed overlaps"))?;
        if committed != 0 {
            debug!("slot {start} taken by a competitor during backoff");
            return Ok(Reservation::Rejected);
        }
    }
}

/// One insert-recount-decide round inside its own transaction.
async fn try_reserve<S: AppointmentStore>(
    store: &S,
    span: &Span,
    donor_id: DonorId,
    isolation: IsolationLevel,
) -> Result<Attempt, ReserveError> {
    let mut txn = store
        .begin(isolation)
        .await
        .map_err(store_err("begin transaction"))?;

    let id = match txn.insert_appointment(donor_id, *span).await {
        Ok(id) => id,
        Err(e) => {
            rollback_quietly(txn).await;
            return Err(store_err("insert appointment")(e));
        }
    };

    let overlapping = match txn.count_overlapping(span).await {
        Ok(n) => n,
        Err(e) => {
            rollback_quietly(txn).await;
            return Err(store_err("recount overlaps")(e));
        }
    };

    match overlapping {
        0 => {
            error!(
                "appointment {id} inserted at {} is invisible to its own transaction \
                 ({isolation}); rolling back",
                span.start
            );
            rollback_quietly(txn).await;
            Err(ReserveError::ConsistencyAnomaly { id })
        }
        1 => {
            txn.commit().await.map_err(store_err("commit reservation"))?;
            Ok(Attempt::Committed(id))
        }
        n => {
            txn.rollback()
                .await
                .map_err(store_err("roll back contended reservation"))?;
            Ok(Attempt::Contended(Contention { overlapping: n }))
        }
    }
}

async fn rollback_quietly<T: StoreTransaction>(txn: T) {
    if let Err(e) = txn.rollback().await {
        warn!("rollback failed: {e}");
    }
}
