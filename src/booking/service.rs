use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{NaiveDate, NaiveDateTime};
use tracing::{error, info, warn};

use crate::clock::Clock;
use crate::cpr::Cpr;
use crate::limits::MAX_NAME_LEN;
use crate::model::*;
use crate::observability::{RESERVATIONS_TOTAL, RESERVE_DURATION_SECONDS};
use crate::store::{AppointmentStore, StoreError};

use super::availability::{future_only, unavailable_times_for_date};
use super::error::BookingError;
use super::reserve::{reserve_slot, Reservation, ReserveError, ReservePolicy};
use super::validation::{validate_appointment_horizon, validate_appointment_time};

/// The calls the controller layer makes into the booking core.
pub struct BookingService<S> {
    store: S,
    clock: Arc<dyn Clock>,
    policy: ReservePolicy,
    reserve_timeout: Option<Duration>,
}

impl<S: AppointmentStore> BookingService<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>, policy: ReservePolicy) -> Self {
        Self {
            store,
            clock,
            policy,
            reserve_timeout: None,
        }
    }

    /// Bound the whole reservation, retries and backoff included. A
    /// reservation cut off before its commit leaves no rows behind. One cut
    /// off during its commit still lands, and is reported as booked.
    pub fn with_reserve_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.reserve_timeout = timeout;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &ReservePolicy {
        &self.policy
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    // ── Appointments ─────────────────────────────────────────

    /// Validate `start` and reserve the slot for `donor_id`.
    pub async fn create_appointment(
        &self,
        donor_id: DonorId,
        start: NaiveDateTime,
    ) -> Result<AppointmentId, BookingError> {
        let now = self.clock.now();
        if let Err(e) = validate_appointment_time(start, now) {
            metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "invalid").increment(1);
            return Err(e.into());
        }
        if !validate_appointment_horizon(start, now) {
            metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "beyond_horizon").increment(1);
            return Err(BookingError::BeyondHorizon { start });
        }

        let started = Instant::now();
        let reserve = reserve_slot(&self.store, start, donor_id, &self.policy);
        let result = match self.reserve_timeout {
            Some(limit) => match tokio::time::timeout(limit, reserve).await {
                Ok(r) => r,
                Err(_) => match self.landed_after_deadline(donor_id, start).await? {
                    Some(id) => {
                        warn!(
                            "reservation of {start} for donor {donor_id} committed after {limit:?}"
                        );
                        Ok(Reservation::Reserved(id))
                    }
                    None => {
                        warn!(
                            "reservation of {start} for donor {donor_id} timed out after {limit:?}"
                        );
                        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "timeout")
                            .increment(1);
                        return Err(BookingError::Timeout(limit));
                    }
                },
            },
            None => reserve.await,
        };
        metrics::histogram!(RESERVE_DURATION_SECONDS).record(started.elapsed().as_secs_f64());

        match result {
            Ok(Reservation::Reserved(id)) => {
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "reserved").increment(1);
                info!("donor {donor_id} booked {start} as appointment {id}");
                Ok(id)
            }
            Ok(Reservation::Rejected) => {
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => "rejected").increment(1);
                Err(BookingError::SlotTaken { start })
            }
            Err(e) => {
                let outcome = match &e {
                    ReserveError::RetriesExhausted { .. } => "exhausted",
                    ReserveError::ConsistencyAnomaly { .. } => "anomaly",
                    ReserveError::Store { .. } => "error",
                };
                metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
                if !matches!(e.store_error(), Some(StoreError::UnknownDonor(_)) | None) {
                    error!("reservation of {start} for donor {donor_id} failed: {e}");
                }
                Err(e.into())
            }
        }
    }

    /// The store finishes a commit it has started even when the caller is
    /// gone, and its lock orders this read after that commit.
    async fn landed_after_deadline(
        &self,
        donor_id: DonorId,
        start: NaiveDateTime,
    ) -> Result<Option<AppointmentId>, BookingError> {
        let mine = self.store.list_appointments_by_donor(donor_id).await?;
        Ok(mine.iter().find(|a| a.start() == start).map(|a| a.id))
    }

    pub async fn unavailable_times(
        &self,
        date: NaiveDate,
    ) -> Result<BTreeSet<String>, BookingError> {
        let appointments = self.store.list_appointments().await?;
        Ok(unavailable_times_for_date(&appointments, date))
    }

    pub async fn future_appointments(&self) -> Result<Vec<Appointment>, BookingError> {
        let appointments = self.store.list_appointments().await?;
        Ok(future_only(appointments, self.clock.now()))
    }

    pub async fn appointments(&self) -> Result<Vec<Appointment>, BookingError> {
        Ok(self.store.list_appointments().await?)
    }

    pub async fn appointments_for_donor(
        &self,
        donor_id: DonorId,
    ) -> Result<Vec<Appointment>, BookingError> {
        Ok(self.store.list_appointments_by_donor(donor_id).await?)
    }

    /// Cancel the donor's appointment at exactly `start`. False if none.
    pub async fn delete_appointment_by_start(
        &self,
        donor_id: DonorId,
        start: NaiveDateTime,
    ) -> Result<bool, BookingError> {
        let deleted = self.store.delete_appointment_by_start(donor_id, start).await?;
        if deleted {
            info!("donor {donor_id} cancelled appointment at {start}");
        }
        Ok(deleted)
    }

    pub async fn delete_appointment(&self, id: AppointmentId) -> Result<bool, BookingError> {
        let deleted = self.store.delete_appointment(id).await?;
        if deleted {
            info!("appointment {id} deleted");
        }
        Ok(deleted)
    }

    // ── Donors ───────────────────────────────────────────────

    pub async fn register_donor(
        &self,
        id: DonorId,
        cpr: &str,
        name: &str,
    ) -> Result<Donor, BookingError> {
        let cpr = Cpr::parse(cpr)?;
        let name = name.trim();
        if name.len() > MAX_NAME_LEN {
            return Err(StoreError::LimitExceeded("donor name too long").into());
        }
        let donor = Donor {
            id,
            cpr,
            name: name.to_string(),
        };
        self.store.register_donor(donor.clone()).await?;
        info!("registered donor {id}");
        Ok(donor)
    }

    pub async fn get_donor(&self, id: DonorId) -> Result<Option<Donor>, BookingError> {
        Ok(self.store.get_donor(id).await?)
    }

    pub async fn list_donors(&self) -> Result<Vec<Donor>, BookingError> {
        Ok(self.store.list_donors().await?)
    }
}
