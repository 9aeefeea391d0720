use std::time::Duration;

use chrono::NaiveDateTime;

use crate::cpr::CprError;
use crate::model::DonorId;
use crate::store::StoreError;

use super::reserve::ReserveError;
use super::validation::{ValidationError, HORIZON_MONTHS};

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("appointment time {start} is more than {months} months ahead", months = HORIZON_MONTHS)]
    BeyondHorizon { start: NaiveDateTime },
    #[error("the slot at {start} is already taken, please pick another time")]
    SlotTaken { start: NaiveDateTime },
    #[error("donor not found: {0}")]
    UnknownDonor(DonorId),
    #[error("invalid CPR number: {0}")]
    InvalidCpr(#[from] CprError),
    #[error(transparent)]
    Reserve(ReserveError),
    #[error(transparent)]
    Store(StoreError),
    #[error("reservation did not finish within {0:?}")]
    Timeout(Duration),
}

impl BookingError {
    /// True when retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BookingError::Reserve(ReserveError::RetriesExhausted { .. }) | BookingError::Timeout(_)
        )
    }
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::UnknownDonor(id) => BookingError::UnknownDonor(id),
            other => BookingError::Store(other),
        }
    }
}

impl From<ReserveError> for BookingError {
    fn from(e: ReserveError) -> Self {
        match e {
            ReserveError::Store {
                source: StoreError::UnknownDonor(id),
                ..
            } => BookingError::UnknownDonor(id),
            other => BookingError::Reserve(other),
        }
    }
}
