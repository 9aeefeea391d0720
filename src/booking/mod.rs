mod availability;
mod error;
mod overlap;
mod reserve;
mod service;
mod validation;

pub use availability::{future_only, unavailable_times_for_date};
pub use error::BookingError;
pub use overlap::{is_conflict_free, overlap_count};
pub use reserve::{reserve_slot, Contention, Reservation, ReserveError, ReservePolicy};
pub use service::BookingService;
pub use validation::{
    validate_appointment_horizon, validate_appointment_time, ValidationError, HORIZON_MONTHS,
};
