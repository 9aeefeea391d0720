use chrono::{Months, NaiveDateTime};

use crate::model::{storage_floor, unset_time};

/// How far ahead an appointment may be booked, in calendar months.
pub const HORIZON_MONTHS: u32 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("appointment time is not set")]
    InvalidTime,
    #[error("appointment time {0} is in the past")]
    PastTime(NaiveDateTime),
    #[error("appointment time {0} is before the earliest storable date")]
    OutOfRange(NaiveDateTime),
}

/// Check the temporal rules a candidate start must meet, in order:
/// it must be set, must not be before `now`, and must not precede the
/// storage floor.
pub fn validate_appointment_time(
    candidate: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<(), ValidationError> {
    if candidate == unset_time() {
        return Err(ValidationError::InvalidTime);
    }
    if candidate < now {
        return Err(ValidationError::PastTime(candidate));
    }
    if candidate < storage_floor() {
        return Err(ValidationError::OutOfRange(candidate));
    }
    Ok(())
}

/// False when `candidate` lies more than [`HORIZON_MONTHS`] calendar months
/// after `now`.
pub fn validate_appointment_horizon(candidate: NaiveDateTime, now: NaiveDateTime) -> bool {
    match now.checked_add_months(Months::new(HORIZON_MONTHS)) {
        Some(limit) => candidate <= limit,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeDelta};

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 8, 31)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn rejects_unset_sentinel() {
        assert_eq!(
            validate_appointment_time(unset_time(), now()),
            Err(ValidationError::InvalidTime)
        );
    }

    #[test]
    fn rejects_past() {
        let t = now() - TimeDelta::seconds(1);
        assert_eq!(validate_appointment_time(t, now()), Err(ValidationError::PastTime(t)));
    }

    #[test]
    fn accepts_now_and_future() {
        assert_eq!(validate_appointment_time(now(), now()), Ok(()));
        assert_eq!(validate_appointment_time(now() + TimeDelta::days(3), now()), Ok(()));
    }

    #[test]
    fn rejects_before_storage_floor() {
        // Only reachable when "now" itself predates the floor.
        let early_now = NaiveDate::from_ymd_opt(1700, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        let t = NaiveDate::from_ymd_opt(1720, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap();
        assert_eq!(validate_appointment_time(t, early_now), Err(ValidationError::OutOfRange(t)));
        assert_eq!(validate_appointment_time(storage_floor(), early_now), Ok(()));
    }

    #[test]
    fn sentinel_checked_before_past() {
        // The sentinel is also in the past; it must still report InvalidTime.
        assert!(unset_time() < now());
        assert_eq!(
            validate_appointment_time(unset_time(), now()),
            Err(ValidationError::InvalidTime)
        );
    }

    #[test]
    fn horizon_limits() {
        let n = now();
        assert!(validate_appointment_horizon(n + TimeDelta::days(1), n));
        let six = n.checked_add_months(Months::new(6)).unwrap();
        assert!(validate_appointment_horizon(six, n));
        assert!(!validate_appointment_horizon(six + TimeDelta::days(1), n));
    }

    #[test]
    fn horizon_uses_calendar_months() {
        // 31 Aug + 6 months clamps to 28 Feb (2031 is not a leap year).
        let n = now();
        let end_of_feb = NaiveDate::from_ymd_opt(2031, 2, 28)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap();
        assert!(validate_appointment_horizon(end_of_feb, n));
        assert!(!validate_appointment_horizon(end_of_feb + TimeDelta::days(1), n));
    }
}
