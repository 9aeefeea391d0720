use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::cpr::Cpr;

pub type AppointmentId = Ulid;
pub type DonorId = Ulid;

/// Length of every appointment slot.
pub const SLOT_MINUTES: i64 = 30;

pub fn slot_duration() -> TimeDelta {
    TimeDelta::minutes(SLOT_MINUTES)
}

/// The zero value a client sends when no time was picked.
pub fn unset_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_time(NaiveTime::MIN)
}

/// Earliest instant the appointment table can persist.
pub fn storage_floor() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1753, 1, 1)
        .unwrap_or(NaiveDate::MIN)
        .and_time(NaiveTime::MIN)
}

/// Interval `[start, end)` in clinic-local wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl Span {
    pub fn new(start: NaiveDateTime, end: NaiveDateTime) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// The appointment slot beginning at `start`.
    pub fn slot(start: NaiveDateTime) -> Self {
        Self::new(start, start + slot_duration())
    }

    pub fn duration(&self) -> TimeDelta {
        self.end - self.start
    }

    /// Standard half-open overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Booking conflict test: `other` conflicts when its start or its end lies
    /// inside `[self.start, self.end]`, both bounds included. Back-to-back
    /// slots therefore conflict.
    pub fn touches(&self, other: &Span) -> bool {
        let within = |t: NaiveDateTime| self.start <= t && t <= self.end;
        within(other.start) || within(other.end)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: AppointmentId,
    pub donor_id: DonorId,
    pub span: Span,
}

impl Appointment {
    pub fn start(&self) -> NaiveDateTime {
        self.span.start
    }

    pub fn end(&self) -> NaiveDateTime {
        self.span.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donor {
    pub id: DonorId,
    pub cpr: Cpr,
    pub name: String,
}

/// WAL record format. Flat, no nesting.
/// Only committed changes are ever logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    DonorRegistered {
        id: DonorId,
        cpr: Cpr,
        name: String,
    },
    AppointmentBooked {
        id: AppointmentId,
        donor_id: DonorId,
        span: Span,
    },
    AppointmentDeleted {
        id: AppointmentId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 5, 14)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn slot_is_thirty_minutes() {
        let s = Span::slot(at(9, 0));
        assert_eq!(s.end, at(9, 30));
        assert_eq!(s.duration(), TimeDelta::minutes(30));
    }

    #[test]
    fn half_open_overlap_ignores_adjacent() {
        let a = Span::slot(at(9, 0));
        let b = Span::slot(at(9, 30));
        assert!(!a.overlaps(&b));
        assert!(a.overlaps(&Span::slot(at(9, 15))));
    }

    #[test]
    fn touches_flags_adjacent_slots() {
        let a = Span::slot(at(9, 0));
        assert!(a.touches(&Span::slot(at(9, 30))));
        assert!(a.touches(&Span::slot(at(8, 30))));
        assert!(a.touches(&a));
    }

    #[test]
    fn touches_misses_distant_slots() {
        let a = Span::slot(at(9, 0));
        assert!(!a.touches(&Span::slot(at(9, 31))));
        assert!(!a.touches(&Span::slot(at(8, 29))));
    }

    #[test]
    fn sentinels_are_ordered() {
        assert!(unset_time() < storage_floor());
        assert_eq!(storage_floor().date(), NaiveDate::from_ymd_opt(1753, 1, 1).unwrap());
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AppointmentBooked {
            id: Ulid::new(),
            donor_id: Ulid::new(),
            span: Span::slot(at(10, 0)),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
