use std::collections::BTreeSet;

use chrono::{NaiveDate, NaiveDateTime};

use crate::model::Appointment;

/// `HH:MM` labels of appointment starts on `date`, de-duplicated and sorted.
///
/// Advisory only: the slot can be taken between this query and a
/// reservation, which re-checks on its own.
pub fn unavailable_times_for_date(
    appointments: &[Appointment],
    date: NaiveDate,
) -> BTreeSet<String> {
    appointments
        .iter()
        .filter(|a| a.start().date() == date)
        .map(|a| a.start().format("%H:%M").to_string())
        .collect()
}

/// Appointments starting strictly after `now`, ordered by start.
pub fn future_only(mut appointments: Vec<Appointment>, now: NaiveDateTime) -> Vec<Appointment> {
    appointments.retain(|a| a.start() > now);
    appointments.sort_by_key(|a| a.start());
    appointments
}
