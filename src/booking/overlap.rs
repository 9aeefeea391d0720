use crate::model::{Appointment, Span};

/// Count the `existing` spans that conflict with `candidate`.
///
/// An existing span conflicts when its start or its end falls inside
/// `[candidate.start, candidate.end]`, bounds included. This is stricter than
/// half-open overlap: a slot ending exactly when the candidate begins still
/// counts.
pub fn overlap_count<'a, I>(candidate: &Span, existing: I) -> usize
where
    I: IntoIterator<Item = &'a Span>,
{
    existing
        .into_iter()
        .filter(|span| candidate.touches(span))
        .count()
}

/// True when no appointment conflicts with any other one in the set.
pub fn is_conflict_free(appointments: &[Appointment]) -> bool {
    appointments.iter().all(|a| {
        let others = appointments
            .iter()
            .filter(|b| b.id != a.id)
            .map(|b| &b.span);
        overlap_count(&a.span, others) == 0
    })
}
