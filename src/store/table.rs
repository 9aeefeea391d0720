use std::collections::HashMap;

use chrono::NaiveDateTime;

use crate::cpr::Cpr;
use crate::model::*;

use super::IsolationLevel;

pub type TxnId = u64;

/// A row inserted by a transaction that has not committed yet.
#[derive(Debug, Clone)]
struct Staged {
    txn: TxnId,
    appointment: Appointment,
}

/// Whose eyes a conflict count is computed through.
#[derive(Debug, Clone, Copy)]
pub enum View {
    /// Committed rows only.
    Committed,
    /// Committed rows plus whatever the isolation level lets `txn` see.
    Transaction { txn: TxnId, isolation: IsolationLevel },
}

/// The donor and appointment tables, plus rows staged by open transactions.
#[derive(Debug, Default)]
pub struct Table {
    donors: HashMap<DonorId, Donor>,
    cpr_index: HashMap<Cpr, DonorId>,
    /// Committed appointments, sorted by `span.start`.
    appointments: Vec<Appointment>,
    staged: Vec<Staged>,
}

impl Table {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Donors ───────────────────────────────────────────────

    pub fn donor(&self, id: &DonorId) -> Option<&Donor> {
        self.donors.get(id)
    }

    pub fn donors(&self) -> impl Iterator<Item = &Donor> {
        self.donors.values()
    }

    pub fn donor_count(&self) -> usize {
        self.donors.len()
    }

    pub fn contains_cpr(&self, cpr: &Cpr) -> bool {
        self.cpr_index.contains_key(cpr)
    }

    pub fn insert_donor(&mut self, donor: Donor) {
        self.cpr_index.insert(donor.cpr.clone(), donor.id);
        self.donors.insert(donor.id, donor);
    }

    // ── Committed appointments ───────────────────────────────

    pub fn appointments(&self) -> &[Appointment] {
        &self.appointments
    }

    /// Insert maintaining sort order by start.
    pub fn insert_appointment(&mut self, appointment: Appointment) {
        let pos = self
            .appointments
            .binary_search_by_key(&appointment.span.start, |a| a.span.start)
            .unwrap_or_else(|e| e);
        self.appointments.insert(pos, appointment);
    }

    pub fn remove_appointment(&mut self, id: AppointmentId) -> Option<Appointment> {
        let pos = self.appointments.iter().position(|a| a.id == id)?;
        Some(self.appointments.remove(pos))
    }

    pub fn find_by_start(&self, donor_id: DonorId, start: NaiveDateTime) -> Option<AppointmentId> {
        let from = self.appointments.partition_point(|a| a.span.start < start);
        self.appointments[from..]
            .iter()
            .take_while(|a| a.span.start == start)
            .find(|a| a.donor_id == donor_id)
            .map(|a| a.id)
    }

    /// Committed appointments conflicting with `query` under [`Span::touches`].
    /// Anything starting after `query.end` cannot conflict and is skipped by
    /// binary search.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Appointment> {
        let right_bound = self
            .appointments
            .partition_point(|a| a.span.start <= query.end);
        self.appointments[..right_bound]
            .iter()
            .filter(move |a| query.touches(&a.span))
    }

    // ── Staged rows ──────────────────────────────────────────

    pub fn stage(&mut self, txn: TxnId, appointment: Appointment) {
        self.staged.push(Staged { txn, appointment });
    }

    pub fn staged_count(&self, txn: TxnId) -> usize {
        self.staged.iter().filter(|s| s.txn == txn).count()
    }

    pub fn staged_total(&self) -> usize {
        self.staged.len()
    }

    /// Rows staged by `txn`, without removing them.
    pub fn staged_rows(&self, txn: TxnId) -> Vec<Appointment> {
        self.staged
            .iter()
            .filter(|s| s.txn == txn)
            .map(|s| s.appointment.clone())
            .collect()
    }

    /// Move everything `txn` staged into the committed table.
    pub fn promote(&mut self, txn: TxnId) -> usize {
        let (mine, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.staged).into_iter().partition(|s| s.txn == txn);
        self.staged = rest;
        let promoted = mine.len();
        for s in mine {
            self.insert_appointment(s.appointment);
        }
        promoted
    }

    /// Drop everything `txn` staged.
    pub fn discard(&mut self, txn: TxnId) -> usize {
        let before = self.staged.len();
        self.staged.retain(|s| s.txn != txn);
        before - self.staged.len()
    }

    /// Count rows conflicting with `span` as seen through `view`.
    pub fn count_visible(&self, span: &Span, view: View) -> usize {
        let committed = self.overlapping(span).count();
        let staged = match view {
            View::Committed => 0,
            View::Transaction { txn, isolation } => self
                .staged
                .iter()
                .filter(|s| match isolation {
                    IsolationLevel::ReadUncommitted => true,
                    IsolationLevel::ReadCommitted => s.txn == txn,
                })
                .filter(|s| span.touches(&s.appointment.span))
                .count(),
        };
        committed + staged
    }

    // ── Event application ────────────────────────────────────

    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::DonorRegistered { id, cpr, name } => self.insert_donor(Donor {
                id: *id,
                cpr: cpr.clone(),
                name: name.clone(),
            }),
            Event::AppointmentBooked { id, donor_id, span } => {
                self.insert_appointment(Appointment {
                    id: *id,
                    donor_id: *donor_id,
                    span: *span,
                });
            }
            Event::AppointmentDeleted { id } => {
                self.remove_appointment(*id);
            }
        }
    }

    /// The minimal event sequence that rebuilds the committed state.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut donors: Vec<&Donor> = self.donors.values().collect();
        donors.sort_by_key(|d| d.id);
        let mut events: Vec<Event> = donors
            .into_iter()
            .map(|d| Event::DonorRegistered {
                id: d.id,
                cpr: d.cpr.clone(),
                name: d.name.clone(),
            })
            .collect();
        events.extend(self.appointments.iter().map(|a| Event::AppointmentBooked {
            id: a.id,
            donor_id: a.donor_id,
            span: a.span,
        }));
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn at(h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 1, 7)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn appt(donor_id: DonorId, h: u32, m: u32) -> Appointment {
        Appointment {
            id: Ulid::new(),
            donor_id,
            span: Span::slot(at(h, m)),
        }
    }

    #[test]
    fn appointments_kept_sorted() {
        let mut t = Table::new();
        let d = Ulid::new();
        t.insert_appointment(appt(d, 11, 0));
        t.insert_appointment(appt(d, 9, 0));
        t.insert_appointment(appt(d, 10, 0));
        let starts: Vec<_> = t.appointments().iter().map(|a| a.start()).collect();
        assert_eq!(starts, vec![at(9, 0), at(10, 0), at(11, 0)]);
    }

    #[test]
    fn overlapping_is_boundary_inclusive() {
        let mut t = Table::new();
        let d = Ulid::new();
        t.insert_appointment(appt(d, 9, 0));
        t.insert_appointment(appt(d, 12, 0));

        assert_eq!(t.overlapping(&Span::slot(at(9, 30))).count(), 1);
        assert_eq!(t.overlapping(&Span::slot(at(8, 30))).count(), 1);
        assert_eq!(t.overlapping(&Span::slot(at(9, 10))).count(), 1);
        assert_eq!(t.overlapping(&Span::slot(at(10, 0))).count(), 0);
        assert_eq!(t.overlapping(&Span::slot(at(11, 29))).count(), 0);
    }

    #[test]
    fn overlapping_empty_table() {
        let t = Table::new();
        assert_eq!(t.overlapping(&Span::slot(at(9, 0))).count(), 0);
    }

    #[test]
    fn find_by_start_matches_donor_and_exact_time() {
        let mut t = Table::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mine = appt(a, 9, 0);
        let mine_id = mine.id;
        t.insert_appointment(mine);
        t.insert_appointment(appt(b, 9, 0));

        assert_eq!(t.find_by_start(a, at(9, 0)), Some(mine_id));
        assert_eq!(t.find_by_start(a, at(9, 1)), None);
        assert_eq!(t.find_by_start(Ulid::new(), at(9, 0)), None);
    }

    #[test]
    fn remove_nonexistent_is_none() {
        let mut t = Table::new();
        t.insert_appointment(appt(Ulid::new(), 9, 0));
        assert!(t.remove_appointment(Ulid::new()).is_none());
        assert_eq!(t.appointments().len(), 1);
    }

    #[test]
    fn staged_visibility_depends_on_isolation() {
        let mut t = Table::new();
        let d = Ulid::new();
        t.stage(1, appt(d, 9, 0));
        t.stage(2, appt(d, 9, 0));
        let span = Span::slot(at(9, 0));

        let dirty = View::Transaction { txn: 1, isolation: IsolationLevel::ReadUncommitted };
        let committed = View::Transaction { txn: 1, isolation: IsolationLevel::ReadCommitted };
        assert_eq!(t.count_visible(&span, dirty), 2);
        assert_eq!(t.count_visible(&span, committed), 1);
        assert_eq!(t.count_visible(&span, View::Committed), 0);
    }

    #[test]
    fn promote_and_discard() {
        let mut t = Table::new();
        let d = Ulid::new();
        t.stage(1, appt(d, 9, 0));
        t.stage(2, appt(d, 10, 0));
        t.stage(2, appt(d, 11, 0));

        assert_eq!(t.promote(1), 1);
        assert_eq!(t.appointments().len(), 1);
        assert_eq!(t.staged_count(1), 0);
        assert_eq!(t.discard(2), 2);
        assert_eq!(t.staged_count(2), 0);
        assert_eq!(t.appointments().len(), 1);
    }

    #[test]
    fn snapshot_rebuilds_state() {
        let mut t = Table::new();
        let donor = Donor {
            id: Ulid::new(),
            cpr: Cpr::parse("241299-1111").unwrap(),
            name: "Niels".into(),
        };
        t.insert_donor(donor.clone());
        let a = appt(donor.id, 9, 0);
        t.insert_appointment(a.clone());
        t.insert_appointment(appt(donor.id, 13, 0));
        t.apply(&Event::AppointmentDeleted { id: a.id });

        let mut rebuilt = Table::new();
        for e in t.snapshot_events() {
            rebuilt.apply(&e);
        }
        assert_eq!(rebuilt.appointments(), t.appointments());
        assert_eq!(rebuilt.donor(&donor.id), Some(&donor));
        assert!(rebuilt.contains_cpr(&donor.cpr));
    }
}
