use crate::model::{ClassGrid, Timetable, Weekday};
use std::collections::HashMap;
use thiserror::Error;

/// Which class each teacher is booked into, per (day, period).
#[derive(Debug, Clone, Default)]
pub struct Occupancy {
    slots: HashMap<(Weekday, u32), HashMap<String, String>>,
    load: HashMap<String, usize>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConflictError {
    #[error("teacher {teacher_id} is already teaching {class_id} on {day} period {period_id}")]
    TeacherBusy {
        teacher_id: String,
        class_id: String,
        day: &'static str,
        period_id: u32,
    },
}

impl Occupancy {
    /// Builds the index from every grid except `exclude_class`, which is
    /// the one about to be rewritten.
    pub fn from_timetable(timetable: &Timetable, exclude_class: Option<&str>) -> Self {
        let mut occ = Occupancy::default();
        for (class_id, grid) in timetable {
            if Some(class_id.as_str()) == exclude_class {
                continue;
            }
            occ.book_grid(class_id, grid);
        }
        occ
    }

    pub fn book_grid(&mut self, class_id: &str, grid: &ClassGrid) {
        for (day, periods) in grid {
            for (period_id, cell) in periods {
                if let Some(t) = cell.teacher_id.as_deref() {
                    self.book(t, class_id, *day, *period_id);
                }
            }
        }
    }

    pub fn book(&mut self, teacher_id: &str, class_id: &str, day: Weekday, period_id: u32) {
        let prev = self
            .slots
            .entry((day, period_id))
            .or_default()
            .insert(teacher_id.to_string(), class_id.to_string());
        if prev.is_none() {
            *self.load.entry(teacher_id.to_string()).or_insert(0) += 1;
        }
    }

    pub fn release_class(&mut self, class_id: &str) {
        let Occupancy { slots, load } = self;
        for teachers in slots.values_mut() {
            teachers.retain(|teacher_id, booked| {
                if booked == class_id {
                    if let Some(n) = load.get_mut(teacher_id) {
                        *n = n.saturating_sub(1);
                    }
                    false
                } else {
                    true
                }
            });
        }
    }

    pub fn booked_class(&self, teacher_id: &str, day: Weekday, period_id: u32) -> Option<&str> {
        self.slots
            .get(&(day, period_id))
            .and_then(|m| m.get(teacher_id))
            .map(String::as_str)
    }

    /// Busy means booked in a class other than `for_class`.
    pub fn is_busy(&self, teacher_id: &str, for_class: &str, day: Weekday, period_id: u32) -> bool {
        self.booked_class(teacher_id, day, period_id)
            .map(|c| c != for_class)
            .unwrap_or(false)
    }

    pub fn load(&self, teacher_id: &str) -> usize {
        self.load.get(teacher_id).copied().unwrap_or(0)
    }

    pub fn slot_count(&self) -> usize {
        self.slots.values().map(|m| m.len()).sum()
    }
}

/// Manual single-cell edit check: reject a teacher booked elsewhere.
pub fn check_cell_edit(
    occupancy: &Occupancy,
    class_id: &str,
    teacher_id: &str,
    day: Weekday,
    period_id: u32,
) -> Result<(), ConflictError> {
    match occupancy.booked_class(teacher_id, day, period_id) {
        Some(other) if other != class_id => Err(ConflictError::TeacherBusy {
            teacher_id: teacher_id.to_string(),
            class_id: other.to_string(),
            day: day.as_str(),
            period_id,
        }),
        _ => Ok(()),
    }
}

/// Lists (teacher, day, period, classes) for every double booking in a
/// full timetable. Empty for a consistent school.
pub fn find_double_bookings(timetable: &Timetable) -> Vec<(String, Weekday, u32, Vec<String>)> {
    let mut seen: HashMap<(String, Weekday, u32), Vec<String>> = HashMap::new();
    for (class_id, grid) in timetable {
        for (day, periods) in grid {
            for (period_id, cell) in periods {
                if let Some(t) = cell.teacher_id.as_deref() {
                    seen.entry((t.to_string(), *day, *period_id))
                        .or_default()
                        .push(class_id.clone());
                }
            }
        }
    }
    let mut out: Vec<_> = seen
        .into_iter()
        .filter(|(_, classes)| classes.len() > 1)
        .map(|((t, d, p), classes)| (t, d, p, classes))
        .collect();
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TimetableCell;

    fn cell(teacher: &str) -> TimetableCell {
        TimetableCell {
            teacher_id: Some(teacher.to_string()),
            ..TimetableCell::default()
        }
    }

    fn timetable() -> Timetable {
        let mut tt = Timetable::new();
        let mut a = ClassGrid::new();
        a.entry(Weekday::Monday).or_default().insert(2, cell("t1"));
        a.entry(Weekday::Monday).or_default().insert(3, cell("t2"));
        tt.insert("A".to_string(), a);
        let mut b = ClassGrid::new();
        b.entry(Weekday::Monday).or_default().insert(2, cell("t2"));
        tt.insert("B".to_string(), b);
        tt
    }

    #[test]
    fn excludes_target_class() {
        let occ = Occupancy::from_timetable(&timetable(), Some("A"));
        assert!(!occ.is_busy("t1", "A", Weekday::Monday, 2));
        assert!(occ.is_busy("t2", "A", Weekday::Monday, 2));
        assert_eq!(occ.load("t2"), 1);
    }

    #[test]
    fn cell_edit_rejects_teacher_booked_elsewhere() {
        let occ = Occupancy::from_timetable(&timetable(), None);
        let e = check_cell_edit(&occ, "B", "t1", Weekday::Monday, 2).unwrap_err();
        assert_eq!(
            e,
            ConflictError::TeacherBusy {
                teacher_id: "t1".to_string(),
                class_id: "A".to_string(),
                day: "Monday",
                period_id: 2
            }
        );
        // Re-saving the teacher's own cell is fine.
        assert!(check_cell_edit(&occ, "A", "t1", Weekday::Monday, 2).is_ok());
        assert!(check_cell_edit(&occ, "B", "t1", Weekday::Tuesday, 2).is_ok());
    }

    #[test]
    fn release_class_frees_slots() {
        let mut occ = Occupancy::from_timetable(&timetable(), None);
        assert_eq!(occ.load("t2"), 2);
        occ.release_class("A");
        assert_eq!(occ.load("t2"), 1);
        assert_eq!(occ.booked_class("t1", Weekday::Monday, 2), None);
        assert_eq!(occ.slot_count(), 1);
    }

    #[test]
    fn detects_double_bookings() {
        let mut tt = timetable();
        assert!(find_double_bookings(&tt).is_empty());
        if let Some(day) = tt.get_mut("B").and_then(|g| g.get_mut(&Weekday::Monday)) {
            day.insert(3, cell("t2"));
        }
        let found = find_double_bookings(&tt);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].0, "t2");
        assert_eq!(found[0].3, vec!["A".to_string(), "B".to_string()]);
    }
}
