use crate::conflicts::Occupancy;
use crate::model::{ClassGrid, Timetable, TimetableCell, Weekday};
use chrono::{Datelike, NaiveDate};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Substitution {
    pub id: String,
    pub class_id: String,
    pub date: NaiveDate,
    pub period_id: u32,
    pub substitute_teacher_id: String,
    pub substitute_teacher_name: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SubstitutionError {
    #[error("{0} is not a working day")]
    NotWorkingDay(NaiveDate),
    #[error("substitute is already the regular teacher for this period")]
    SameAsRegular,
    #[error("substitute teaches {class_id} at that time")]
    RegularConflict { class_id: String },
    #[error("substitute already covers {class_id} at that time")]
    SubstitutionConflict { class_id: String },
}

pub struct SubstitutionRequest<'a> {
    pub class_id: &'a str,
    pub date: NaiveDate,
    pub period_id: u32,
    pub substitute_teacher_id: &'a str,
}

pub fn school_weekday(date: NaiveDate, working_days: &[Weekday]) -> Option<Weekday> {
    Weekday::from_chrono(date.weekday()).filter(|d| working_days.contains(d))
}

/// Checks a substitution against the regular timetable and against other
/// substitutions on the same date and period. An existing substitution for
/// the same class slot is ignored since the new one replaces it.
pub fn validate_substitution(
    req: &SubstitutionRequest<'_>,
    working_days: &[Weekday],
    timetable: &Timetable,
    existing: &[Substitution],
) -> Result<Weekday, SubstitutionError> {
    let day = school_weekday(req.date, working_days)
        .ok_or(SubstitutionError::NotWorkingDay(req.date))?;

    let regular = timetable
        .get(req.class_id)
        .and_then(|g| g.get(&day))
        .and_then(|d| d.get(&req.period_id))
        .and_then(|c| c.teacher_id.as_deref());
    if regular == Some(req.substitute_teacher_id) {
        return Err(SubstitutionError::SameAsRegular);
    }

    let occupancy = Occupancy::from_timetable(timetable, None);
    if let Some(other) = occupancy.booked_class(req.substitute_teacher_id, day, req.period_id) {
        if other != req.class_id {
            return Err(SubstitutionError::RegularConflict {
                class_id: other.to_string(),
            });
        }
    }

    if let Some(s) = existing.iter().find(|s| {
        s.date == req.date
            && s.period_id == req.period_id
            && s.class_id != req.class_id
            && s.substitute_teacher_id == req.substitute_teacher_id
    }) {
        return Err(SubstitutionError::SubstitutionConflict {
            class_id: s.class_id.clone(),
        });
    }
    Ok(day)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveCell {
    #[serde(flatten)]
    pub cell: TimetableCell,
    pub substitution_id: Option<String>,
    pub regular_teacher_id: Option<String>,
}

/// The class's periods on `date` with substitutions laid over the base
/// grid. The base grid itself is left untouched.
pub fn effective_day(
    grid: &ClassGrid,
    date: NaiveDate,
    working_days: &[Weekday],
    substitutions: &[Substitution],
) -> Option<(Weekday, BTreeMap<u32, EffectiveCell>)> {
    let day = school_weekday(date, working_days)?;
    let mut out: BTreeMap<u32, EffectiveCell> = grid
        .get(&day)
        .map(|periods| {
            periods
                .iter()
                .map(|(p, c)| {
                    (
                        *p,
                        EffectiveCell {
                            cell: c.clone(),
                            substitution_id: None,
                            regular_teacher_id: None,
                        },
                    )
                })
                .collect()
        })
        .unwrap_or_default();

    for s in substitutions.iter().filter(|s| s.date == date) {
        let entry = out.entry(s.period_id).or_insert_with(|| EffectiveCell {
            cell: TimetableCell::default(),
            substitution_id: None,
            regular_teacher_id: None,
        });
        entry.regular_teacher_id = entry.cell.teacher_id.take();
        entry.cell.teacher_id = Some(s.substitute_teacher_id.clone());
        entry.cell.teacher_name = s.substitute_teacher_name.clone();
        entry.substitution_id = Some(s.id.clone());
    }
    Some((day, out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("date")
    }

    fn cell(subject: &str, teacher: &str) -> TimetableCell {
        TimetableCell {
            subject_id: Some(subject.to_string()),
            subject_name: Some(subject.to_string()),
            teacher_id: Some(teacher.to_string()),
            teacher_name: Some(teacher.to_string()),
            room: None,
        }
    }

    fn timetable() -> Timetable {
        let mut tt = Timetable::new();
        let mut a = ClassGrid::new();
        a.entry(Weekday::Monday).or_default().insert(2, cell("Math", "T1"));
        tt.insert("A".to_string(), a);
        let mut b = ClassGrid::new();
        b.entry(Weekday::Monday).or_default().insert(2, cell("Art", "T2"));
        tt.insert("B".to_string(), b);
        tt
    }

    fn sub(id: &str, class_id: &str, d: &str, teacher: &str) -> Substitution {
        Substitution {
            id: id.to_string(),
            class_id: class_id.to_string(),
            date: date(d),
            period_id: 2,
            substitute_teacher_id: teacher.to_string(),
            substitute_teacher_name: Some(teacher.to_string()),
            reason: None,
        }
    }

    fn req<'a>(class_id: &'a str, d: &str, teacher: &'a str) -> SubstitutionRequest<'a> {
        SubstitutionRequest {
            class_id,
            date: date(d),
            period_id: 2,
            substitute_teacher_id: teacher,
        }
    }

    const WEEK: [Weekday; 5] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
    ];

    #[test]
    fn accepts_free_teacher() {
        // 2024-09-02 is a Monday.
        let day = validate_substitution(&req("A", "2024-09-02", "T3"), &WEEK, &timetable(), &[]);
        assert_eq!(day, Ok(Weekday::Monday));
    }

    #[test]
    fn rejects_regular_teacher_and_busy_teacher() {
        let tt = timetable();
        assert_eq!(
            validate_substitution(&req("A", "2024-09-02", "T1"), &WEEK, &tt, &[]),
            Err(SubstitutionError::SameAsRegular)
        );
        assert_eq!(
            validate_substitution(&req("A", "2024-09-02", "T2"), &WEEK, &tt, &[]),
            Err(SubstitutionError::RegularConflict {
                class_id: "B".to_string()
            })
        );
        // Tuesday has no regular bookings for T2.
        assert!(validate_substitution(&req("A", "2024-09-03", "T2"), &WEEK, &tt, &[]).is_ok());
    }

    #[test]
    fn rejects_teacher_already_covering_another_class() {
        let existing = [sub("s1", "B", "2024-09-02", "T3")];
        assert_eq!(
            validate_substitution(&req("A", "2024-09-02", "T3"), &WEEK, &timetable(), &existing),
            Err(SubstitutionError::SubstitutionConflict {
                class_id: "B".to_string()
            })
        );
        // Replacing the same class slot is allowed.
        assert!(
            validate_substitution(&req("B", "2024-09-02", "T3"), &WEEK, &timetable(), &existing)
                .is_ok()
        );
    }

    #[test]
    fn rejects_non_working_days() {
        // 2024-09-07 is a Saturday, 2024-09-08 a Sunday.
        for d in ["2024-09-07", "2024-09-08"] {
            assert_eq!(
                validate_substitution(&req("A", d, "T3"), &WEEK, &timetable(), &[]),
                Err(SubstitutionError::NotWorkingDay(date(d)))
            );
        }
    }

    #[test]
    fn effective_day_overlays_without_touching_base() {
        let tt = timetable();
        let grid = &tt["A"];
        let subs = [sub("s1", "A", "2024-09-02", "T3"), sub("s2", "A", "2024-09-09", "T4")];
        let (day, cells) = effective_day(grid, date("2024-09-02"), &WEEK, &subs).expect("day");
        assert_eq!(day, Weekday::Monday);
        let p2 = &cells[&2];
        assert_eq!(p2.cell.teacher_id.as_deref(), Some("T3"));
        assert_eq!(p2.cell.subject_name.as_deref(), Some("Math"));
        assert_eq!(p2.regular_teacher_id.as_deref(), Some("T1"));
        assert_eq!(p2.substitution_id.as_deref(), Some("s1"));

        let base = &grid[&Weekday::Monday][&2];
        assert_eq!(base.teacher_id.as_deref(), Some("T1"));
    }
}
