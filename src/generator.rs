use crate::conflicts::Occupancy;
use crate::model::{
    ClassGrid, Subject, SubjectAllocation, Teacher, TimetableCell, Weekday, HOMEROOM_PERIOD,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How subjects are spread over a class's periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubjectOrder {
    /// Weekly quotas from `periods_per_week`, no same-day repeats while
    /// other subjects are still available, deterministic.
    #[default]
    Balanced,
    /// Per-day shuffled pool cycled over the periods.
    Shuffle,
}

impl SubjectOrder {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "balanced" => Some(Self::Balanced),
            "shuffle" => Some(Self::Shuffle),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balanced => "balanced",
            Self::Shuffle => "shuffle",
        }
    }
}

pub struct GenerateInput<'a> {
    pub class_id: &'a str,
    pub working_days: &'a [Weekday],
    /// Non-break period ids for the day.
    pub periods: &'a [u32],
    pub subjects_pool: &'a [Subject],
    pub teacher_pool: &'a [Teacher],
    pub allocations: &'a [SubjectAllocation],
    pub homeroom_teacher: Option<&'a Teacher>,
    pub order: SubjectOrder,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum GenerationWarning {
    /// The homeroom teacher already has period 1 in another class.
    #[serde(rename_all = "camelCase")]
    HomeroomConflict {
        teacher_id: String,
        other_class_id: String,
        day: Weekday,
    },
    /// Every teacher was busy, so the period kept its subject but no teacher.
    #[serde(rename_all = "camelCase")]
    Unstaffed {
        day: Weekday,
        period_id: u32,
        subject_name: String,
    },
}

#[derive(Debug, Clone, Default)]
pub struct GenerationOutcome {
    pub grid: ClassGrid,
    pub warnings: Vec<GenerationWarning>,
}

pub fn rng_for(seed: Option<u64>) -> StdRng {
    match seed {
        Some(s) => StdRng::seed_from_u64(s),
        None => StdRng::from_entropy(),
    }
}

struct SubjectPicker<'a> {
    pool: &'a [Subject],
    remaining: Vec<u32>,
}

impl<'a> SubjectPicker<'a> {
    fn new(pool: &'a [Subject]) -> Self {
        SubjectPicker {
            pool,
            remaining: pool.iter().map(|s| s.periods_per_week.unwrap_or(0)).collect(),
        }
    }

    /// Preference: quota left and unused today (largest quota first), then
    /// subjects without a quota unused today, then quota left, then cycling.
    fn balanced(&mut self, day_idx: usize, slot_idx: usize, used_today: &[bool]) -> usize {
        let n = self.pool.len();
        let rotated: Vec<usize> = (0..n).map(|k| (k + day_idx) % n).collect();

        let mut best: Option<usize> = None;
        for &i in &rotated {
            if self.remaining[i] > 0
                && !used_today[i]
                && best.map_or(true, |b| self.remaining[i] > self.remaining[b])
            {
                best = Some(i);
            }
        }
        let pick = best
            .or_else(|| {
                rotated
                    .iter()
                    .copied()
                    .find(|&i| self.pool[i].periods_per_week.is_none() && !used_today[i])
            })
            .or_else(|| rotated.iter().copied().find(|&i| self.remaining[i] > 0))
            .unwrap_or((day_idx + slot_idx) % n);

        if self.remaining[pick] > 0 {
            self.remaining[pick] -= 1;
        }
        pick
    }
}

fn allocated_teachers<'a>(
    input: &GenerateInput<'a>,
    subject: &Subject,
) -> Vec<&'a Teacher> {
    let mut out: Vec<&'a Teacher> = Vec::new();
    for a in input.allocations {
        if a.class_id != input.class_id {
            continue;
        }
        let matches = if a.subject_id.is_empty() {
            a.subject_name.eq_ignore_ascii_case(&subject.name)
        } else {
            a.subject_id == subject.id
        };
        if !matches {
            continue;
        }
        if let Some(t) = input.teacher_pool.iter().find(|t| t.id == a.teacher_id) {
            if !out.iter().any(|o| o.id == t.id) {
                out.push(t);
            }
        }
    }
    out
}

/// Allocated teachers first, then any free teacher, else nobody.
fn pick_teacher<'a, R: Rng + ?Sized>(
    input: &GenerateInput<'a>,
    subject: &Subject,
    day: Weekday,
    period_id: u32,
    occupancy: &Occupancy,
    rng: &mut R,
) -> Option<&'a Teacher> {
    let is_free = |t: &&Teacher| !occupancy.is_busy(&t.id, input.class_id, day, period_id);

    if let Some(t) = allocated_teachers(input, subject).into_iter().find(is_free) {
        return Some(t);
    }
    let free: Vec<&'a Teacher> = input.teacher_pool.iter().filter(is_free).collect();
    match input.order {
        SubjectOrder::Balanced => free.into_iter().min_by_key(|t| occupancy.load(&t.id)),
        SubjectOrder::Shuffle => free.choose(rng).copied(),
    }
}

/// Builds a full weekly grid for one class. Every assignment is booked into
/// `occupancy`, so calling this for several classes in turn with the same
/// occupancy never double-books a teacher.
pub fn generate_class_grid<R: Rng + ?Sized>(
    input: &GenerateInput<'_>,
    occupancy: &mut Occupancy,
    rng: &mut R,
) -> GenerationOutcome {
    occupancy.release_class(input.class_id);

    let mut periods: Vec<u32> = input.periods.to_vec();
    periods.sort_unstable();
    periods.dedup();

    let mut picker = SubjectPicker::new(input.subjects_pool);
    let pool_len = input.subjects_pool.len();
    let mut outcome = GenerationOutcome::default();

    for (day_idx, &day) in input.working_days.iter().enumerate() {
        let mut cells: BTreeMap<u32, TimetableCell> = BTreeMap::new();

        if periods.contains(&HOMEROOM_PERIOD) {
            if let Some(t) = input.homeroom_teacher {
                if let Some(other) = occupancy.booked_class(&t.id, day, HOMEROOM_PERIOD) {
                    if other != input.class_id {
                        tracing::warn!(
                            class_id = input.class_id,
                            teacher_id = %t.id,
                            other_class_id = other,
                            day = day.as_str(),
                            "homeroom teacher already holds period 1 elsewhere"
                        );
                        outcome.warnings.push(GenerationWarning::HomeroomConflict {
                            teacher_id: t.id.clone(),
                            other_class_id: other.to_string(),
                            day,
                        });
                    }
                }
                occupancy.book(&t.id, input.class_id, day, HOMEROOM_PERIOD);
            }
            cells.insert(
                HOMEROOM_PERIOD,
                TimetableCell::homeroom(input.homeroom_teacher),
            );
        }

        if pool_len == 0 {
            outcome.grid.insert(day, cells);
            continue;
        }

        let shuffled: Vec<usize> = match input.order {
            SubjectOrder::Shuffle => {
                let mut order: Vec<usize> = (0..pool_len).collect();
                order.shuffle(rng);
                order
            }
            SubjectOrder::Balanced => Vec::new(),
        };
        let mut used_today = vec![false; pool_len];

        for (slot_idx, &period_id) in periods
            .iter()
            .filter(|&&p| p != HOMEROOM_PERIOD)
            .enumerate()
        {
            let subject_idx = match input.order {
                SubjectOrder::Balanced => picker.balanced(day_idx, slot_idx, &used_today),
                SubjectOrder::Shuffle => shuffled[slot_idx % pool_len],
            };
            used_today[subject_idx] = true;
            let subject = &input.subjects_pool[subject_idx];

            let teacher = pick_teacher(input, subject, day, period_id, occupancy, rng);
            match teacher {
                Some(t) => occupancy.book(&t.id, input.class_id, day, period_id),
                None if !input.teacher_pool.is_empty() => {
                    outcome.warnings.push(GenerationWarning::Unstaffed {
                        day,
                        period_id,
                        subject_name: subject.name.clone(),
                    });
                }
                None => {}
            }

            cells.insert(
                period_id,
                TimetableCell {
                    subject_id: Some(subject.id.clone()),
                    subject_name: Some(subject.name.clone()),
                    teacher_id: teacher.map(|t| t.id.clone()),
                    teacher_name: teacher.map(|t| t.name.clone()),
                    room: None,
                },
            );
        }
        outcome.grid.insert(day, cells);
    }

    tracing::debug!(
        class_id = input.class_id,
        days = input.working_days.len(),
        order = input.order.as_str(),
        warnings = outcome.warnings.len(),
        "generated class grid"
    );
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflicts::find_double_bookings;
    use crate::model::{Timetable, HOMEROOM_SUBJECT, NOT_ASSIGNED};

    fn subject(id: &str, ppw: Option<u32>) -> Subject {
        Subject {
            id: id.to_string(),
            name: id.to_string(),
            localized_name: None,
            periods_per_week: ppw,
        }
    }

    fn teacher(id: &str) -> Teacher {
        Teacher {
            id: id.to_string(),
            name: format!("Teacher {}", id),
        }
    }

    fn alloc(teacher_id: &str, class_id: &str, subject_id: &str) -> SubjectAllocation {
        SubjectAllocation {
            teacher_id: teacher_id.to_string(),
            class_id: class_id.to_string(),
            subject_id: subject_id.to_string(),
            subject_name: subject_id.to_string(),
        }
    }

    fn input<'a>(
        class_id: &'a str,
        days: &'a [Weekday],
        periods: &'a [u32],
        subjects: &'a [Subject],
        teachers: &'a [Teacher],
        allocations: &'a [SubjectAllocation],
        homeroom: Option<&'a Teacher>,
    ) -> GenerateInput<'a> {
        GenerateInput {
            class_id,
            working_days: days,
            periods,
            subjects_pool: subjects,
            teacher_pool: teachers,
            allocations,
            homeroom_teacher: homeroom,
            order: SubjectOrder::Balanced,
        }
    }

    fn cell<'g>(grid: &'g ClassGrid, day: Weekday, period: u32) -> &'g TimetableCell {
        grid.get(&day)
            .and_then(|d| d.get(&period))
            .expect("cell present")
    }

    #[test]
    fn homeroom_then_subjects_in_pool_order() {
        let subjects = [subject("Math", None), subject("Science", None)];
        let t1 = teacher("T1");
        let teachers = [t1.clone(), teacher("T2")];
        let allocations = [alloc("T2", "A", "Science")];
        let days = [Weekday::Monday];
        let inp = input("A", &days, &[1, 2, 3], &subjects, &teachers, &allocations, Some(&t1));

        let mut occ = Occupancy::default();
        let out = generate_class_grid(&inp, &mut occ, &mut rng_for(Some(1)));
        let g = &out.grid;

        let p1 = cell(g, Weekday::Monday, 1);
        assert_eq!(p1.subject_name.as_deref(), Some(HOMEROOM_SUBJECT));
        assert_eq!(p1.teacher_id.as_deref(), Some("T1"));
        assert_eq!(cell(g, Weekday::Monday, 2).subject_id.as_deref(), Some("Math"));
        let p3 = cell(g, Weekday::Monday, 3);
        assert_eq!(p3.subject_id.as_deref(), Some("Science"));
        assert_eq!(p3.teacher_id.as_deref(), Some("T2"));
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn homeroom_holds_every_working_day_and_coverage_is_full() {
        let subjects = [subject("Math", None), subject("Art", None), subject("Music", None)];
        let t1 = teacher("T1");
        let teachers = [t1.clone(), teacher("T2"), teacher("T3")];
        let days = Weekday::ALL;
        let periods = [1, 2, 3, 4, 5, 6];
        let inp = input("A", &days, &periods, &subjects, &teachers, &[], Some(&t1));

        let out = generate_class_grid(&inp, &mut Occupancy::default(), &mut rng_for(Some(7)));
        assert_eq!(out.grid.len(), days.len());
        for day in days {
            let p1 = cell(&out.grid, day, 1);
            assert_eq!(p1.subject_name.as_deref(), Some(HOMEROOM_SUBJECT));
            assert_eq!(p1.teacher_id.as_deref(), Some("T1"));
            for p in 2..=6 {
                assert!(cell(&out.grid, day, p).subject_id.is_some());
            }
        }
    }

    #[test]
    fn missing_homeroom_teacher_is_not_assigned() {
        let subjects = [subject("Math", None)];
        let days = [Weekday::Tuesday];
        let inp = input("A", &days, &[1, 2], &subjects, &[], &[], None);
        let out = generate_class_grid(&inp, &mut Occupancy::default(), &mut rng_for(None));
        let p1 = cell(&out.grid, Weekday::Tuesday, 1);
        assert_eq!(p1.teacher_id, None);
        assert_eq!(p1.teacher_name.as_deref(), Some(NOT_ASSIGNED));
    }

    #[test]
    fn empty_teacher_pool_keeps_subjects_without_teachers() {
        let subjects = [subject("Math", None), subject("Science", None)];
        let days = [Weekday::Monday, Weekday::Wednesday];
        let inp = input("A", &days, &[1, 2, 3, 4], &subjects, &[], &[], None);
        let out = generate_class_grid(&inp, &mut Occupancy::default(), &mut rng_for(Some(3)));
        for day in days {
            for p in 2..=4 {
                let c = cell(&out.grid, day, p);
                assert!(c.subject_id.is_some());
                assert_eq!(c.teacher_id, None);
            }
        }
        assert!(out.warnings.is_empty());
    }

    #[test]
    fn empty_subject_pool_leaves_periods_blank() {
        let t1 = teacher("T1");
        let days = [Weekday::Monday];
        let teachers = [t1.clone()];
        let inp = input("A", &days, &[1, 2, 3], &[], &teachers, &[], Some(&t1));
        let out = generate_class_grid(&inp, &mut Occupancy::default(), &mut rng_for(Some(3)));
        let monday = out.grid.get(&Weekday::Monday).expect("monday");
        assert_eq!(monday.keys().copied().collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn shared_teacher_is_never_double_booked_across_classes() {
        let subjects = [subject("Math", None), subject("Science", None)];
        let teachers = [teacher("T2"), teacher("T3")];
        let allocations = [alloc("T2", "A", "Math"), alloc("T2", "B", "Math")];
        let days = Weekday::ALL;
        let periods = [1, 2, 3, 4, 5];

        let mut occ = Occupancy::default();
        let mut rng = rng_for(Some(11));
        let mut timetable = Timetable::new();
        for class_id in ["A", "B"] {
            let inp = input(class_id, &days, &periods, &subjects, &teachers, &allocations, None);
            let out = generate_class_grid(&inp, &mut occ, &mut rng);
            timetable.insert(class_id.to_string(), out.grid);
        }
        assert!(find_double_bookings(&timetable).is_empty());

        // B falls back to T3 wherever A already holds T2.
        let a = &timetable["A"];
        let b = &timetable["B"];
        for day in days {
            for p in 2..=5 {
                let ca = cell(a, day, p);
                let cb = cell(b, day, p);
                if ca.teacher_id.as_deref() == Some("T2") {
                    assert_ne!(cb.teacher_id.as_deref(), Some("T2"));
                }
                assert!(cb.subject_id.is_some());
            }
        }
    }

    #[test]
    fn busy_pool_leaves_slot_unstaffed_with_warning() {
        let subjects = [subject("Math", None)];
        let teachers = [teacher("T2")];
        let allocations = [alloc("T2", "A", "Math"), alloc("T2", "B", "Math")];
        let days = [Weekday::Monday];

        let mut occ = Occupancy::default();
        let mut rng = rng_for(Some(5));
        let a = input("A", &days, &[2], &subjects, &teachers, &allocations, None);
        generate_class_grid(&a, &mut occ, &mut rng);
        let b = input("B", &days, &[2], &subjects, &teachers, &allocations, None);
        let out = generate_class_grid(&b, &mut occ, &mut rng);

        let c = cell(&out.grid, Weekday::Monday, 2);
        assert_eq!(c.subject_id.as_deref(), Some("Math"));
        assert_eq!(c.teacher_id, None);
        assert_eq!(
            out.warnings,
            vec![GenerationWarning::Unstaffed {
                day: Weekday::Monday,
                period_id: 2,
                subject_name: "Math".to_string()
            }]
        );
    }

    #[test]
    fn regenerating_releases_previous_bookings() {
        let subjects = [subject("Math", None)];
        let teachers = [teacher("T2")];
        let days = [Weekday::Monday];
        let mut occ = Occupancy::default();
        let mut rng = rng_for(Some(5));
        let inp = input("A", &days, &[2, 3], &subjects, &teachers, &[], None);
        generate_class_grid(&inp, &mut occ, &mut rng);
        let out = generate_class_grid(&inp, &mut occ, &mut rng);
        assert_eq!(cell(&out.grid, Weekday::Monday, 2).teacher_id.as_deref(), Some("T2"));
        assert_eq!(occ.load("T2"), 2);
    }

    #[test]
    fn weekly_quotas_drive_balanced_order() {
        let subjects = [subject("Math", Some(3)), subject("Science", Some(2))];
        let days = &Weekday::ALL[..5];
        let inp = input("A", days, &[1, 2], &subjects, &[], &[], None);
        let out = generate_class_grid(&inp, &mut Occupancy::default(), &mut rng_for(None));

        let mut math = 0;
        let mut science = 0;
        for day in days {
            match cell(&out.grid, *day, 2).subject_id.as_deref() {
                Some("Math") => math += 1,
                Some("Science") => science += 1,
                other => panic!("unexpected subject {:?}", other),
            }
        }
        assert_eq!((math, science), (3, 2));
    }

    #[test]
    fn balanced_avoids_same_day_repeats() {
        let subjects = [subject("A", None), subject("B", None), subject("C", None)];
        let days = Weekday::ALL;
        let inp = input("X", &days, &[1, 2, 3, 4], &subjects, &[], &[], None);
        let out = generate_class_grid(&inp, &mut Occupancy::default(), &mut rng_for(None));
        for day in days {
            let mut ids: Vec<_> = (2..=4)
                .filter_map(|p| cell(&out.grid, day, p).subject_id.clone())
                .collect();
            ids.sort();
            ids.dedup();
            assert_eq!(ids.len(), 3, "repeat on {:?}", day);
        }
    }

    #[test]
    fn shuffle_is_reproducible_with_seed() {
        let subjects = [subject("A", None), subject("B", None), subject("C", None)];
        let teachers = [teacher("T1"), teacher("T2")];
        let days = Weekday::ALL;
        let mut inp = input("X", &days, &[1, 2, 3, 4, 5], &subjects, &teachers, &[], None);
        inp.order = SubjectOrder::Shuffle;

        let a = generate_class_grid(&inp, &mut Occupancy::default(), &mut rng_for(Some(42)));
        let b = generate_class_grid(&inp, &mut Occupancy::default(), &mut rng_for(Some(42)));
        assert_eq!(a.grid, b.grid);
        for day in days {
            for p in 2..=5 {
                assert!(cell(&a.grid, day, p).subject_id.is_some());
            }
        }
    }

    #[test]
    fn subject_order_parse() {
        assert_eq!(SubjectOrder::parse("Shuffle"), Some(SubjectOrder::Shuffle));
        assert_eq!(SubjectOrder::parse("balanced"), Some(SubjectOrder::Balanced));
        assert_eq!(SubjectOrder::parse("random"), None);
    }
}
