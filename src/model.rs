use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const HOMEROOM_PERIOD: u32 = 1;
pub const HOMEROOM_SUBJECT: &str = "Homeroom";
pub const NOT_ASSIGNED: &str = "Not Assigned";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
}

impl Weekday {
    pub const ALL: [Weekday; 6] = [
        Weekday::Monday,
        Weekday::Tuesday,
        Weekday::Wednesday,
        Weekday::Thursday,
        Weekday::Friday,
        Weekday::Saturday,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Weekday::Monday => "Monday",
            Weekday::Tuesday => "Tuesday",
            Weekday::Wednesday => "Wednesday",
            Weekday::Thursday => "Thursday",
            Weekday::Friday => "Friday",
            Weekday::Saturday => "Saturday",
        }
    }

    /// Accepts full names and three-letter abbreviations, any case.
    pub fn parse(s: &str) -> Option<Self> {
        let t = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|d| {
            let name = d.as_str().to_ascii_lowercase();
            t == name || (t.len() == 3 && name.starts_with(&t))
        })
    }

    /// Sunday has no counterpart; schools here never teach on Sundays.
    pub fn from_chrono(d: chrono::Weekday) -> Option<Self> {
        match d {
            chrono::Weekday::Mon => Some(Weekday::Monday),
            chrono::Weekday::Tue => Some(Weekday::Tuesday),
            chrono::Weekday::Wed => Some(Weekday::Wednesday),
            chrono::Weekday::Thu => Some(Weekday::Thursday),
            chrono::Weekday::Fri => Some(Weekday::Friday),
            chrono::Weekday::Sat => Some(Weekday::Saturday),
            chrono::Weekday::Sun => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subject {
    pub id: String,
    pub name: String,
    pub localized_name: Option<String>,
    /// Only set when the subject comes from a class's explicit subject list.
    pub periods_per_week: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectAllocation {
    pub teacher_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub subject_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassInfo {
    pub id: String,
    pub name: String,
    pub section: Option<String>,
    pub class_teacher_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimetableCell {
    pub subject_id: Option<String>,
    pub subject_name: Option<String>,
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
    pub room: Option<String>,
}

impl TimetableCell {
    pub fn homeroom(teacher: Option<&Teacher>) -> Self {
        TimetableCell {
            subject_id: None,
            subject_name: Some(HOMEROOM_SUBJECT.to_string()),
            teacher_id: teacher.map(|t| t.id.clone()),
            teacher_name: Some(
                teacher
                    .map(|t| t.name.clone())
                    .unwrap_or_else(|| NOT_ASSIGNED.to_string()),
            ),
            room: None,
        }
    }
}

/// One class's weekly grid: day -> period id -> cell.
pub type ClassGrid = BTreeMap<Weekday, BTreeMap<u32, TimetableCell>>;

/// All grids of a school: class id -> grid.
pub type Timetable = BTreeMap<String, ClassGrid>;

pub fn grid_cell_count(grid: &ClassGrid) -> usize {
    grid.values().map(|d| d.len()).sum()
}
