use crate::model::Weekday;
use chrono::{Duration, NaiveTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleSettings {
    pub start_time: String,
    pub period_minutes: u32,
    pub periods_per_day: u32,
    /// Period 1 is the homeroom period and usually runs longer for attendance.
    pub homeroom_minutes: u32,
    pub break_after_period: Option<u32>,
    pub break_minutes: u32,
    pub lunch_after_period: Option<u32>,
    pub lunch_minutes: u32,
    pub working_days: Vec<Weekday>,
}

impl Default for ScheduleSettings {
    fn default() -> Self {
        ScheduleSettings {
            start_time: "08:00".to_string(),
            period_minutes: 40,
            periods_per_day: 8,
            homeroom_minutes: 50,
            break_after_period: Some(3),
            break_minutes: 15,
            lunch_after_period: Some(5),
            lunch_minutes: 30,
            working_days: Weekday::ALL[..5].to_vec(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("startTime must be HH:MM")]
    BadStartTime,
    #[error("{field} must be in {min}..={max}")]
    OutOfRange {
        field: &'static str,
        min: u32,
        max: u32,
    },
    #[error("school day runs past midnight")]
    DayOverflow,
    #[error("workingDays must not be empty")]
    NoWorkingDays,
    #[error("workingDays lists {0} more than once")]
    DuplicateDay(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SlotKind {
    Teaching,
    Break,
    Lunch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeriodSlot {
    pub kind: SlotKind,
    /// Sequential 1..N for teaching periods, `None` for break windows.
    pub period_id: Option<u32>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl PeriodSlot {
    pub fn label(&self) -> String {
        match (self.kind, self.period_id) {
            (SlotKind::Teaching, Some(1)) => "Period 1 (Homeroom)".to_string(),
            (SlotKind::Teaching, Some(id)) => format!("Period {}", id),
            (SlotKind::Lunch, _) => "Lunch".to_string(),
            _ => "Break".to_string(),
        }
    }
}

fn check_range(field: &'static str, v: u32, min: u32, max: u32) -> Result<(), ScheduleError> {
    if (min..=max).contains(&v) {
        Ok(())
    } else {
        Err(ScheduleError::OutOfRange { field, min, max })
    }
}

impl ScheduleSettings {
    pub fn parse_start_time(&self) -> Result<NaiveTime, ScheduleError> {
        NaiveTime::parse_from_str(self.start_time.trim(), "%H:%M")
            .map_err(|_| ScheduleError::BadStartTime)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        self.parse_start_time()?;
        check_range("periodsPerDay", self.periods_per_day, 1, 12)?;
        check_range("periodMinutes", self.period_minutes, 1, 180)?;
        check_range("homeroomMinutes", self.homeroom_minutes, 1, 180)?;
        check_range("breakMinutes", self.break_minutes, 0, 120)?;
        check_range("lunchMinutes", self.lunch_minutes, 0, 180)?;
        if let Some(p) = self.break_after_period {
            check_range("breakAfterPeriod", p, 1, self.periods_per_day)?;
        }
        if let Some(p) = self.lunch_after_period {
            check_range("lunchAfterPeriod", p, 1, self.periods_per_day)?;
        }
        if self.working_days.is_empty() {
            return Err(ScheduleError::NoWorkingDays);
        }
        for (i, d) in self.working_days.iter().enumerate() {
            if self.working_days[..i].contains(d) {
                return Err(ScheduleError::DuplicateDay(d.as_str()));
            }
        }
        Ok(())
    }
}

fn advance(t: NaiveTime, minutes: u32) -> Result<NaiveTime, ScheduleError> {
    let (next, wrapped) = t.overflowing_add_signed(Duration::minutes(i64::from(minutes)));
    if wrapped != 0 {
        return Err(ScheduleError::DayOverflow);
    }
    Ok(next)
}

/// Lays out the school day. A break or lunch configured after the last
/// period is dropped since nothing follows it.
pub fn compute_slots(settings: &ScheduleSettings) -> Result<Vec<PeriodSlot>, ScheduleError> {
    settings.validate()?;
    let mut t = settings.parse_start_time()?;
    let mut out = Vec::new();
    let n = settings.periods_per_day;

    for id in 1..=n {
        let minutes = if id == 1 {
            settings.homeroom_minutes
        } else {
            settings.period_minutes
        };
        let end = advance(t, minutes)?;
        out.push(PeriodSlot {
            kind: SlotKind::Teaching,
            period_id: Some(id),
            start: t,
            end,
        });
        t = end;
        if id == n {
            break;
        }
        for (after, minutes, kind) in [
            (settings.break_after_period, settings.break_minutes, SlotKind::Break),
            (settings.lunch_after_period, settings.lunch_minutes, SlotKind::Lunch),
        ] {
            if after == Some(id) && minutes > 0 {
                let end = advance(t, minutes)?;
                out.push(PeriodSlot {
                    kind,
                    period_id: None,
                    start: t,
                    end,
                });
                t = end;
            }
        }
    }
    Ok(out)
}

pub fn teaching_period_ids(slots: &[PeriodSlot]) -> Vec<u32> {
    slots
        .iter()
        .filter(|s| s.kind == SlotKind::Teaching)
        .filter_map(|s| s.period_id)
        .collect()
}
