use crate::db;
use crate::generator::SubjectOrder;
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::helpers::with_session;
use crate::ipc::types::{AppState, Request, Session};
use crate::model::Weekday;
use crate::schedule::{compute_slots, ScheduleSettings, SlotKind};
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Schedule,
    Generator,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "schedule" => Some(Self::Schedule),
            "generator" => Some(Self::Generator),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Schedule => "setup.schedule",
            Self::Generator => "setup.generator",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Schedule => {
            serde_json::to_value(ScheduleSettings::default()).unwrap_or_else(|_| json!({}))
        }
        SetupSection::Generator => json!({
            "subjectOrder": SubjectOrder::default().as_str()
        }),
    }
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_nullable_period(v: &Value, key: &str) -> Result<Value, String> {
    if v.is_null() {
        return Ok(Value::Null);
    }
    Ok(Value::from(parse_i64_range(v, key, 1, 12)?))
}

fn parse_working_days(v: &Value) -> Result<Value, String> {
    let arr = v
        .as_array()
        .ok_or_else(|| "workingDays must be an array".to_string())?;
    let mut days: Vec<Weekday> = Vec::with_capacity(arr.len());
    for item in arr {
        let day = item
            .as_str()
            .and_then(Weekday::parse)
            .ok_or_else(|| "workingDays entries must be Monday..Saturday".to_string())?;
        if days.contains(&day) {
            return Err(format!("workingDays lists {} more than once", day.as_str()));
        }
        days.push(day);
    }
    if days.is_empty() {
        return Err("workingDays must not be empty".into());
    }
    days.sort();
    Ok(Value::from(
        days.iter().map(|d| d.as_str()).collect::<Vec<_>>(),
    ))
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = current
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())?;
    for (k, v) in patch {
        match section {
            SetupSection::Schedule => match k.as_str() {
                "startTime" => {
                    let s = v.as_str().ok_or("startTime must be string")?.trim();
                    if chrono::NaiveTime::parse_from_str(s, "%H:%M").is_err() {
                        return Err("startTime must be HH:MM".into());
                    }
                    obj.insert(k.clone(), Value::String(s.to_string()));
                }
                "periodMinutes" | "homeroomMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 180)?));
                }
                "periodsPerDay" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 12)?));
                }
                "breakMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 120)?));
                }
                "lunchMinutes" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 0, 180)?));
                }
                "breakAfterPeriod" | "lunchAfterPeriod" => {
                    obj.insert(k.clone(), parse_nullable_period(v, k)?);
                }
                "workingDays" => {
                    obj.insert(k.clone(), parse_working_days(v)?);
                }
                _ => return Err(format!("unknown schedule field: {}", k)),
            },
            SetupSection::Generator => match k.as_str() {
                "subjectOrder" => {
                    let order = v
                        .as_str()
                        .and_then(SubjectOrder::parse)
                        .ok_or("subjectOrder must be one of: balanced, shuffle")?;
                    obj.insert(k.clone(), Value::String(order.as_str().to_string()));
                }
                _ => return Err(format!("unknown generator field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(
    conn: &rusqlite::Connection,
    school_id: &str,
    section: SetupSection,
) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, school_id, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: a malformed historical value must not block setup.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

pub fn load_schedule(s: &Session) -> Result<ScheduleSettings, HandlerErr> {
    let raw = load_section(&s.db, &s.school_id, SetupSection::Schedule)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let settings: ScheduleSettings = serde_json::from_value(raw)
        .map_err(|e| HandlerErr::new("bad_settings", e.to_string()))?;
    settings
        .validate()
        .map_err(|e| HandlerErr::new("bad_settings", e.to_string()))?;
    Ok(settings)
}

pub fn load_subject_order(s: &Session) -> Result<SubjectOrder, HandlerErr> {
    let raw = load_section(&s.db, &s.school_id, SetupSection::Generator)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(raw
        .get("subjectOrder")
        .and_then(|v| v.as_str())
        .and_then(SubjectOrder::parse)
        .unwrap_or_default())
}

/// Teaching period ids in day order, as the generator consumes them.
pub fn teaching_periods(settings: &ScheduleSettings) -> Result<Vec<u32>, HandlerErr> {
    let slots = compute_slots(settings).map_err(|e| HandlerErr::new("bad_settings", e.to_string()))?;
    Ok(crate::schedule::teaching_period_ids(&slots))
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(s) = state.session.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let schedule = match load_section(&s.db, &s.school_id, SetupSection::Schedule) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let generator = match load_section(&s.db, &s.school_id, SetupSection::Generator) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(
        &req.id,
        json!({
            "schedule": schedule,
            "generator": generator
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(s) = state.session.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(&s.db, &s.school_id, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    // Field checks pass individually; the combined day must still lay out.
    if let SetupSection::Schedule = section {
        let check = serde_json::from_value::<ScheduleSettings>(current.clone())
            .map_err(|e| e.to_string())
            .and_then(|settings| compute_slots(&settings).map_err(|e| e.to_string()));
        if let Err(msg) = check {
            return err(&req.id, "bad_params", msg, None);
        }
    }
    if let Err(e) = db::settings_set_json(&s.db, &s.school_id, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    tracing::info!(school_id = %s.school_id, section = section.key(), "setup updated");
    ok(&req.id, json!({ "ok": true }))
}

fn schedule_periods(s: &Session, _params: &Value) -> Result<Value, HandlerErr> {
    let settings = load_schedule(s)?;
    let slots =
        compute_slots(&settings).map_err(|e| HandlerErr::new("bad_settings", e.to_string()))?;
    let rows: Vec<Value> = slots
        .iter()
        .map(|slot| {
            json!({
                "kind": match slot.kind {
                    SlotKind::Teaching => "teaching",
                    SlotKind::Break => "break",
                    SlotKind::Lunch => "lunch",
                },
                "periodId": slot.period_id,
                "label": slot.label(),
                "start": slot.start.format("%H:%M").to_string(),
                "end": slot.end.format("%H:%M").to_string()
            })
        })
        .collect();
    Ok(json!({
        "workingDays": settings.working_days.iter().map(|d| d.as_str()).collect::<Vec<_>>(),
        "slots": rows
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        "schedule.periods" => Some(with_session(state, req, schedule_periods)),
        _ => None,
    }
}
