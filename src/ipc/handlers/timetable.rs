use crate::conflicts::{check_cell_edit, find_double_bookings, ConflictError, Occupancy};
use crate::db;
use crate::generator::{generate_class_grid, rng_for, GenerateInput, GenerationOutcome, SubjectOrder};
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup::{load_schedule, load_subject_order, teaching_periods};
use crate::ipc::helpers::{
    get_optional_str, get_required_date, get_required_day, get_required_period, get_required_str,
    to_json, with_session,
};
use crate::ipc::types::{AppState, Request, Session};
use crate::model::{
    grid_cell_count, ClassGrid, ClassInfo, SubjectAllocation, Teacher, Timetable, TimetableCell,
    Weekday, HOMEROOM_PERIOD,
};
use crate::schedule::ScheduleSettings;
use crate::substitution::effective_day;
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Map, Value};
use std::collections::HashSet;

struct SchoolData {
    settings: ScheduleSettings,
    periods: Vec<u32>,
    teachers: Vec<Teacher>,
    allocations: Vec<SubjectAllocation>,
    timetable: Timetable,
}

fn load_school_data(s: &Session) -> Result<SchoolData, HandlerErr> {
    let settings = load_schedule(s)?;
    let periods = teaching_periods(&settings)?;
    let teachers =
        db::list_teachers(&s.db, &s.school_id).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let allocations = db::list_allocations(&s.db, &s.school_id, None)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .into_iter()
        .map(|(_, a)| a)
        .collect();
    let timetable =
        db::load_timetable(&s.db, &s.school_id).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(SchoolData {
        settings,
        periods,
        teachers,
        allocations,
        timetable,
    })
}

fn require_class(s: &Session, class_id: &str) -> Result<ClassInfo, HandlerErr> {
    db::get_class(&s.db, &s.school_id, class_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("class not found"))
}

fn cell_json(cell: &TimetableCell) -> Value {
    json!({
        "subjectId": cell.subject_id,
        "subjectName": cell.subject_name,
        "teacherId": cell.teacher_id,
        "teacherName": cell.teacher_name,
        "room": cell.room
    })
}

/// Drops cells outside the current working days and teaching periods. They
/// linger after a schedule change until the class is regenerated. Returns
/// the trimmed grid and how many cells were dropped.
fn fit_to_schedule(mut grid: ClassGrid, working_days: &[Weekday], periods: &[u32]) -> (ClassGrid, usize) {
    let stored = grid_cell_count(&grid);
    grid.retain(|day, _| working_days.contains(day));
    for cells in grid.values_mut() {
        cells.retain(|period_id, _| periods.contains(period_id));
    }
    grid.retain(|_, cells| !cells.is_empty());
    let stale = stored - grid_cell_count(&grid);
    (grid, stale)
}

/// `{ "Monday": { "1": cell, ... }, ... }`
fn grid_json(grid: &ClassGrid) -> Value {
    let mut days = Map::new();
    for (day, periods) in grid {
        let mut cells = Map::new();
        for (period_id, cell) in periods {
            cells.insert(period_id.to_string(), cell_json(cell));
        }
        days.insert(day.as_str().to_string(), Value::Object(cells));
    }
    Value::Object(days)
}

fn parse_order(s: &Session, params: &Value) -> Result<SubjectOrder, HandlerErr> {
    match get_optional_str(params, "subjectOrder")? {
        Some(raw) => SubjectOrder::parse(&raw).ok_or_else(|| {
            HandlerErr::bad_params("subjectOrder must be one of: balanced, shuffle")
        }),
        None => load_subject_order(s),
    }
}

fn parse_seed(params: &Value) -> Result<Option<u64>, HandlerErr> {
    match params.get("seed") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params("seed must be a non-negative integer")),
    }
}

fn generate_for<R: Rng>(
    s: &Session,
    data: &SchoolData,
    class: &ClassInfo,
    order: SubjectOrder,
    occupancy: &mut Occupancy,
    rng: &mut R,
) -> Result<GenerationOutcome, HandlerErr> {
    let subjects = db::subjects_pool_for_class(&s.db, &s.school_id, &class.id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let homeroom = class
        .class_teacher_id
        .as_deref()
        .and_then(|id| data.teachers.iter().find(|t| t.id == id));
    let input = GenerateInput {
        class_id: &class.id,
        working_days: &data.settings.working_days,
        periods: &data.periods,
        subjects_pool: &subjects,
        teacher_pool: &data.teachers,
        allocations: &data.allocations,
        homeroom_teacher: homeroom,
        order,
    };
    Ok(generate_class_grid(&input, occupancy, rng))
}

/// Replaces the stored grid wholesale; no cell of the old grid survives.
fn persist_grid(
    conn: &Connection,
    school_id: &str,
    class_id: &str,
    grid: &ClassGrid,
    order: SubjectOrder,
    now: &str,
) -> Result<(), HandlerErr> {
    conn.execute(
        "DELETE FROM timetable_cells WHERE school_id = ? AND class_id = ?",
        (school_id, class_id),
    )
    .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    for (day, periods) in grid {
        for (period_id, cell) in periods {
            db::insert_cell(conn, school_id, class_id, *day, *period_id, cell, now).map_err(|e| {
                HandlerErr::db("db_insert_failed", e)
                    .with_details(json!({ "table": "timetable_cells" }))
            })?;
        }
    }
    conn.execute(
        "INSERT INTO timetable_meta(class_id, school_id, generated_at, subject_order)
         VALUES(?, ?, ?, ?)
         ON CONFLICT(class_id) DO UPDATE SET
           generated_at = excluded.generated_at,
           subject_order = excluded.subject_order",
        (class_id, school_id, now, order.as_str()),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(())
}

fn timetable_open(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let class = require_class(s, &class_id)?;
    let settings = load_schedule(s)?;
    let periods = teaching_periods(&settings)?;
    let stored = db::load_class_grid(&s.db, &s.school_id, &class_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let (grid, stale) = fit_to_schedule(stored, &settings.working_days, &periods);
    if stale > 0 {
        tracing::debug!(class_id = %class_id, stale, "hiding cells outside the current schedule");
    }
    let meta: Option<(String, String)> = s
        .db
        .query_row(
            "SELECT generated_at, subject_order FROM timetable_meta
             WHERE school_id = ? AND class_id = ?",
            (&s.school_id, &class_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    Ok(json!({
        "classId": class.id,
        "className": class.name,
        "section": class.section,
        "classTeacherId": class.class_teacher_id,
        "workingDays": settings.working_days.iter().map(|d| d.as_str()).collect::<Vec<_>>(),
        "periods": periods,
        "grid": grid_json(&grid),
        "cellCount": grid_cell_count(&grid),
        "staleCellCount": stale,
        "generatedAt": meta.as_ref().map(|m| m.0.clone()),
        "subjectOrder": meta.map(|m| m.1)
    }))
}

fn timetable_generate(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let class = require_class(s, &class_id)?;
    let order = parse_order(s, params)?;
    let seed = parse_seed(params)?;
    let data = load_school_data(s)?;

    let mut occupancy = Occupancy::from_timetable(&data.timetable, Some(&class_id));
    let mut rng = rng_for(seed);
    let outcome = generate_for(s, &data, &class, order, &mut occupancy, &mut rng)?;

    let now = db::now_rfc3339();
    let tx = s
        .db
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    // On a failed write the caller still gets the computed grid to keep locally.
    let keep_grid = |e: HandlerErr| e.with_details(json!({ "grid": grid_json(&outcome.grid) }));
    persist_grid(&tx, &s.school_id, &class_id, &outcome.grid, order, &now).map_err(keep_grid)?;
    tx.commit()
        .map_err(|e| keep_grid(HandlerErr::db("db_commit_failed", e)))?;

    tracing::info!(
        school_id = %s.school_id,
        class_id = %class_id,
        order = order.as_str(),
        cells = grid_cell_count(&outcome.grid),
        warnings = outcome.warnings.len(),
        "timetable generated"
    );
    Ok(json!({
        "classId": class_id,
        "subjectOrder": order.as_str(),
        "grid": grid_json(&outcome.grid),
        "cellCount": grid_cell_count(&outcome.grid),
        "warnings": to_json(&outcome.warnings)?
    }))
}

/// Regenerates several classes in name order. Each class sees the grids
/// produced before it in the same run.
fn timetable_generate_all(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let order = parse_order(s, params)?;
    let seed = parse_seed(params)?;
    let all_classes =
        db::list_classes(&s.db, &s.school_id).map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let classes: Vec<ClassInfo> = match params.get("classIds") {
        None | Some(Value::Null) => all_classes,
        Some(Value::Array(ids)) => {
            let mut wanted: HashSet<String> = HashSet::new();
            for v in ids {
                let Some(id) = v.as_str() else {
                    return Err(HandlerErr::bad_params("classIds must be strings"));
                };
                if !all_classes.iter().any(|c| c.id == id) {
                    return Err(HandlerErr::not_found(format!("class not found: {}", id))
                        .with_details(json!({ "classId": id })));
                }
                wanted.insert(id.to_string());
            }
            all_classes
                .into_iter()
                .filter(|c| wanted.contains(&c.id))
                .collect()
        }
        Some(_) => return Err(HandlerErr::bad_params("classIds must be an array")),
    };

    let data = load_school_data(s)?;
    let targets: HashSet<&str> = classes.iter().map(|c| c.id.as_str()).collect();
    let mut occupancy = Occupancy::default();
    for (class_id, grid) in &data.timetable {
        if !targets.contains(class_id.as_str()) {
            occupancy.book_grid(class_id, grid);
        }
    }

    let mut rng = rng_for(seed);
    let mut generated: Vec<(&ClassInfo, GenerationOutcome)> = Vec::with_capacity(classes.len());
    for class in &classes {
        let outcome = generate_for(s, &data, class, order, &mut occupancy, &mut rng)?;
        generated.push((class, outcome));
    }

    let mut merged: Timetable = data
        .timetable
        .iter()
        .filter(|(id, _)| !targets.contains(id.as_str()))
        .map(|(id, grid)| (id.clone(), grid.clone()))
        .collect();
    for (class, outcome) in &generated {
        merged.insert(class.id.clone(), outcome.grid.clone());
    }
    // Homeroom clashes are assigned anyway and reported as warnings.
    let clashes: Vec<_> = find_double_bookings(&merged)
        .into_iter()
        .filter(|(_, _, period_id, _)| *period_id != HOMEROOM_PERIOD)
        .collect();
    if !clashes.is_empty() {
        let details: Vec<Value> = clashes
            .iter()
            .map(|(teacher_id, day, period_id, class_ids)| {
                json!({
                    "teacherId": teacher_id,
                    "day": day.as_str(),
                    "periodId": period_id,
                    "classIds": class_ids
                })
            })
            .collect();
        tracing::error!(clashes = clashes.len(), "generated timetables double-book teachers");
        return Err(HandlerErr::new(
            "teacher_conflict",
            "generated timetables double-book teachers",
        )
        .with_details(json!({ "clashes": details })));
    }

    let now = db::now_rfc3339();
    let tx = s
        .db
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    for (class, outcome) in &generated {
        persist_grid(&tx, &s.school_id, &class.id, &outcome.grid, order, &now)?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;

    let mut rows = Vec::with_capacity(generated.len());
    for (class, outcome) in &generated {
        rows.push(json!({
            "classId": class.id,
            "className": class.name,
            "cellCount": grid_cell_count(&outcome.grid),
            "warnings": to_json(&outcome.warnings)?
        }));
    }
    tracing::info!(
        school_id = %s.school_id,
        classes = rows.len(),
        booked = occupancy.slot_count(),
        "timetables generated"
    );
    Ok(json!({
        "subjectOrder": order.as_str(),
        "classes": rows,
        "bookedSlots": occupancy.slot_count()
    }))
}

fn timetable_cell_upsert(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let day = get_required_day(params, "day")?;
    let period_id = get_required_period(params, "periodId")?;
    let subject_id = get_required_str(params, "subjectId")?;
    let teacher_id = get_optional_str(params, "teacherId")?;
    let room = get_optional_str(params, "room")?;

    require_class(s, &class_id)?;
    let settings = load_schedule(s)?;
    if !settings.working_days.contains(&day) {
        return Err(HandlerErr::bad_params(format!(
            "{} is not a working day",
            day.as_str()
        )));
    }
    if !teaching_periods(&settings)?.contains(&period_id) {
        return Err(HandlerErr::bad_params("periodId is not a teaching period"));
    }
    let subject = db::get_subject(&s.db, &s.school_id, &subject_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .ok_or_else(|| HandlerErr::not_found("subject not found"))?;
    let teacher = match teacher_id.as_deref() {
        Some(id) => Some(
            db::get_teacher(&s.db, &s.school_id, id)
                .map_err(|e| HandlerErr::db("db_query_failed", e))?
                .ok_or_else(|| HandlerErr::not_found("teacher not found"))?,
        ),
        None => None,
    };

    if let Some(t) = &teacher {
        let timetable = db::load_timetable(&s.db, &s.school_id)
            .map_err(|e| HandlerErr::db("db_query_failed", e))?;
        let occupancy = Occupancy::from_timetable(&timetable, Some(&class_id));
        if let Err(ConflictError::TeacherBusy {
            class_id: other, ..
        }) = check_cell_edit(&occupancy, &class_id, &t.id, day, period_id)
        {
            let other_name = db::get_class(&s.db, &s.school_id, &other)
                .ok()
                .flatten()
                .map(|c| c.name);
            tracing::warn!(
                class_id = %class_id,
                teacher_id = %t.id,
                other_class_id = %other,
                day = day.as_str(),
                period_id,
                "rejected double booking"
            );
            return Err(HandlerErr::new(
                "teacher_conflict",
                format!(
                    "{} is already teaching {} on {} period {}",
                    t.name,
                    other_name.as_deref().unwrap_or(&other),
                    day.as_str(),
                    period_id
                ),
            )
            .with_details(json!({
                "teacherId": t.id,
                "classId": other,
                "className": other_name,
                "day": day.as_str(),
                "periodId": period_id
            })));
        }
    }

    let cell = TimetableCell {
        subject_id: Some(subject.id),
        subject_name: Some(subject.name),
        teacher_id: teacher.as_ref().map(|t| t.id.clone()),
        teacher_name: teacher.map(|t| t.name),
        room,
    };
    db::insert_cell(
        &s.db,
        &s.school_id,
        &class_id,
        day,
        period_id,
        &cell,
        &db::now_rfc3339(),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e).with_details(json!({ "table": "timetable_cells" })))?;
    Ok(json!({ "ok": true, "cell": cell_json(&cell) }))
}

fn timetable_cell_delete(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let day = get_required_day(params, "day")?;
    let period_id = get_required_period(params, "periodId")?;
    require_class(s, &class_id)?;
    let n = s
        .db
        .execute(
            "DELETE FROM timetable_cells
             WHERE school_id = ? AND class_id = ? AND day = ? AND period_id = ?",
            (&s.school_id, &class_id, day.as_str(), period_id),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("cell not found"));
    }
    Ok(json!({ "ok": true }))
}

fn timetable_clear(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    require_class(s, &class_id)?;
    let tx = s
        .db
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    let n = tx
        .execute(
            "DELETE FROM timetable_cells WHERE school_id = ? AND class_id = ?",
            (&s.school_id, &class_id),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.execute(
        "DELETE FROM timetable_meta WHERE school_id = ? AND class_id = ?",
        (&s.school_id, &class_id),
    )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true, "deleted": n }))
}

fn timetable_day_view(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_date(params, "date")?;
    require_class(s, &class_id)?;
    let settings = load_schedule(s)?;
    let periods = teaching_periods(&settings)?;
    let stored = db::load_class_grid(&s.db, &s.school_id, &class_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let (grid, _) = fit_to_schedule(stored, &settings.working_days, &periods);
    let subs = db::list_substitutions(&s.db, &s.school_id, Some(class_id.as_str()), Some(date))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    let Some((day, cells)) = effective_day(&grid, date, &settings.working_days, &subs) else {
        return Err(HandlerErr::bad_params(format!("{} is not a working day", date)));
    };
    let mut rows = Vec::with_capacity(cells.len());
    for (period_id, cell) in cells.iter().filter(|(p, _)| periods.contains(*p)) {
        let mut v = to_json(cell)?;
        v["periodId"] = json!(period_id);
        rows.push(v);
    }
    Ok(json!({
        "classId": class_id,
        "date": date.format("%Y-%m-%d").to_string(),
        "day": day.as_str(),
        "periods": rows
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Session, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "timetable.open" => timetable_open,
        "timetable.generate" => timetable_generate,
        "timetable.generateAll" => timetable_generate_all,
        "timetable.cellUpsert" => timetable_cell_upsert,
        "timetable.cellDelete" => timetable_cell_delete,
        "timetable.clear" => timetable_clear,
        "timetable.dayView" => timetable_day_view,
        _ => return None,
    };
    Some(with_session(state, req, f))
}
