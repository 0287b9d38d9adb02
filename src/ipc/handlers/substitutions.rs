use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::setup::{load_schedule, teaching_periods};
use crate::ipc::helpers::{
    get_optional_date, get_optional_str, get_required_date, get_required_period, get_required_str,
    to_json, with_session,
};
use crate::ipc::types::{AppState, Request, Session};
use crate::substitution::{validate_substitution, SubstitutionError, SubstitutionRequest};
use serde_json::{json, Value};
use uuid::Uuid;

fn substitution_err(e: SubstitutionError) -> HandlerErr {
    let msg = e.to_string();
    match e {
        SubstitutionError::NotWorkingDay(_) => HandlerErr::bad_params(msg),
        SubstitutionError::SameAsRegular => HandlerErr::new("same_as_regular", msg),
        SubstitutionError::RegularConflict { class_id } => HandlerErr::new("teacher_conflict", msg)
            .with_details(json!({ "classId": class_id, "source": "timetable" })),
        SubstitutionError::SubstitutionConflict { class_id } => {
            HandlerErr::new("teacher_conflict", msg)
                .with_details(json!({ "classId": class_id, "source": "substitution" }))
        }
    }
}

fn substitutions_create(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let date = get_required_date(params, "date")?;
    let period_id = get_required_period(params, "periodId")?;
    let teacher_id = get_required_str(params, "substituteTeacherId")?;
    let reason = get_optional_str(params, "reason")?;

    if db::get_class(&s.db, &s.school_id, &class_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::not_found("class not found"));
    }
    let Some(teacher) = db::get_teacher(&s.db, &s.school_id, &teacher_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
    else {
        return Err(HandlerErr::not_found("teacher not found"));
    };
    let settings = load_schedule(s)?;
    if !teaching_periods(&settings)?.contains(&period_id) {
        return Err(HandlerErr::bad_params("periodId is not a teaching period"));
    }

    let timetable =
        db::load_timetable(&s.db, &s.school_id).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let existing = db::list_substitutions(&s.db, &s.school_id, None, Some(date))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let req = SubstitutionRequest {
        class_id: &class_id,
        date,
        period_id,
        substitute_teacher_id: &teacher.id,
    };
    let day = validate_substitution(&req, &settings.working_days, &timetable, &existing)
        .map_err(substitution_err)?;

    // One substitution per class slot; a second request replaces the first.
    let date_key = date.format("%Y-%m-%d").to_string();
    s.db.execute(
        "INSERT INTO substitutions(id, school_id, class_id, date, period_id, substitute_teacher_id, reason, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(class_id, date, period_id) DO UPDATE SET
           substitute_teacher_id = excluded.substitute_teacher_id,
           reason = excluded.reason,
           created_at = excluded.created_at",
        (
            Uuid::new_v4().to_string(),
            &s.school_id,
            &class_id,
            &date_key,
            period_id,
            &teacher.id,
            &reason,
            db::now_rfc3339(),
        ),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "substitutions" })))?;
    let id: String = s
        .db
        .query_row(
            "SELECT id FROM substitutions WHERE class_id = ? AND date = ? AND period_id = ?",
            (&class_id, &date_key, period_id),
            |r| r.get(0),
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;

    tracing::info!(
        class_id = %class_id,
        date = %date_key,
        period_id,
        teacher_id = %teacher.id,
        "substitution recorded"
    );
    Ok(json!({
        "substitutionId": id,
        "day": day.as_str(),
        "substituteTeacherName": teacher.name
    }))
}

fn substitutions_list(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_optional_str(params, "classId")?;
    let date = get_optional_date(params, "date")?;
    let rows = db::list_substitutions(&s.db, &s.school_id, class_id.as_deref(), date)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "substitutions": to_json(&rows)? }))
}

fn substitutions_delete(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "substitutionId")?;
    let n = s
        .db
        .execute(
            "DELETE FROM substitutions WHERE school_id = ? AND id = ?",
            (&s.school_id, &id),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("substitution not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Session, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "substitutions.create" => substitutions_create,
        "substitutions.list" => substitutions_list,
        "substitutions.delete" => substitutions_delete,
        _ => return None,
    };
    Some(with_session(state, req, f))
}
