use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_str, get_required_str, with_session};
use crate::ipc::types::{AppState, Request, Session};
use serde_json::{json, Value};
use uuid::Uuid;

fn allocations_list(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_optional_str(params, "classId")?;
    let teacher_id = get_optional_str(params, "teacherId")?;
    let rows = db::list_allocations(&s.db, &s.school_id, class_id.as_deref())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let out: Vec<Value> = rows
        .into_iter()
        .filter(|(_, a)| teacher_id.as_deref().map_or(true, |t| a.teacher_id == t))
        .map(|(id, a)| {
            json!({
                "id": id,
                "teacherId": a.teacher_id,
                "classId": a.class_id,
                "subjectId": a.subject_id,
                "subjectName": a.subject_name
            })
        })
        .collect();
    Ok(json!({ "allocations": out }))
}

fn allocations_create(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let class_id = get_required_str(params, "classId")?;
    let subject_id = get_required_str(params, "subjectId")?;

    if db::get_teacher(&s.db, &s.school_id, &teacher_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    if db::get_class(&s.db, &s.school_id, &class_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::not_found("class not found"));
    }
    let Some(subject) = db::get_subject(&s.db, &s.school_id, &subject_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
    else {
        return Err(HandlerErr::not_found("subject not found"));
    };

    let existing: Option<String> = db::list_allocations(&s.db, &s.school_id, Some(class_id.as_str()))
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .into_iter()
        .find(|(_, a)| a.teacher_id == teacher_id && a.subject_id == subject_id)
        .map(|(id, _)| id);
    if let Some(id) = existing {
        return Ok(json!({ "allocationId": id, "created": false }));
    }

    let id = Uuid::new_v4().to_string();
    s.db.execute(
        "INSERT INTO subject_allocations(id, school_id, teacher_id, class_id, subject_id, subject_name)
         VALUES(?, ?, ?, ?, ?, ?)",
        (&id, &s.school_id, &teacher_id, &class_id, &subject_id, &subject.name),
    )
    .map_err(|e| {
        HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "subject_allocations" }))
    })?;
    Ok(json!({ "allocationId": id, "created": true }))
}

fn allocations_delete(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let id = get_required_str(params, "allocationId")?;
    let n = s
        .db
        .execute(
            "DELETE FROM subject_allocations WHERE school_id = ? AND id = ?",
            (&s.school_id, &id),
        )
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    if n == 0 {
        return Err(HandlerErr::not_found("allocation not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Session, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "allocations.list" => allocations_list,
        "allocations.create" => allocations_create,
        "allocations.delete" => allocations_delete,
        _ => return None,
    };
    Some(with_session(state, req, f))
}
