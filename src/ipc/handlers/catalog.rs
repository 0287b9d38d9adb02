use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_str, get_required_str, to_json, with_session};
use crate::ipc::types::{AppState, Request, Session};
use crate::model::{HOMEROOM_PERIOD, HOMEROOM_SUBJECT, NOT_ASSIGNED};
use serde_json::{json, Value};
use uuid::Uuid;

fn subjects_list(s: &Session, _params: &Value) -> Result<Value, HandlerErr> {
    let subjects =
        db::list_subjects(&s.db, &s.school_id).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "subjects": to_json(&subjects)? }))
}

fn subjects_create(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let localized = get_optional_str(params, "localizedName")?;
    let id = Uuid::new_v4().to_string();
    s.db.execute(
        "INSERT INTO subjects(id, school_id, name, localized_name) VALUES(?, ?, ?, ?)",
        (&id, &s.school_id, &name, &localized),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "subjects" })))?;
    Ok(json!({ "subjectId": id, "name": name }))
}

fn subjects_update(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    let Some(current) = db::get_subject(&s.db, &s.school_id, &subject_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
    else {
        return Err(HandlerErr::not_found("subject not found"));
    };
    let name = match params.get("name") {
        Some(_) => get_required_str(params, "name")?,
        None => current.name,
    };
    let localized = if params.get("localizedName").is_some() {
        get_optional_str(params, "localizedName")?
    } else {
        current.localized_name
    };

    let tx = s
        .db
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "UPDATE subjects SET name = ?, localized_name = ? WHERE id = ?",
        (&name, &localized, &subject_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    // Cells and allocations cache the display name.
    tx.execute(
        "UPDATE timetable_cells SET subject_name = ? WHERE school_id = ? AND subject_id = ?",
        (&name, &s.school_id, &subject_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.execute(
        "UPDATE subject_allocations SET subject_name = ? WHERE school_id = ? AND subject_id = ?",
        (&name, &s.school_id, &subject_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn subjects_delete(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let subject_id = get_required_str(params, "subjectId")?;
    if db::get_subject(&s.db, &s.school_id, &subject_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::not_found("subject not found"));
    }
    let tx = s
        .db
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    // Explicit dependency order, no ON DELETE CASCADE.
    for sql in [
        "DELETE FROM class_subjects WHERE subject_id = ?1",
        "DELETE FROM subject_allocations WHERE subject_id = ?1",
        "UPDATE timetable_cells SET subject_id = NULL, subject_name = NULL WHERE subject_id = ?1",
        "DELETE FROM subjects WHERE id = ?1",
    ] {
        tx.execute(sql, [&subject_id])
            .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn teachers_list(s: &Session, _params: &Value) -> Result<Value, HandlerErr> {
    let teachers =
        db::list_teachers(&s.db, &s.school_id).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let allocations = db::list_allocations(&s.db, &s.school_id, None)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows: Vec<Value> = teachers
        .iter()
        .map(|t| {
            let count = allocations
                .iter()
                .filter(|(_, a)| a.teacher_id == t.id)
                .count();
            json!({ "id": t.id, "name": t.name, "allocationCount": count })
        })
        .collect();
    Ok(json!({ "teachers": rows }))
}

fn teachers_create(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let id = Uuid::new_v4().to_string();
    s.db.execute(
        "INSERT INTO teachers(id, school_id, name) VALUES(?, ?, ?)",
        (&id, &s.school_id, &name),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "teachers" })))?;
    Ok(json!({ "teacherId": id, "name": name }))
}

fn teachers_update(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    let name = get_required_str(params, "name")?;
    if db::get_teacher(&s.db, &s.school_id, &teacher_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    let tx = s
        .db
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute(
        "UPDATE teachers SET name = ? WHERE id = ?",
        (&name, &teacher_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.execute(
        "UPDATE timetable_cells SET teacher_name = ? WHERE school_id = ? AND teacher_id = ?",
        (&name, &s.school_id, &teacher_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn teachers_delete(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let teacher_id = get_required_str(params, "teacherId")?;
    if db::get_teacher(&s.db, &s.school_id, &teacher_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::not_found("teacher not found"));
    }
    let tx = s
        .db
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    // Homeroom cells keep their placeholder name once the teacher is gone.
    tx.execute(
        "UPDATE timetable_cells SET teacher_id = NULL, teacher_name = ?2
         WHERE teacher_id = ?1 AND period_id = ?3 AND subject_name = ?4",
        (&teacher_id, NOT_ASSIGNED, HOMEROOM_PERIOD, HOMEROOM_SUBJECT),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    for sql in [
        "DELETE FROM subject_allocations WHERE teacher_id = ?1",
        "DELETE FROM substitutions WHERE substitute_teacher_id = ?1",
        "UPDATE classes SET class_teacher_id = NULL WHERE class_teacher_id = ?1",
        "UPDATE timetable_cells SET teacher_id = NULL, teacher_name = NULL WHERE teacher_id = ?1",
        "DELETE FROM teachers WHERE id = ?1",
    ] {
        tx.execute(sql, [&teacher_id])
            .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    tracing::info!(teacher_id = %teacher_id, "teacher deleted, cells left unstaffed");
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Session, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "subjects.list" => subjects_list,
        "subjects.create" => subjects_create,
        "subjects.update" => subjects_update,
        "subjects.delete" => subjects_delete,
        "teachers.list" => teachers_list,
        "teachers.create" => teachers_create,
        "teachers.update" => teachers_update,
        "teachers.delete" => teachers_delete,
        _ => return None,
    };
    Some(with_session(state, req, f))
}
