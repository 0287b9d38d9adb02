use crate::db;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{get_optional_str, get_required_str, to_json, with_session};
use crate::ipc::types::{AppState, Request, Session};
use serde_json::{json, Value};
use uuid::Uuid;

fn check_teacher(s: &Session, teacher_id: Option<&str>) -> Result<(), HandlerErr> {
    let Some(id) = teacher_id else {
        return Ok(());
    };
    match db::get_teacher(&s.db, &s.school_id, id) {
        Ok(Some(_)) => Ok(()),
        Ok(None) => Err(HandlerErr::not_found("class teacher not found")),
        Err(e) => Err(HandlerErr::db("db_query_failed", e)),
    }
}

fn classes_list(s: &Session, _params: &Value) -> Result<Value, HandlerErr> {
    // Correlated subqueries so the counts don't multiply through joins.
    let mut stmt = s
        .db
        .prepare(
            "SELECT
               c.id,
               c.name,
               c.section,
               c.class_teacher_id,
               t.name,
               (SELECT COUNT(*) FROM timetable_cells tc WHERE tc.class_id = c.id) AS cell_count,
               (SELECT COUNT(*) FROM class_subjects cs WHERE cs.class_id = c.id) AS subject_count
             FROM classes c
             LEFT JOIN teachers t ON t.id = c.class_teacher_id
             WHERE c.school_id = ?
             ORDER BY c.name, c.section, c.id",
        )
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let rows = stmt
        .query_map([&s.school_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let section: Option<String> = row.get(2)?;
            let class_teacher_id: Option<String> = row.get(3)?;
            let class_teacher_name: Option<String> = row.get(4)?;
            let cell_count: i64 = row.get(5)?;
            let subject_count: i64 = row.get(6)?;
            Ok(json!({
                "id": id,
                "name": name,
                "section": section,
                "classTeacherId": class_teacher_id,
                "classTeacherName": class_teacher_name,
                "cellCount": cell_count,
                "subjectCount": subject_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr::db("db_query_failed", e))?;
    Ok(json!({ "classes": rows }))
}

fn classes_create(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let name = get_required_str(params, "name")?;
    let section = get_optional_str(params, "section")?;
    let class_teacher_id = get_optional_str(params, "classTeacherId")?;
    check_teacher(s, class_teacher_id.as_deref())?;

    let class_id = Uuid::new_v4().to_string();
    s.db.execute(
        "INSERT INTO classes(id, school_id, name, section, class_teacher_id) VALUES(?, ?, ?, ?, ?)",
        (&class_id, &s.school_id, &name, &section, &class_teacher_id),
    )
    .map_err(|e| HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "classes" })))?;
    Ok(json!({ "classId": class_id, "name": name }))
}

fn classes_update(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    let Some(current) =
        db::get_class(&s.db, &s.school_id, &class_id).map_err(|e| HandlerErr::db("db_query_failed", e))?
    else {
        return Err(HandlerErr::not_found("class not found"));
    };
    let name = match params.get("name") {
        Some(_) => get_required_str(params, "name")?,
        None => current.name,
    };
    let section = if params.get("section").is_some() {
        get_optional_str(params, "section")?
    } else {
        current.section
    };
    // Explicit null clears the homeroom teacher.
    let class_teacher_id = if params.get("classTeacherId").is_some() {
        get_optional_str(params, "classTeacherId")?
    } else {
        current.class_teacher_id
    };
    check_teacher(s, class_teacher_id.as_deref())?;

    s.db.execute(
        "UPDATE classes SET name = ?, section = ?, class_teacher_id = ? WHERE id = ?",
        (&name, &section, &class_teacher_id, &class_id),
    )
    .map_err(|e| HandlerErr::db("db_update_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn classes_delete(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if db::get_class(&s.db, &s.school_id, &class_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::not_found("class not found"));
    }
    let tx = s
        .db
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    // Explicit dependency order, no ON DELETE CASCADE.
    for (table, sql) in [
        ("timetable_cells", "DELETE FROM timetable_cells WHERE class_id = ?1"),
        ("timetable_meta", "DELETE FROM timetable_meta WHERE class_id = ?1"),
        ("substitutions", "DELETE FROM substitutions WHERE class_id = ?1"),
        ("subject_allocations", "DELETE FROM subject_allocations WHERE class_id = ?1"),
        ("class_subjects", "DELETE FROM class_subjects WHERE class_id = ?1"),
        ("classes", "DELETE FROM classes WHERE id = ?1"),
    ] {
        tx.execute(sql, [&class_id]).map_err(|e| {
            HandlerErr::db("db_delete_failed", e).with_details(json!({ "table": table }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true }))
}

fn classes_subjects(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if db::get_class(&s.db, &s.school_id, &class_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::not_found("class not found"));
    }
    let explicit =
        db::class_subjects(&s.db, &class_id).map_err(|e| HandlerErr::db("db_query_failed", e))?;
    let pool = match &explicit {
        Some(v) => v.clone(),
        None => db::list_subjects(&s.db, &s.school_id)
            .map_err(|e| HandlerErr::db("db_query_failed", e))?,
    };
    Ok(json!({
        "usesCatalogue": explicit.is_none(),
        "subjects": to_json(&pool)?
    }))
}

/// Replaces the class's explicit subject list. An empty list reverts the
/// class to the full catalogue.
fn classes_set_subjects(s: &Session, params: &Value) -> Result<Value, HandlerErr> {
    let class_id = get_required_str(params, "classId")?;
    if db::get_class(&s.db, &s.school_id, &class_id)
        .map_err(|e| HandlerErr::db("db_query_failed", e))?
        .is_none()
    {
        return Err(HandlerErr::not_found("class not found"));
    }
    let Some(items) = params.get("subjects").and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params("subjects must be an array"));
    };

    let mut parsed: Vec<(String, Option<u32>)> = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        let subject_id = get_required_str(item, "subjectId")
            .map_err(|e| HandlerErr::bad_params(format!("subjects[{}]: {}", i, e.message)))?;
        let ppw = match item.get("periodsPerWeek") {
            None | Some(Value::Null) => None,
            Some(v) => Some(
                v.as_u64()
                    .filter(|n| (1..=60).contains(n))
                    .map(|n| n as u32)
                    .ok_or_else(|| {
                        HandlerErr::bad_params(format!(
                            "subjects[{}].periodsPerWeek must be in 1..=60",
                            i
                        ))
                    })?,
            ),
        };
        if parsed.iter().any(|(id, _)| *id == subject_id) {
            return Err(HandlerErr::bad_params(format!(
                "subjects[{}] repeats {}",
                i, subject_id
            )));
        }
        if db::get_subject(&s.db, &s.school_id, &subject_id)
            .map_err(|e| HandlerErr::db("db_query_failed", e))?
            .is_none()
        {
            return Err(HandlerErr::not_found(format!("subject not found: {}", subject_id)));
        }
        parsed.push((subject_id, ppw));
    }

    let tx = s
        .db
        .unchecked_transaction()
        .map_err(|e| HandlerErr::db("db_tx_failed", e))?;
    tx.execute("DELETE FROM class_subjects WHERE class_id = ?", [&class_id])
        .map_err(|e| HandlerErr::db("db_delete_failed", e))?;
    for (order, (subject_id, ppw)) in parsed.iter().enumerate() {
        tx.execute(
            "INSERT INTO class_subjects(class_id, subject_id, sort_order, periods_per_week)
             VALUES(?, ?, ?, ?)",
            (&class_id, subject_id, order as i64, ppw),
        )
        .map_err(|e| {
            HandlerErr::db("db_insert_failed", e).with_details(json!({ "table": "class_subjects" }))
        })?;
    }
    tx.commit()
        .map_err(|e| HandlerErr::db("db_commit_failed", e))?;
    Ok(json!({ "ok": true, "count": parsed.len() }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let f: fn(&Session, &Value) -> Result<Value, HandlerErr> = match req.method.as_str() {
        "classes.list" => classes_list,
        "classes.create" => classes_create,
        "classes.update" => classes_update,
        "classes.delete" => classes_delete,
        "classes.subjects" => classes_subjects,
        "classes.setSubjects" => classes_set_subjects,
        _ => return None,
    };
    Some(with_session(state, req, f))
}
