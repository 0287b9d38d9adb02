use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request, Session};
use serde_json::json;
use std::path::PathBuf;

pub const DEFAULT_SCHOOL: &str = "default";

fn handle_health(state: &mut AppState, req: &Request) -> serde_json::Value {
    ok(
        &req.id,
        json!({
            "version": env!("CARGO_PKG_VERSION"),
            "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string()),
            "schoolId": state.session.as_ref().map(|s| s.school_id.clone())
        }),
    )
}

fn handle_workspace_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    let p = req
        .params
        .get("path")
        .and_then(|v| v.as_str())
        .map(PathBuf::from);
    let Some(path) = p else {
        return err(&req.id, "bad_params", "missing params.path", None);
    };
    let school_id = match req.params.get("schoolId") {
        None | Some(serde_json::Value::Null) => DEFAULT_SCHOOL.to_string(),
        Some(v) => match v.as_str().map(str::trim) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => return err(&req.id, "bad_params", "schoolId must be a non-empty string", None),
        },
    };

    // Release the previous connection before opening the new one.
    state.session = None;
    state.workspace = None;
    match db::open_db(&path) {
        Ok(conn) => {
            tracing::info!(
                workspace = %path.to_string_lossy(),
                school_id = %school_id,
                "workspace selected"
            );
            state.workspace = Some(path.clone());
            state.session = Some(Session {
                school_id: school_id.clone(),
                db: conn,
            });
            ok(
                &req.id,
                json!({ "workspacePath": path.to_string_lossy(), "schoolId": school_id }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "health" => Some(handle_health(state, req)),
        "workspace.select" => Some(handle_workspace_select(state, req)),
        _ => None,
    }
}
