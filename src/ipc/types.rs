use std::path::PathBuf;

use rusqlite::Connection;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Request {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// The tenant every request runs under, plus its open workspace database.
/// Handlers receive this explicitly instead of reading process-wide state.
pub struct Session {
    pub school_id: String,
    pub db: Connection,
}

#[derive(Default)]
pub struct AppState {
    pub workspace: Option<PathBuf>,
    pub session: Option<Session>,
}
