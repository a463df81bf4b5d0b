use rusqlite::{Connection, OptionalExtension};

use crate::ipc::error::err;

pub struct HandlerErr {
    pub code: &'static str,
    pub message: String,
    pub details: Option<serde_json::Value>,
}

impl HandlerErr {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn db(e: rusqlite::Error) -> Self {
        Self::new("db_query_failed", e.to_string())
    }

    pub fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

pub fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(v) if !v.trim().is_empty() => Ok(v.trim().to_string()),
        _ => Err(HandlerErr::new("bad_params", format!("missing {}", key))),
    }
}

pub fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn get_optional_bool(params: &serde_json::Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

/// Tenant context: every operation names the acting user and runs inside that
/// user's school. A user without a school cannot touch tenant data.
pub fn resolve_school_for_user(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<(String, String), HandlerErr> {
    let user_id = get_required_str(params, "userId")?;
    let row: Option<Option<String>> = conn
        .query_row("SELECT school_id FROM users WHERE id = ?", [&user_id], |r| {
            r.get(0)
        })
        .optional()
        .map_err(HandlerErr::db)?;
    let Some(school_id) = row else {
        return Err(HandlerErr::new("not_found", "user not found"));
    };
    let Some(school_id) = school_id else {
        return Err(HandlerErr::new(
            "bad_params",
            "user is not attached to a school",
        ));
    };
    Ok((user_id, school_id))
}
