use rusqlite::Connection;
use uuid::Uuid;

use crate::db::now_rfc3339;

/// Best-effort activity trail. A failed insert must never abort the operation
/// being recorded, so errors stop here as a warning.
pub fn log_activity(
    conn: &Connection,
    school_id: &str,
    user_id: &str,
    action: &str,
    details: serde_json::Value,
) {
    let result = conn.execute(
        "INSERT INTO activity_log(id, school_id, user_id, action, details_json, created_at)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            school_id,
            user_id,
            action,
            details.to_string(),
            now_rfc3339(),
        ),
    );
    if let Err(e) = result {
        tracing::warn!(action, error = %e, "activity log write failed");
    }
}
