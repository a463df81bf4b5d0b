use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

use crate::db::now_rfc3339;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_bool, get_required_str, resolve_school_for_user, HandlerErr};
use crate::ipc::types::{AppState, Request};

fn structure_in_use(
    conn: &Connection,
    school_id: &str,
    session_id: &str,
    name: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM student_assessments sa
            JOIN terms t ON t.id = sa.term_id
            WHERE sa.school_id = ? AND t.academic_session_id = ?
              AND UPPER(sa.name) = UPPER(?) AND sa.deleted_at IS NULL
         )",
        (school_id, session_id, name),
        |r| r.get::<_, i64>(0),
    )
    .map(|v| v != 0)
    .map_err(HandlerErr::db)
}

fn scope_total_excluding(
    conn: &Connection,
    school_id: &str,
    session_id: &str,
    exclude_id: Option<&str>,
) -> Result<f64, HandlerErr> {
    conn.query_row(
        "SELECT COALESCE(SUM(max_score), 0) FROM assessment_structures
         WHERE school_id = ?1 AND academic_session_id = ?2
           AND is_active = 1 AND deleted_at IS NULL
           AND (?3 IS NULL OR id != ?3)",
        (school_id, session_id, exclude_id),
        |r| r.get(0),
    )
    .map_err(HandlerErr::db)
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let session_id = match get_required_str(&req.params, "sessionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(max_score) = req.params.get("maxScore").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing maxScore", None);
    };
    if !(max_score >= 1.0 && max_score <= 100.0) {
        return err(&req.id, "bad_params", "maxScore must be between 1 and 100", None);
    }
    let is_exam = get_optional_bool(&req.params, "isExam").unwrap_or(false);

    let session_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM academic_sessions
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&session_id, &school_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if session_exists.is_none() {
        return err(&req.id, "not_found", "academic session not found", None);
    }

    let clash: Option<String> = match conn
        .query_row(
            "SELECT id FROM assessment_structures
             WHERE school_id = ? AND academic_session_id = ?
               AND UPPER(name) = UPPER(?) AND deleted_at IS NULL",
            (&school_id, &session_id, &name),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if clash.is_some() {
        return err(
            &req.id,
            "conflict",
            format!("assessment structure '{}' already exists for this session", name),
            None,
        );
    }

    let existing_total = match scope_total_excluding(conn, &school_id, &session_id, None) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let total = existing_total + max_score;
    if total > 100.0 + 1e-9 {
        return err(
            &req.id,
            "bad_params",
            format!("total maxScore for the session would be {}%, exceeding 100%", total),
            Some(json!({ "total": total })),
        );
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM assessment_structures
         WHERE school_id = ? AND academic_session_id = ?",
        (&school_id, &session_id),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let structure_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO assessment_structures(
            id, school_id, academic_session_id, name, max_score, is_exam,
            sort_order, is_active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &structure_id,
            &school_id,
            &session_id,
            &name,
            max_score,
            is_exam as i64,
            sort_order,
            now_rfc3339(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "structureId": structure_id, "name": name }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let structure_id = match get_required_str(&req.params, "structureId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row: Option<(String, String, f64, i64)> = match conn
        .query_row(
            "SELECT academic_session_id, name, max_score, is_exam
             FROM assessment_structures
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&structure_id, &school_id),
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((session_id, name, old_max_score, old_is_exam)) = row else {
        return err(&req.id, "not_found", "assessment structure not found", None);
    };

    let new_max_score = req.params.get("maxScore").and_then(|v| v.as_f64());
    let new_is_exam = get_optional_bool(&req.params, "isExam");

    let score_impacting = new_max_score.map(|v| v != old_max_score).unwrap_or(false)
        || new_is_exam.map(|v| v != (old_is_exam != 0)).unwrap_or(false);
    if score_impacting {
        match structure_in_use(conn, &school_id, &session_id, &name) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "structure is in use by recorded assessments; maxScore and isExam can no longer change",
                    None,
                )
            }
            Ok(false) => {}
            Err(e) => return e.response(&req.id),
        }
    }

    if let Some(max_score) = new_max_score {
        if !(max_score >= 1.0 && max_score <= 100.0) {
            return err(&req.id, "bad_params", "maxScore must be between 1 and 100", None);
        }
        let others = match scope_total_excluding(conn, &school_id, &session_id, Some(&structure_id))
        {
            Ok(v) => v,
            Err(e) => return e.response(&req.id),
        };
        let total = others + max_score;
        if total > 100.0 + 1e-9 {
            return err(
                &req.id,
                "bad_params",
                format!("total maxScore for the session would be {}%, exceeding 100%", total),
                Some(json!({ "total": total })),
            );
        }
        if let Err(e) = conn.execute(
            "UPDATE assessment_structures SET max_score = ? WHERE id = ?",
            (max_score, &structure_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(is_exam) = new_is_exam {
        if let Err(e) = conn.execute(
            "UPDATE assessment_structures SET is_exam = ? WHERE id = ?",
            (is_exam as i64, &structure_id),
        ) {
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "structureId": structure_id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let structure_id = match get_required_str(&req.params, "structureId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let row: Option<(String, String)> = match conn
        .query_row(
            "SELECT academic_session_id, name FROM assessment_structures
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&structure_id, &school_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((session_id, name)) = row else {
        return err(&req.id, "not_found", "assessment structure not found", None);
    };

    match structure_in_use(conn, &school_id, &session_id, &name) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "structure is in use by recorded assessments and cannot be deleted",
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return e.response(&req.id),
    }

    if let Err(e) = conn.execute(
        "UPDATE assessment_structures SET is_active = 0, deleted_at = ? WHERE id = ?",
        (now_rfc3339(), &structure_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "structureId": structure_id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let session_id = match get_required_str(&req.params, "sessionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, max_score, is_exam, sort_order, is_active
         FROM assessment_structures
         WHERE school_id = ? AND academic_session_id = ? AND deleted_at IS NULL
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&school_id, &session_id), |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let max_score: f64 = row.get(2)?;
            let is_exam: i64 = row.get(3)?;
            let sort_order: i64 = row.get(4)?;
            let is_active: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "maxScore": max_score,
                "isExam": is_exam != 0,
                "sortOrder": sort_order,
                "isActive": is_active != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(structures) => ok(&req.id, json!({ "structures": structures })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "structures.create" => Some(handle_create(state, req)),
        "structures.update" => Some(handle_update(state, req)),
        "structures.delete" => Some(handle_delete(state, req)),
        "structures.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
