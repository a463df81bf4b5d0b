use chrono::NaiveDate;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::db::now_rfc3339;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, resolve_school_for_user, HandlerErr,
};
use crate::ipc::types::{AppState, Request};

fn parse_iso_date(raw: &str, key: &str) -> Result<String, HandlerErr> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map(|d| d.to_string())
        .map_err(|_| HandlerErr::new("bad_params", format!("{} must be an ISO date (YYYY-MM-DD)", key)))
}

fn handle_schools_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let school_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO schools(id, name, created_at) VALUES(?, ?, ?)",
        (&school_id, &name, now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "schoolId": school_id, "name": name }))
}

fn handle_schools_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let mut stmt = match conn.prepare(
        "SELECT s.id, s.name,
           (SELECT COUNT(*) FROM students st WHERE st.school_id = s.id AND st.deleted_at IS NULL)
         FROM schools s
         ORDER BY s.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let student_count: i64 = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "studentCount": student_count }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(schools) => ok(&req.id, json!({ "schools": schools })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_users_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let display_name = match get_required_str(&req.params, "displayName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let role = get_optional_str(&req.params, "role").unwrap_or_else(|| "ADMIN".to_string());
    let school_id = get_optional_str(&req.params, "schoolId");

    if let Some(school_id) = &school_id {
        let exists: Option<i64> = match conn
            .query_row("SELECT 1 FROM schools WHERE id = ?", [school_id], |r| r.get(0))
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", "school not found", None);
        }
    }

    let user_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO users(id, school_id, display_name, role, created_at) VALUES(?, ?, ?, ?, ?)",
        (&user_id, &school_id, &display_name, &role, now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "userId": user_id }))
}

fn handle_sessions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let starts_on = match get_optional_str(&req.params, "startsOn") {
        Some(raw) => match parse_iso_date(&raw, "startsOn") {
            Ok(v) => Some(v),
            Err(e) => return e.response(&req.id),
        },
        None => None,
    };
    let ends_on = match get_optional_str(&req.params, "endsOn") {
        Some(raw) => match parse_iso_date(&raw, "endsOn") {
            Ok(v) => Some(v),
            Err(e) => return e.response(&req.id),
        },
        None => None,
    };
    let make_current = get_optional_bool(&req.params, "makeCurrent").unwrap_or(false);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if make_current {
        if let Err(e) = tx.execute(
            "UPDATE academic_sessions SET is_current = 0 WHERE school_id = ?",
            [&school_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    let session_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO academic_sessions(
            id, school_id, name, starts_on, ends_on, is_current, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &session_id,
            &school_id,
            &name,
            &starts_on,
            &ends_on,
            make_current as i64,
            now_rfc3339(),
        ),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "sessionId": session_id, "name": name }))
}

fn handle_sessions_set_current(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let exists: Option<i64> = match conn
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
    if exists.is_none() {
        return err(&req.id, "not_found", "academic session not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE academic_sessions SET is_current = 0 WHERE school_id = ?",
        [&school_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE academic_sessions SET is_current = 1 WHERE id = ?",
        [&session_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "sessionId": session_id }))
}

fn handle_sessions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, name, starts_on, ends_on, is_current
         FROM academic_sessions
         WHERE school_id = ? AND deleted_at IS NULL
         ORDER BY created_at",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&school_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let starts_on: Option<String> = row.get(2)?;
            let ends_on: Option<String> = row.get(3)?;
            let is_current: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "startsOn": starts_on,
                "endsOn": ends_on,
                "isCurrent": is_current != 0
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(sessions) => ok(&req.id, json!({ "sessions": sessions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_terms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let make_current = get_optional_bool(&req.params, "makeCurrent").unwrap_or(false);

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

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM terms WHERE academic_session_id = ?",
        [&session_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if make_current {
        if let Err(e) = tx.execute(
            "UPDATE terms SET is_current = 0 WHERE academic_session_id = ?",
            [&session_id],
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    let term_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO terms(
            id, school_id, academic_session_id, name, sort_order, is_current, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &term_id,
            &school_id,
            &session_id,
            &name,
            sort_order,
            make_current as i64,
            now_rfc3339(),
        ),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "termId": term_id, "name": name, "sortOrder": sort_order }))
}

fn handle_terms_set_current(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let term_id = match get_required_str(&req.params, "termId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let session_id: Option<String> = match conn
        .query_row(
            "SELECT academic_session_id FROM terms
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&term_id, &school_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(session_id) = session_id else {
        return err(&req.id, "not_found", "term not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE terms SET is_current = 0 WHERE academic_session_id = ?",
        [&session_id],
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("UPDATE terms SET is_current = 1 WHERE id = ?", [&term_id]) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "termId": term_id }))
}

fn handle_levels_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM levels WHERE school_id = ?",
        [&school_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let level_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO levels(id, school_id, name, sort_order, created_at) VALUES(?, ?, ?, ?, ?)",
        (&level_id, &school_id, &name, sort_order, now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "levelId": level_id, "name": name }))
}

fn handle_levels_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let mut stmt = match conn.prepare(
        "SELECT id, name, sort_order FROM levels
         WHERE school_id = ? AND deleted_at IS NULL
         ORDER BY sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&school_id], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let sort_order: i64 = row.get(2)?;
            Ok(json!({ "id": id, "name": name, "sortOrder": sort_order }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(levels) => ok(&req.id, json!({ "levels": levels })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, school_id, name, created_at) VALUES(?, ?, ?, ?)",
        (&subject_id, &school_id, &name, now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "subjectId": subject_id, "name": name }))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let last_name = match get_required_str(&req.params, "lastName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let first_name = match get_required_str(&req.params, "firstName") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, school_id, last_name, first_name, status, created_at)
         VALUES(?, ?, ?, ?, 'ACTIVE', ?)",
        (&student_id, &school_id, &last_name, &first_name, now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "studentId": student_id }))
}

fn handle_students_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let status = match get_required_str(&req.params, "status") {
        Ok(v) => v.to_ascii_uppercase(),
        Err(e) => return e.response(&req.id),
    };
    if status != "ACTIVE" && status != "INACTIVE" {
        return err(&req.id, "bad_params", "status must be ACTIVE or INACTIVE", None);
    }

    let updated = match conn.execute(
        "UPDATE students SET status = ? WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
        (&status, &student_id, &school_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }
    ok(&req.id, json!({ "studentId": student_id, "status": status }))
}

fn handle_class_arms_create(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let level_id = match get_required_str(&req.params, "levelId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_teacher_id = get_optional_str(&req.params, "classTeacherId");
    let location = get_optional_str(&req.params, "location");

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

    let level_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM levels WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&level_id, &school_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if level_exists.is_none() {
        return err(&req.id, "not_found", "level not found", None);
    }

    let clash: Option<String> = match conn
        .query_row(
            "SELECT id FROM class_arms
             WHERE school_id = ? AND academic_session_id = ? AND level_id = ?
               AND UPPER(name) = UPPER(?) AND deleted_at IS NULL",
            (&school_id, &session_id, &level_id, &name),
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
            format!("class arm '{}' already exists in this level and session", name),
            None,
        );
    }

    let class_arm_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_arms(
            id, school_id, academic_session_id, level_id, name,
            class_teacher_id, location, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &class_arm_id,
            &school_id,
            &session_id,
            &level_id,
            &name,
            &class_teacher_id,
            &location,
            now_rfc3339(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "classArmId": class_arm_id, "name": name }))
}

fn handle_class_arms_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let session_filter = get_optional_str(&req.params, "sessionId");

    let sql = "SELECT ca.id, ca.name, ca.level_id, l.name, ca.academic_session_id,
                (SELECT COUNT(*) FROM class_arm_students e
                 WHERE e.class_arm_id = ca.id AND e.is_active = 1) AS enrolled
         FROM class_arms ca
         JOIN levels l ON l.id = ca.level_id
         WHERE ca.school_id = ?1 AND ca.deleted_at IS NULL
           AND (?2 IS NULL OR ca.academic_session_id = ?2)
         ORDER BY l.sort_order, ca.name";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&school_id, &session_filter), |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let level_id: String = row.get(2)?;
            let level_name: String = row.get(3)?;
            let session_id: String = row.get(4)?;
            let enrolled: i64 = row.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "levelId": level_id,
                "levelName": level_name,
                "sessionId": session_id,
                "enrolledCount": enrolled
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(class_arms) => ok(&req.id, json!({ "classArms": class_arms })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "schools.create" => Some(handle_schools_create(state, req)),
        "schools.list" => Some(handle_schools_list(state, req)),
        "users.create" => Some(handle_users_create(state, req)),
        "sessions.create" => Some(handle_sessions_create(state, req)),
        "sessions.setCurrent" => Some(handle_sessions_set_current(state, req)),
        "sessions.list" => Some(handle_sessions_list(state, req)),
        "terms.create" => Some(handle_terms_create(state, req)),
        "terms.setCurrent" => Some(handle_terms_set_current(state, req)),
        "levels.create" => Some(handle_levels_create(state, req)),
        "levels.list" => Some(handle_levels_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.setStatus" => Some(handle_students_set_status(state, req)),
        "classArms.create" => Some(handle_class_arms_create(state, req)),
        "classArms.list" => Some(handle_class_arms_list(state, req)),
        _ => None,
    }
}
