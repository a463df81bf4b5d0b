use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::db::now_rfc3339;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, resolve_school_for_user};
use crate::ipc::types::{AppState, Request};

/// Places a student in a class arm. Any previously active enrollment for the
/// same academic session is deactivated in the same transaction, keeping the
/// one-active-enrollment invariant.
fn handle_enrollments_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_id = match get_required_str(&req.params, "studentId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let class_arm_id = match get_required_str(&req.params, "classArmId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let student_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM students WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&student_id, &school_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if student_exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let session_id: Option<String> = match conn
        .query_row(
            "SELECT academic_session_id FROM class_arms
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&class_arm_id, &school_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(session_id) = session_id else {
        return err(&req.id, "not_found", "class arm not found", None);
    };

    let now = now_rfc3339();
    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "UPDATE class_arm_students SET is_active = 0, left_at = ?
         WHERE student_id = ? AND academic_session_id = ? AND is_active = 1",
        (&now, &student_id, &session_id),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    let enrollment_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO class_arm_students(
            id, school_id, student_id, class_arm_id, academic_session_id,
            is_active, enrolled_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (
            &enrollment_id,
            &school_id,
            &student_id,
            &class_arm_id,
            &session_id,
            &now,
        ),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    audit::log_activity(
        conn,
        &school_id,
        &user_id,
        "enrollment.create",
        json!({ "studentId": student_id, "classArmId": class_arm_id }),
    );

    ok(
        &req.id,
        json!({
            "enrollmentId": enrollment_id,
            "studentId": student_id,
            "classArmId": class_arm_id,
            "sessionId": session_id
        }),
    )
}

/// Lists enrollments for a student, or the roster of a class arm.
fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_filter = get_optional_str(&req.params, "studentId");
    let arm_filter = get_optional_str(&req.params, "classArmId");
    if student_filter.is_none() && arm_filter.is_none() {
        return err(
            &req.id,
            "bad_params",
            "provide studentId or classArmId",
            None,
        );
    }

    let sql = "SELECT e.id, e.student_id, s.last_name, s.first_name,
                e.class_arm_id, ca.name, e.academic_session_id, e.is_active,
                e.enrolled_at, e.left_at
         FROM class_arm_students e
         JOIN students s ON s.id = e.student_id
         JOIN class_arms ca ON ca.id = e.class_arm_id
         WHERE e.school_id = ?1
           AND (?2 IS NULL OR e.student_id = ?2)
           AND (?3 IS NULL OR e.class_arm_id = ?3)
         ORDER BY e.enrolled_at";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&school_id, &student_filter, &arm_filter), |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let last: String = row.get(2)?;
            let first: String = row.get(3)?;
            let class_arm_id: String = row.get(4)?;
            let class_arm_name: String = row.get(5)?;
            let session_id: String = row.get(6)?;
            let is_active: i64 = row.get(7)?;
            let enrolled_at: String = row.get(8)?;
            let left_at: Option<String> = row.get(9)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "studentName": format!("{}, {}", last, first),
                "classArmId": class_arm_id,
                "classArmName": class_arm_name,
                "sessionId": session_id,
                "isActive": is_active != 0,
                "enrolledAt": enrolled_at,
                "leftAt": left_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(enrollments) => ok(&req.id, json!({ "enrollments": enrollments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.create" => Some(handle_enrollments_create(state, req)),
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        _ => None,
    }
}
