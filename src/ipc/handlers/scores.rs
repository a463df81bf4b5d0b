use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::db::now_rfc3339;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_bool, get_optional_str, get_required_str, resolve_school_for_user};
use crate::ipc::types::{AppState, Request};
use crate::templates;

fn handle_record(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let subject_id = match get_required_str(&req.params, "subjectId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let term_id = match get_required_str(&req.params, "termId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(score) = req.params.get("score").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing score", None);
    };
    if score < 0.0 {
        return err(&req.id, "bad_params", "score must not be negative", None);
    }

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

    let subject_exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM subjects WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&subject_id, &school_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if subject_exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let term_row: Option<(String, i64)> = match conn
        .query_row(
            "SELECT t.academic_session_id, s.is_current
             FROM terms t
             JOIN academic_sessions s ON s.id = t.academic_session_id
             WHERE t.id = ? AND t.school_id = ? AND t.deleted_at IS NULL",
            (&term_id, &school_id),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((session_id, session_is_current)) = term_row else {
        return err(&req.id, "not_found", "term not found", None);
    };

    // Scores hang off the arm the student currently sits in for that session.
    let class_arm_id: Option<String> = match conn
        .query_row(
            "SELECT class_arm_id FROM class_arm_students
             WHERE student_id = ? AND academic_session_id = ? AND is_active = 1
             LIMIT 1",
            (&student_id, &session_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(class_arm_id) = class_arm_id else {
        return err(
            &req.id,
            "bad_params",
            "student has no active enrollment for this session",
            None,
        );
    };

    let template = if session_is_current != 0 {
        templates::resolve_active(conn, &school_id, &session_id)
    } else {
        templates::find_for_session(conn, &school_id, &session_id)
    };
    let template = match template {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let component = template.as_ref().and_then(|t| {
        t.components
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(&name))
    });
    if let Some(component) = component {
        if score > component.max_score {
            return err(
                &req.id,
                "bad_params",
                format!(
                    "score {} exceeds component '{}' maxScore {}",
                    score, component.name, component.max_score
                ),
                None,
            );
        }
    }
    let is_exam = get_optional_bool(&req.params, "isExam")
        .or(component.map(|c| c.is_exam))
        .unwrap_or(false);

    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM student_assessments
             WHERE student_id = ? AND subject_id = ? AND term_id = ?
               AND UPPER(name) = UPPER(?) AND deleted_at IS NULL",
            (&student_id, &subject_id, &term_id, &name),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let now = now_rfc3339();
    let record_id = match existing {
        // Re-grading mutates the row in place.
        Some(record_id) => {
            if let Err(e) = conn.execute(
                "UPDATE student_assessments
                 SET score = ?, is_exam = ?, updated_at = ?
                 WHERE id = ?",
                (score, is_exam as i64, &now, &record_id),
            ) {
                return err(&req.id, "db_update_failed", e.to_string(), None);
            }
            record_id
        }
        None => {
            let record_id = Uuid::new_v4().to_string();
            if let Err(e) = conn.execute(
                "INSERT INTO student_assessments(
                    id, school_id, student_id, subject_id, term_id, class_arm_id,
                    name, score, is_exam, recorded_at, updated_at)
                 VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                rusqlite::params![
                    &record_id,
                    &school_id,
                    &student_id,
                    &subject_id,
                    &term_id,
                    &class_arm_id,
                    &name,
                    score,
                    is_exam as i64,
                    &now,
                    &now,
                ],
            ) {
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
            record_id
        }
    };

    audit::log_activity(
        conn,
        &school_id,
        &user_id,
        "score.record",
        json!({ "recordId": record_id, "studentId": student_id, "name": name, "score": score }),
    );
    ok(&req.id, json!({ "recordId": record_id, "score": score }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let term_id = match get_required_str(&req.params, "termId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let subject_filter = get_optional_str(&req.params, "subjectId");

    let sql = "SELECT sa.id, sa.subject_id, sub.name, sa.name, sa.score, sa.is_exam, sa.recorded_at
         FROM student_assessments sa
         JOIN subjects sub ON sub.id = sa.subject_id
         WHERE sa.school_id = ?1 AND sa.student_id = ?2 AND sa.term_id = ?3
           AND sa.deleted_at IS NULL
           AND (?4 IS NULL OR sa.subject_id = ?4)
         ORDER BY sub.name, sa.recorded_at";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&school_id, &student_id, &term_id, &subject_filter), |row| {
            let id: String = row.get(0)?;
            let subject_id: String = row.get(1)?;
            let subject_name: String = row.get(2)?;
            let name: String = row.get(3)?;
            let score: f64 = row.get(4)?;
            let is_exam: i64 = row.get(5)?;
            let recorded_at: String = row.get(6)?;
            Ok(json!({
                "id": id,
                "subjectId": subject_id,
                "subjectName": subject_name,
                "name": name,
                "score": score,
                "isExam": is_exam != 0,
                "recordedAt": recorded_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(records) => ok(&req.id, json!({ "records": records })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scores.record" => Some(handle_record(state, req)),
        "scores.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
