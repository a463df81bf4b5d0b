use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::db::now_rfc3339;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    get_optional_bool, get_optional_str, get_required_str, resolve_school_for_user,
};
use crate::ipc::types::{AppState, Request};
use crate::promotion::{
    self, PromoteClassArmRequest, PromoteStudentRequest, PromotionError, PromotionType,
};

fn promotion_err(id: &str, e: PromotionError) -> serde_json::Value {
    err(id, e.code, e.message, e.details)
}

fn parse_student_ids(params: &serde_json::Value) -> Result<Option<Vec<String>>, String> {
    let Some(raw) = params.get("studentIds") else {
        return Ok(None);
    };
    if raw.is_null() {
        return Ok(None);
    }
    let Some(arr) = raw.as_array() else {
        return Err("studentIds must be an array of ids".to_string());
    };
    let mut ids = Vec::with_capacity(arr.len());
    for v in arr {
        let Some(s) = v.as_str() else {
            return Err("studentIds must be an array of ids".to_string());
        };
        ids.push(s.to_string());
    }
    Ok(Some(ids))
}

fn handle_promote_student(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let target_class_arm_id = match get_required_str(&req.params, "targetClassArmId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let request = PromoteStudentRequest {
        student_id,
        target_class_arm_id,
        notes: get_optional_str(&req.params, "notes"),
    };

    match promotion::promote_student(conn, &school_id, &user_id, &request) {
        Ok(result) => {
            audit::log_activity(
                conn,
                &school_id,
                &user_id,
                "promotion.student",
                json!({ "studentId": result.student_id, "toClassArm": result.to_class_arm }),
            );
            ok(
                &req.id,
                serde_json::to_value(&result).unwrap_or_else(|_| json!({})),
            )
        }
        Err(e) => promotion_err(&req.id, e),
    }
}

fn handle_promote_class_arm(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let source_class_arm_id = match get_required_str(&req.params, "sourceClassArmId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let target_session_id = match get_required_str(&req.params, "targetSessionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let promotion_type = match get_required_str(&req.params, "promotionType") {
        Ok(raw) => match PromotionType::parse(&raw) {
            Some(v) => v,
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "promotionType must be PROMOTE or REPEAT",
                    None,
                )
            }
        },
        Err(e) => return e.response(&req.id),
    };
    let student_ids = match parse_student_ids(&req.params) {
        Ok(v) => v,
        Err(msg) => return err(&req.id, "bad_params", msg, None),
    };

    let request = PromoteClassArmRequest {
        source_class_arm_id,
        target_session_id,
        target_level_id: get_optional_str(&req.params, "targetLevelId"),
        promotion_type,
        student_ids,
        use_existing_class_arm: get_optional_bool(&req.params, "useExistingClassArm")
            .unwrap_or(false),
        existing_target_class_arm_id: get_optional_str(&req.params, "existingTargetClassArmId"),
        target_class_arm_name: get_optional_str(&req.params, "targetClassArmName"),
        repeaters_class_arm_id: get_optional_str(&req.params, "repeatersClassArmId"),
        repeaters_class_arm_name: get_optional_str(&req.params, "repeatersClassArmName"),
        notes: get_optional_str(&req.params, "notes"),
    };

    match promotion::promote_class_arm(conn, &school_id, &user_id, &request) {
        Ok(result) => {
            audit::log_activity(
                conn,
                &school_id,
                &user_id,
                "promotion.classArm",
                json!({
                    "batchId": result.batch_id,
                    "sourceClassArmId": request.source_class_arm_id,
                    "students": result.total_students
                }),
            );
            ok(
                &req.id,
                serde_json::to_value(&result).unwrap_or_else(|_| json!({})),
            )
        }
        Err(e) => promotion_err(&req.id, e),
    }
}

fn handle_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let student_filter = get_optional_str(&req.params, "studentId");

    let sql = "SELECT id, student_id, from_class_arm_id, to_class_arm_id,
                from_level_id, to_level_id, from_academic_session_id,
                to_academic_session_id, promotion_type, promotion_date,
                promoted_by, notes
         FROM student_promotions
         WHERE school_id = ?1 AND deleted_at IS NULL
           AND (?2 IS NULL OR student_id = ?2)
         ORDER BY promotion_date, created_at";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map((&school_id, &student_filter), |row| {
            let id: String = row.get(0)?;
            let student_id: String = row.get(1)?;
            let from_class_arm_id: Option<String> = row.get(2)?;
            let to_class_arm_id: String = row.get(3)?;
            let from_level_id: Option<String> = row.get(4)?;
            let to_level_id: String = row.get(5)?;
            let from_session_id: Option<String> = row.get(6)?;
            let to_session_id: String = row.get(7)?;
            let promotion_type: String = row.get(8)?;
            let promotion_date: String = row.get(9)?;
            let promoted_by: String = row.get(10)?;
            let notes: Option<String> = row.get(11)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "fromClassArmId": from_class_arm_id,
                "toClassArmId": to_class_arm_id,
                "fromLevelId": from_level_id,
                "toLevelId": to_level_id,
                "fromSessionId": from_session_id,
                "toSessionId": to_session_id,
                "promotionType": promotion_type,
                "promotionDate": promotion_date,
                "promotedBy": promoted_by,
                "notes": notes
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(promotions) => ok(&req.id, json!({ "promotions": promotions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_progressions_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let from_level_id = match get_required_str(&req.params, "fromLevelId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let to_level_id = match get_required_str(&req.params, "toLevelId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    for (key, level_id) in [("fromLevelId", &from_level_id), ("toLevelId", &to_level_id)] {
        let exists: Option<i64> = match conn
            .query_row(
                "SELECT 1 FROM levels WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
                (level_id, &school_id),
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if exists.is_none() {
            return err(&req.id, "not_found", format!("{} level not found", key), None);
        }
    }

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM level_progressions
         WHERE school_id = ? AND from_level_id = ?",
        (&school_id, &from_level_id),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let progression_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO level_progressions(
            id, school_id, from_level_id, to_level_id,
            is_automatic, requires_approval, sort_order, created_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &progression_id,
            &school_id,
            &from_level_id,
            &to_level_id,
            get_optional_bool(&req.params, "isAutomatic").unwrap_or(false) as i64,
            get_optional_bool(&req.params, "requiresApproval").unwrap_or(false) as i64,
            sort_order,
            now_rfc3339(),
        ),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "progressionId": progression_id }))
}

fn handle_progressions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut stmt = match conn.prepare(
        "SELECT p.id, p.from_level_id, lf.name, p.to_level_id, lt.name,
                p.is_automatic, p.requires_approval, p.sort_order
         FROM level_progressions p
         JOIN levels lf ON lf.id = p.from_level_id
         JOIN levels lt ON lt.id = p.to_level_id
         WHERE p.school_id = ? AND p.deleted_at IS NULL
         ORDER BY lf.sort_order, p.sort_order",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&school_id], |row| {
            let id: String = row.get(0)?;
            let from_level_id: String = row.get(1)?;
            let from_level_name: String = row.get(2)?;
            let to_level_id: String = row.get(3)?;
            let to_level_name: String = row.get(4)?;
            let is_automatic: i64 = row.get(5)?;
            let requires_approval: i64 = row.get(6)?;
            let sort_order: i64 = row.get(7)?;
            Ok(json!({
                "id": id,
                "fromLevelId": from_level_id,
                "fromLevelName": from_level_name,
                "toLevelId": to_level_id,
                "toLevelName": to_level_name,
                "isAutomatic": is_automatic != 0,
                "requiresApproval": requires_approval != 0,
                "sortOrder": sort_order
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match rows {
        Ok(progressions) => ok(&req.id, json!({ "progressions": progressions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_progressions_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let progression_id = match get_required_str(&req.params, "progressionId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let updated = match conn.execute(
        "UPDATE level_progressions SET deleted_at = ?
         WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
        (now_rfc3339(), &progression_id, &school_id),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_update_failed", e.to_string(), None),
    };
    if updated == 0 {
        return err(&req.id, "not_found", "level progression not found", None);
    }
    ok(&req.id, json!({ "progressionId": progression_id }))
}

fn handle_next_level(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let level_id = match get_required_str(&req.params, "levelId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match promotion::next_level(conn, &school_id, &level_id) {
        Ok(Some((id, name))) => ok(&req.id, json!({ "nextLevel": { "id": id, "name": name } })),
        Ok(None) => ok(&req.id, json!({ "nextLevel": null })),
        Err(e) => promotion_err(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "promotions.promoteStudent" => Some(handle_promote_student(state, req)),
        "promotions.promoteClassArm" => Some(handle_promote_class_arm(state, req)),
        "promotions.history" => Some(handle_history(state, req)),
        "promotions.nextLevel" => Some(handle_next_level(state, req)),
        "progressions.create" => Some(handle_progressions_create(state, req)),
        "progressions.list" => Some(handle_progressions_list(state, req)),
        "progressions.delete" => Some(handle_progressions_delete(state, req)),
        _ => None,
    }
}
