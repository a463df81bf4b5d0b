use serde_json::json;

use crate::calc::{self, CalcContext, ResultsFilters};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, resolve_school_for_user};
use crate::ipc::types::{AppState, Request};

fn handle_student_results(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let filters = ResultsFilters {
        session_id: get_optional_str(&req.params, "sessionId"),
        term_id: get_optional_str(&req.params, "termId"),
        subject_id: get_optional_str(&req.params, "subjectId"),
    };

    let ctx = CalcContext {
        conn,
        school_id: &school_id,
    };
    match calc::student_results(&ctx, &student_id, &filters) {
        Ok(model) => ok(
            &req.id,
            serde_json::to_value(&model).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

fn handle_class_arm_ranking(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let class_arm_id = match get_required_str(&req.params, "classArmId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let ctx = CalcContext {
        conn,
        school_id: &school_id,
    };
    match calc::class_arm_ranking(&ctx, &term_id, &class_arm_id) {
        Ok(model) => ok(
            &req.id,
            serde_json::to_value(&model).unwrap_or_else(|_| json!({})),
        ),
        Err(e) => err(&req.id, &e.code, e.message, e.details),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.results" => Some(handle_student_results(state, req)),
        "classArms.ranking" => Some(handle_class_arm_ranking(state, req)),
        _ => None,
    }
}
