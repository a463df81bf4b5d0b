use rusqlite::OptionalExtension;
use serde_json::json;

use crate::audit;
use crate::db::now_rfc3339;
use crate::grading::{model_to_wire, parse_grading_model};
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::resolve_school_for_user;
use crate::ipc::types::{AppState, Request};

/// One grading model per school; writes replace the previous map wholesale
/// after full-coverage validation.
fn handle_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(raw) = req.params.get("model") else {
        return err(&req.id, "bad_params", "missing model", None);
    };

    let model = match parse_grading_model(raw) {
        Ok(v) => v,
        Err(e) => return err(&req.id, &e.code, e.message, e.details),
    };

    let stored = model_to_wire(&model).to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO grading_models(school_id, model_json, updated_at)
         VALUES(?, ?, ?)
         ON CONFLICT(school_id) DO UPDATE SET model_json = excluded.model_json,
                                              updated_at = excluded.updated_at",
        (&school_id, &stored, now_rfc3339()),
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    audit::log_activity(
        conn,
        &school_id,
        &user_id,
        "gradingModel.upsert",
        json!({ "bands": model.bands.len() }),
    );
    ok(&req.id, json!({ "schoolId": school_id, "bands": model.bands.len() }))
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let raw: Option<String> = match conn
        .query_row(
            "SELECT model_json FROM grading_models WHERE school_id = ?",
            [&school_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match raw {
        Some(raw) => {
            let model: serde_json::Value = serde_json::from_str(&raw).unwrap_or(json!({}));
            ok(&req.id, json!({ "model": model }))
        }
        None => ok(&req.id, json!({ "model": null })),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "gradingModels.upsert" => Some(handle_upsert(state, req)),
        "gradingModels.get" => Some(handle_get(state, req)),
        _ => None,
    }
}
