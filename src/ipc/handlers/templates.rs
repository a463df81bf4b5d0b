use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

use crate::audit;
use crate::db::now_rfc3339;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{get_optional_str, get_required_str, resolve_school_for_user, HandlerErr};
use crate::ipc::types::{AppState, Request};
use crate::templates::{self, NewComponent};

fn calc_err(id: &str, e: crate::calc::CalcError) -> serde_json::Value {
    err(id, &e.code, e.message, e.details)
}

fn parse_components(params: &serde_json::Value) -> Result<Vec<NewComponent>, HandlerErr> {
    let Some(raw) = params.get("components") else {
        return Err(HandlerErr::new("bad_params", "missing components"));
    };
    serde_json::from_value::<Vec<NewComponent>>(raw.clone()).map_err(|_| {
        HandlerErr::new(
            "bad_params",
            "components must be an array of {name, maxScore, isExam}",
        )
    })
}

fn session_row(
    conn: &rusqlite::Connection,
    school_id: &str,
    session_id: &str,
) -> Result<Option<bool>, rusqlite::Error> {
    conn.query_row(
        "SELECT is_current FROM academic_sessions
         WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
        (session_id, school_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|n| n != 0))
}

fn handle_create_global_default(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match templates::create_global_default(conn) {
        Ok(template) => ok(
            &req.id,
            json!({ "template": serde_json::to_value(&template).unwrap_or_default() }),
        ),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_resolve_active(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let is_current = match session_row(conn, &school_id, &session_id) {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "academic session not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Only the current session may materialize a copy of the global default;
    // historical sessions read what they have or nothing.
    let resolved = if is_current {
        templates::resolve_active(conn, &school_id, &session_id)
    } else {
        templates::find_for_session(conn, &school_id, &session_id)
    };

    match resolved {
        Ok(Some(template)) => ok(
            &req.id,
            json!({ "template": serde_json::to_value(&template).unwrap_or_default() }),
        ),
        Ok(None) => ok(&req.id, json!({ "template": null })),
        Err(e) => calc_err(&req.id, e),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
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
    let description = get_optional_str(&req.params, "description");
    let components = match parse_components(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match session_row(conn, &school_id, &session_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "academic session not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }
    if let Err(e) = templates::validate_components(&components) {
        return calc_err(&req.id, e);
    }

    let existing = match templates::find_for_session(conn, &school_id, &session_id) {
        Ok(v) => v,
        Err(e) => return calc_err(&req.id, e),
    };
    if existing.is_some() {
        return err(
            &req.id,
            "conflict",
            "an active template already exists for this session",
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let template_id = Uuid::new_v4().to_string();
    let now = now_rfc3339();
    if let Err(e) = tx.execute(
        "INSERT INTO assessment_templates(
            id, school_id, academic_session_id, name, description,
            is_active, is_global_default, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, 0, ?, ?)",
        (
            &template_id,
            &school_id,
            &session_id,
            &name,
            &description,
            &now,
            &now,
        ),
    ) {
        let _ = tx.rollback();
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }
    if let Err(e) = templates::replace_components(&tx, &template_id, &components) {
        let _ = tx.rollback();
        return calc_err(&req.id, e);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    audit::log_activity(
        conn,
        &school_id,
        &user_id,
        "template.create",
        json!({ "templateId": template_id, "sessionId": session_id }),
    );
    ok(&req.id, json!({ "templateId": template_id }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let template_id = match get_required_str(&req.params, "templateId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let scope: Option<(Option<String>,)> = match conn
        .query_row(
            "SELECT academic_session_id FROM assessment_templates
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&template_id, &school_id),
            |r| Ok((r.get(0)?,)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((session_id,)) = scope else {
        return err(&req.id, "not_found", "template not found", None);
    };

    let name = get_optional_str(&req.params, "name");
    let description = get_optional_str(&req.params, "description");
    let components = match req.params.get("components") {
        Some(_) => match parse_components(&req.params) {
            Ok(v) => Some(v),
            Err(e) => return e.response(&req.id),
        },
        None => None,
    };

    if let Some(components) = &components {
        if let Err(e) = templates::validate_components(components) {
            return calc_err(&req.id, e);
        }
        // Component sets freeze once scores in this session reference them.
        if let Some(session_id) = &session_id {
            match templates::template_in_use(conn, &school_id, session_id) {
                Ok(true) => {
                    return err(
                        &req.id,
                        "conflict",
                        "template is in use by recorded assessments and its components can no longer change",
                        None,
                    )
                }
                Ok(false) => {}
                Err(e) => return calc_err(&req.id, e),
            }
        }
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    let now = now_rfc3339();
    if let Some(name) = &name {
        if let Err(e) = tx.execute(
            "UPDATE assessment_templates SET name = ?, updated_at = ? WHERE id = ?",
            (name, &now, &template_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(description) = &description {
        if let Err(e) = tx.execute(
            "UPDATE assessment_templates SET description = ?, updated_at = ? WHERE id = ?",
            (description, &now, &template_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Some(components) = &components {
        if let Err(e) = templates::replace_components(&tx, &template_id, components) {
            let _ = tx.rollback();
            return calc_err(&req.id, e);
        }
        if let Err(e) = tx.execute(
            "UPDATE assessment_templates SET updated_at = ? WHERE id = ?",
            (&now, &template_id),
        ) {
            let _ = tx.rollback();
            return err(&req.id, "db_update_failed", e.to_string(), None);
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    audit::log_activity(
        conn,
        &school_id,
        &user_id,
        "template.update",
        json!({ "templateId": template_id }),
    );
    ok(&req.id, json!({ "templateId": template_id }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let template_id = match get_required_str(&req.params, "templateId") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let scope: Option<(Option<String>,)> = match conn
        .query_row(
            "SELECT academic_session_id FROM assessment_templates
             WHERE id = ? AND school_id = ? AND deleted_at IS NULL",
            (&template_id, &school_id),
            |r| Ok((r.get(0)?,)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((session_id,)) = scope else {
        return err(&req.id, "not_found", "template not found", None);
    };

    if let Some(session_id) = &session_id {
        match templates::template_in_use(conn, &school_id, session_id) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "template is in use by recorded assessments and cannot be deleted",
                    None,
                )
            }
            Ok(false) => {}
            Err(e) => return calc_err(&req.id, e),
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE assessment_templates SET is_active = 0, deleted_at = ? WHERE id = ?",
        (now_rfc3339(), &template_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    audit::log_activity(
        conn,
        &school_id,
        &user_id,
        "template.delete",
        json!({ "templateId": template_id }),
    );
    ok(&req.id, json!({ "templateId": template_id }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (_user_id, school_id) = match resolve_school_for_user(conn, &req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let include_deleted = req
        .params
        .get("includeDeleted")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let sql = "SELECT id, academic_session_id, name, description, is_active, deleted_at
         FROM assessment_templates
         WHERE school_id = ?1 AND (?2 OR deleted_at IS NULL)
         ORDER BY created_at";
    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let header_rows: Result<Vec<(String, Option<String>, String, Option<String>, i64, Option<String>)>, _> =
        stmt.query_map((&school_id, include_deleted), |row| {
            Ok((
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ))
        })
        .and_then(|it| it.collect());
    let header_rows = match header_rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut out = Vec::with_capacity(header_rows.len());
    for (id, session_id, name, description, is_active, deleted_at) in header_rows {
        let components = match templates::load_components(conn, &id) {
            Ok(v) => v,
            Err(e) => return calc_err(&req.id, e),
        };
        out.push(json!({
            "id": id,
            "sessionId": session_id,
            "name": name,
            "description": description,
            "isActive": is_active != 0,
            "deletedAt": deleted_at,
            "components": serde_json::to_value(&components).unwrap_or_default()
        }));
    }
    ok(&req.id, json!({ "templates": out }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "templates.createGlobalDefault" => Some(handle_create_global_default(state, req)),
        "templates.resolveActive" => Some(handle_resolve_active(state, req)),
        "templates.create" => Some(handle_create(state, req)),
        "templates.update" => Some(handle_update(state, req)),
        "templates.delete" => Some(handle_delete(state, req)),
        "templates.list" => Some(handle_list(state, req)),
        _ => None,
    }
}
