use serde_json::json;
use std::path::PathBuf;

use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::get_required_str;
use crate::ipc::types::{AppState, Request};

fn handle_export(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let out_path = match get_required_str(&req.params, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    match backup::export_workspace_bundle(&workspace, &out_path) {
        Ok(summary) => ok(
            &req.id,
            json!({
                "path": out_path.to_string_lossy(),
                "format": summary.bundle_format,
                "dbBytes": summary.db_bytes
            }),
        ),
        Err(e) => err(&req.id, "export_failed", format!("{e:#}"), None),
    }
}

fn handle_import(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let in_path = match get_required_str(&req.params, "inPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e.response(&req.id),
    };

    // Close the live connection so the database file can be swapped out.
    state.db = None;
    let summary = match backup::import_workspace_bundle(&in_path, &workspace) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "import_failed", format!("{e:#}"), None),
    };
    match db::open_db(&workspace) {
        Ok(conn) => {
            state.db = Some(conn);
            ok(&req.id, json!({ "formatDetected": summary.bundle_format_detected }))
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.export" => Some(handle_export(state, req)),
        "backup.import" => Some(handle_import(state, req)),
        _ => None,
    }
}
