use super::handlers;
use super::types::{AppState, Request};
use crate::ipc::error::err;

pub fn handle_request(state: &mut AppState, req: Request) -> serde_json::Value {
    if let Some(resp) = handlers::core::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::setup::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::enrollments::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::templates::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::structures::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::scores::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::grading::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::results::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::promotions::try_handle(state, &req) {
        return resp;
    }
    if let Some(resp) = handlers::backup_exchange::try_handle(state, &req) {
        return resp;
    }

    err(
        &req.id,
        "not_implemented",
        format!("unknown method: {}", req.method),
        None,
    )
}
