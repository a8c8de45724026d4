//! # Model Management Handlers
//!
//! Endpoints for inspecting and steering the model slot:
//! - `GET /` - liveness message; counts as activity
//! - `GET /models` - the advertised model catalog
//! - `POST /change_model` - eagerly load a specific model
//! - `GET /status` - lifecycle snapshot

use crate::engine::MODEL_CATALOG;
use crate::error::AppError;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;

/// Query parameters for `POST /change_model`.
#[derive(Debug, Deserialize)]
pub struct ChangeModelQuery {
    pub model_size: String,
}

/// Root endpoint. Touches the activity clock without extending the life of
/// an idle model.
pub async fn root(state: web::Data<AppState>) -> HttpResponse {
    state.manager.touch();
    HttpResponse::Ok().json(json!({
        "message": "Whisper transcription service is running",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// List the model identifiers this service accepts.
pub async fn list_models(state: web::Data<AppState>) -> HttpResponse {
    let status = state.manager.status();
    HttpResponse::Ok().json(json!({
        "models": MODEL_CATALOG,
        "current_model": status.current_model,
        "default_model": status.saved_model
    }))
}

/// Eagerly switch the resident model.
///
/// Identifiers outside the catalog are rejected up front; a known identifier
/// that fails to materialize still walks the fallback chain, so the model
/// actually loaded may differ from the one requested.
pub async fn change_model(
    state: web::Data<AppState>,
    query: web::Query<ChangeModelQuery>,
) -> Result<HttpResponse, AppError> {
    let requested = query.model_size.trim();
    if !MODEL_CATALOG.contains(&requested) {
        return Err(AppError::BadRequest(format!(
            "Invalid model size: {}. Available: {}",
            requested,
            MODEL_CATALOG.join(", ")
        )));
    }

    let handle = state
        .manager
        .change_model(requested)
        .await
        .map_err(|e| AppError::ModelLoad(e.to_string()))?;

    Ok(HttpResponse::Ok().json(json!({
        "message": format!("Model changed to {}", handle.model()),
        "current_model": handle.model(),
        "device": handle.device().as_str(),
        "compute_type": handle.compute().as_str()
    })))
}

/// Lifecycle snapshot for the UI. Never blocks on a load in progress.
pub async fn get_status(state: web::Data<AppState>) -> HttpResponse {
    let mut snapshot = match serde_json::to_value(state.manager.status()) {
        Ok(value) => value,
        Err(e) => {
            return HttpResponse::InternalServerError().json(json!({
                "error": format!("Status serialization failed: {}", e)
            }))
        }
    };
    if let Some(obj) = snapshot.as_object_mut() {
        obj.insert("process_memory".to_string(), crate::health::get_memory_info());
    }
    HttpResponse::Ok().json(snapshot)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_model_query_parsing() {
        let query: ChangeModelQuery =
            serde_json::from_value(serde_json::json!({"model_size": "small"})).unwrap();
        assert_eq!(query.model_size, "small");
    }

    #[test]
    fn test_catalog_rejection_message_lists_models() {
        assert!(!MODEL_CATALOG.contains(&"enormous"));
        assert!(MODEL_CATALOG.contains(&"large-v3-turbo"));
    }
}
