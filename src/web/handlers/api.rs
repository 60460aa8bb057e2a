use axum::{
    extract::{Multipart, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    Json,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

use crate::db::connector::BindingInfo;
use crate::pipeline::{run_pipeline, AskResponse};
use crate::session::DisplayPrefs;
use crate::voice::VoiceError;
use crate::web::state::AppState;

// Conversation types

#[derive(Debug, Deserialize)]
pub struct AskRequest {
    pub question: String,
}

// Voice types

#[derive(Debug, Serialize)]
pub struct VoiceResponse {
    pub transcript: String,
}

#[derive(Debug, Serialize)]
pub struct VoiceFailure {
    pub kind: String,
    pub message: String,
}

// System status

#[derive(Debug, Serialize)]
pub struct SystemStatus {
    pub version: String,
    pub uptime_seconds: i64,
    pub backend: String,
    pub model: String,
    pub database: Option<BindingInfo>,
    pub question: Option<String>,
}

// API Implementations

/// Setting a new question is the sole trigger for the pipeline; typed
/// input, suggested questions and follow-up selections all land here.
pub async fn ask(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AskRequest>,
) -> Result<Json<AskResponse>, (StatusCode, String)> {
    let question = payload.question.trim().to_string();
    if question.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "Question must not be empty".to_string()));
    }

    info!("Question: {}", question);
    state.session.write().await.set_question(question.clone());

    let response = run_pipeline(&state.assistant, &state.connector, &state.session, &question)
        .await
        .map_err(|e| {
            error!("Pipeline failure: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Query failed: {}", e),
            )
        })?;

    Ok(Json(response))
}

pub async fn suggested_questions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<String>>, (StatusCode, String)> {
    let schema = state.connector.schema_summary().await.map_err(|e| {
        error!("Failed to read schema: {}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, format!("Database error: {}", e))
    })?;

    let questions = state.assistant.generate_questions(&schema).await.map_err(|e| {
        error!("Failed to generate suggested questions: {}", e);
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Assistant error: {}", e),
        )
    })?;

    Ok(Json(questions))
}

pub async fn reset_conversation(State(state): State<Arc<AppState>>) -> StatusCode {
    state.session.write().await.reset();
    StatusCode::NO_CONTENT
}

// Database upload

pub async fn upload_database(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<BindingInfo>, (StatusCode, String)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid upload: {}", e)))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("upload.db").to_string();
        if !has_database_extension(&file_name) {
            return Err((
                StatusCode::BAD_REQUEST,
                "Expected a .db, .sqlite or .sqlite3 file".to_string(),
            ));
        }

        let bytes = field
            .bytes()
            .await
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("Invalid upload: {}", e)))?;

        info!("Received database upload: {} ({} bytes)", file_name, bytes.len());
        let binding = state.connector.bind_upload(&file_name, &bytes).map_err(|e| {
            error!("Failed to bind uploaded database: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to use uploaded database: {}", e),
            )
        })?;

        return Ok(Json(binding));
    }

    Err((StatusCode::BAD_REQUEST, "No file field in upload".to_string()))
}

fn has_database_extension(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| matches!(ext.to_lowercase().as_str(), "db" | "sqlite" | "sqlite3"))
        .unwrap_or(false)
}

// Voice input

pub async fn transcribe_voice(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<Json<VoiceResponse>, (StatusCode, Json<VoiceFailure>)> {
    let Some(transcriber) = state.transcriber.as_ref() else {
        return Err(voice_failure(
            StatusCode::NOT_IMPLEMENTED,
            "service",
            "Voice input is not configured",
        ));
    };

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        voice_failure(StatusCode::BAD_REQUEST, "service", &format!("Invalid upload: {}", e))
    })? {
        if field.name() != Some("audio") {
            continue;
        }

        let file_name = field.file_name().unwrap_or("clip.webm").to_string();
        let content_type = field
            .content_type()
            .unwrap_or("audio/webm")
            .to_string();
        let bytes = field.bytes().await.map_err(|e| {
            voice_failure(StatusCode::BAD_REQUEST, "service", &format!("Invalid upload: {}", e))
        })?;

        return match transcriber
            .transcribe(&file_name, &content_type, bytes.to_vec())
            .await
        {
            Ok(transcript) => Ok(Json(VoiceResponse { transcript })),
            Err(VoiceError::Unintelligible) => Err(voice_failure(
                StatusCode::UNPROCESSABLE_ENTITY,
                "unintelligible",
                "Sorry, I couldn't understand that.",
            )),
            Err(e) => {
                error!("Transcription failed: {}", e);
                Err(voice_failure(
                    StatusCode::BAD_GATEWAY,
                    "service",
                    "Sorry, there was an error with the speech recognition service.",
                ))
            }
        };
    }

    Err(voice_failure(
        StatusCode::BAD_REQUEST,
        "service",
        "No audio field in upload",
    ))
}

fn voice_failure(
    status: StatusCode,
    kind: &str,
    message: &str,
) -> (StatusCode, Json<VoiceFailure>) {
    (
        status,
        Json(VoiceFailure {
            kind: kind.to_string(),
            message: message.to_string(),
        }),
    )
}

// Result export

pub async fn export_results(
    State(state): State<Arc<AppState>>,
    Path(format): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let table = state
        .session
        .read()
        .await
        .table()
        .cloned()
        .ok_or((StatusCode::NOT_FOUND, "No result table to export".to_string()))?;

    let (body, content_type, file_name) = match format.as_str() {
        "json" => {
            let body = serde_json::to_string(&table.to_json_records()).map_err(|e| {
                error!("Failed to serialize export: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Export failed".to_string())
            })?;
            (body, "application/json", "query_results.json")
        }
        "csv" => {
            let body = table.to_csv().map_err(|e| {
                error!("Failed to serialize export: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Export failed".to_string())
            })?;
            (body, "text/csv", "query_results.csv")
        }
        _ => {
            return Err((
                StatusCode::BAD_REQUEST,
                "Unsupported export format".to_string(),
            ))
        }
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
    if let Ok(disposition) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", file_name))
    {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }

    Ok((headers, body))
}

// Display preferences

pub async fn get_prefs(State(state): State<Arc<AppState>>) -> Json<DisplayPrefs> {
    Json(state.session.read().await.prefs())
}

pub async fn update_prefs(
    State(state): State<Arc<AppState>>,
    Json(prefs): Json<DisplayPrefs>,
) -> Json<DisplayPrefs> {
    state.session.write().await.set_prefs(prefs);
    Json(prefs)
}

// System status

pub async fn system_status(State(state): State<Arc<AppState>>) -> Json<SystemStatus> {
    let now = chrono::Utc::now();
    let uptime = now.signed_duration_since(state.startup_time).num_seconds();
    let session = state.session.read().await;

    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: uptime,
        backend: state.config.assistant.backend.clone(),
        model: state.config.assistant.model.clone(),
        database: state.connector.current_binding(),
        question: session.question().map(|q| q.to_string()),
    })
}
