//! HTTP endpoint handlers. These are thin wrappers that forward to core logic.
//! Each handler is instrumented and logs parameters and basic result info.

use std::sync::Arc;
use axum::{extract::{Path, State}, http::StatusCode, response::{IntoResponse, Response}, Json};
use tracing::{info, instrument, warn};

use crate::logic::{self, ServiceError};
use crate::protocol::*;
use crate::state::{AppState, Session};

impl IntoResponse for ServiceError {
  fn into_response(self) -> Response {
    let status = match &self {
      ServiceError::BadRequest(_) => StatusCode::BAD_REQUEST,
      ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
      ServiceError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
      ServiceError::Upstream(_) => StatusCode::BAD_GATEWAY,
    };
    warn!(target: "lingo_backend", %status, error = %self, "HTTP request failed");
    (status, Json(ErrorOut { message: self.to_string() })).into_response()
  }
}

async fn find_session(state: &AppState, id: &str) -> Result<Arc<Session>, ServiceError> {
  state
    .session(id)
    .await
    .ok_or_else(|| ServiceError::NotFound(format!("Unknown sessionId: {id}")))
}

#[instrument(level = "info", skip(state))]
pub async fn http_health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  Json(HealthOut { ok: true, openai: state.openai.is_some() })
}

#[instrument(level = "info", skip(state))]
pub async fn http_post_session(State(state): State<Arc<AppState>>) -> impl IntoResponse {
  let session = state.create_session().await;
  Json(SessionOut { session_id: session.id.clone() })
}

#[instrument(level = "info", skip(state))]
pub async fn http_delete_session(
  State(state): State<Arc<AppState>>,
  Path(session_id): Path<String>,
) -> Result<StatusCode, ServiceError> {
  if state.remove_session(&session_id).await {
    Ok(StatusCode::NO_CONTENT)
  } else {
    Err(ServiceError::NotFound(format!("Unknown sessionId: {session_id}")))
  }
}

#[instrument(level = "info", skip(state, body), fields(session = %body.session_id, question_type = %body.request.question_type))]
pub async fn http_post_question(
  State(state): State<Arc<AppState>>,
  Json(body): Json<QuestionIn>,
) -> Result<Json<QuestionOut>, ServiceError> {
  let session = find_session(&state, &body.session_id).await?;
  let out = logic::next_question(&state, &session, body.request.into_request()).await?;
  info!(target: "question", session = %session.id, id = %out.id, "HTTP question served");
  Ok(Json(out))
}

#[instrument(level = "info", skip(state, body), fields(session = %body.session_id, question = %body.question_id))]
pub async fn http_post_answer(
  State(state): State<Arc<AppState>>,
  Json(body): Json<AnswerIn>,
) -> Result<Json<AnswerOut>, ServiceError> {
  let session = find_session(&state, &body.session_id).await?;
  let out = logic::verify_answer(&state, &session, &body.question_id, &body.answer).await?;
  Ok(Json(out))
}

#[instrument(level = "info", skip(state, body), fields(text_len = body.text.len(), language = %body.language))]
pub async fn http_post_speech(
  State(state): State<Arc<AppState>>,
  Json(body): Json<SpeechIn>,
) -> Result<Json<AudioOut>, ServiceError> {
  let audio = logic::synthesize(&state, &body.text, &body.language, body.voice, body.tts_provider.as_deref()).await?;
  Ok(Json(audio))
}

#[instrument(level = "info", skip(state, body), fields(b64_len = body.audio_base64.len(), mime = %body.mime))]
pub async fn http_post_transcribe(
  State(state): State<Arc<AppState>>,
  Json(body): Json<TranscribeIn>,
) -> Result<Json<TranscribeOut>, ServiceError> {
  let text = logic::transcribe(&state, &body.audio_base64, &body.mime).await?;
  Ok(Json(TranscribeOut { text }))
}

#[instrument(level = "info", skip(state, body), fields(language = %body.language, turns = body.history.len()))]
pub async fn http_post_conversation(
  State(state): State<Arc<AppState>>,
  Json(body): Json<ConversationIn>,
) -> Result<Json<ConversationOut>, ServiceError> {
  let text = logic::converse(&state, &body.language, &body.proficiency, &body.history, &body.message).await?;
  Ok(Json(ConversationOut { text }))
}
