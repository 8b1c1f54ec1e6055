//! WebSocket upgrade + message loop. Each client message is parsed as JSON and
//! forwarded to core logic. We reply with a single JSON message per request.
//!
//! Every connection owns a private session: its own question buffer and the
//! questions it was served.

use std::sync::Arc;
use axum::{
  extract::{
    ws::{Message, WebSocket},
    State, WebSocketUpgrade,
  },
  response::IntoResponse,
};
use tracing::{debug, error, info, instrument};

use crate::logic;
use crate::protocol::{ClientWsMessage, ServerWsMessage};
use crate::state::{AppState, Session};

#[instrument(level = "info", skip(state))]
pub async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
  info!(target: "lingo_backend", "WebSocket upgrade requested");
  ws.on_upgrade(move |socket| handle_ws(socket, state))
}

#[instrument(level = "info", skip(socket, state))]
async fn handle_ws(mut socket: WebSocket, state: Arc<AppState>) {
  let session = Session::new();
  info!(target: "lingo_backend", session = %session.id, "WebSocket connected");
  while let Some(Ok(msg)) = socket.recv().await {
    match msg {
      Message::Text(txt) => {
        let reply_msg = match serde_json::from_str::<ClientWsMessage>(&txt) {
          Ok(incoming) => {
            debug!(target: "lingo_backend", "WS received: {:?}", &incoming);
            handle_client_ws(incoming, &state, &session).await
          }
          Err(e) => ServerWsMessage::Error { message: format!("Invalid JSON: {}", e) },
        };

        let out = serde_json::to_string(&reply_msg).unwrap_or_else(|e| {
          serde_json::json!({ "type": "error", "message": format!("Serialization error: {}", e) }).to_string()
        });

        if let Err(e) = socket.send(Message::Text(out)).await {
          error!(target: "lingo_backend", error = %e, "WS send error");
          break;
        }
      }
      Message::Ping(payload) => { let _ = socket.send(Message::Pong(payload)).await; }
      Message::Close(_) => break,
      _ => {}
    }
  }
  info!(target: "lingo_backend", session = %session.id, "WebSocket disconnected");
}

#[instrument(level = "info", skip(state, session), fields(session = %session.id))]
async fn handle_client_ws(msg: ClientWsMessage, state: &AppState, session: &Session) -> ServerWsMessage {
  let error = |e: logic::ServiceError| ServerWsMessage::Error { message: e.to_string() };
  match msg {
    ClientWsMessage::Ping => ServerWsMessage::Pong,

    ClientWsMessage::NewQuestion { request } => {
      match logic::next_question(state, session, request.into_request()).await {
        Ok(question) => {
          info!(target: "question", id = %question.id, "WS new_question served");
          ServerWsMessage::Question { question }
        }
        Err(e) => error(e),
      }
    }

    ClientWsMessage::SubmitAnswer { question_id, answer } => {
      match logic::verify_answer(state, session, &question_id, &answer).await {
        Ok(result) => result.into(),
        Err(e) => error(e),
      }
    }

    ClientWsMessage::SpeechToText { audio_base64, mime } => {
      match logic::transcribe(state, &audio_base64, &mime).await {
        Ok(text) => ServerWsMessage::SpeechToText { text },
        Err(e) => error(e),
      }
    }

    ClientWsMessage::Conversation { body } => {
      match logic::converse(state, &body.language, &body.proficiency, &body.history, &body.message).await {
        Ok(text) => ServerWsMessage::ConversationReply { text },
        Err(e) => error(e),
      }
    }
  }
}
