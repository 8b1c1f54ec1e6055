//! Minimal OpenAI client for our use-cases.
//!
//! We call chat.completions (plain text, strict JSON object, or tool calling),
//! audio/speech for raw PCM and audio/transcriptions for speech-to-text.
//! Calls are instrumented and log model names, latencies, and response sizes (not contents).
//!
//! NOTE: We never log the API key and we keep payload truncations short to avoid PII leaks.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error, info, instrument};

use crate::config::Prompts;
use crate::domain::ChatTurn;
use crate::util::{fill_template, trunc_for_log};

const UA: &str = "lingo-backend/0.1";

#[derive(Clone)]
pub struct OpenAI {
  pub client: reqwest::Client,
  pub api_key: String,
  pub base_url: String,
  pub fast_model: String,
  pub strong_model: String,
  pub tts_model: String,
  pub transcribe_model: String,
}

/// A function call requested by the model.
#[derive(Clone, Debug, PartialEq)]
pub struct ToolCall {
  pub id: String,
  pub name: String,
  pub arguments: Value,
}

/// One assistant message from a tool-calling completion.
#[derive(Clone, Debug)]
pub struct AssistantTurn {
  pub content: Option<String>,
  pub tool_calls: Vec<ToolCall>,
  /// The message as returned, to be appended to the conversation verbatim.
  pub message: Value,
}

impl OpenAI {
  /// Construct the client if we find OPENAI_API_KEY; otherwise return None.
  pub fn from_env() -> Option<Self> {
    let api_key = std::env::var("OPENAI_API_KEY").ok()?;
    let base_url =
      std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com/v1".into());
    let fast_model =
      std::env::var("OPENAI_FAST_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into());
    let strong_model =
      std::env::var("OPENAI_STRONG_MODEL").unwrap_or_else(|_| "gpt-4o".into());
    let tts_model =
      std::env::var("OPENAI_TTS_MODEL").unwrap_or_else(|_| "gpt-4o-mini-tts".into());
    let transcribe_model =
      std::env::var("OPENAI_TRANSCRIBE_MODEL").unwrap_or_else(|_| "whisper-1".into());

    // Speech and tool-calling rounds run longer than a single short completion.
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(60))
      .build()
      .ok()?;

    Some(Self { client, api_key, base_url, fast_model, strong_model, tts_model, transcribe_model })
  }

  /// POST a JSON body and turn non-2xx answers into a readable error.
  async fn post_json<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<reqwest::Response, String> {
    let url = format!("{}{}", self.base_url, path);
    let res = self.client.post(&url)
      .header(USER_AGENT, UA)
      .header(CONTENT_TYPE, "application/json")
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .json(body).send().await.map_err(|e| e.to_string())?;
    check_status(res).await
  }

  async fn chat(&self, req: &ChatCompletionRequest) -> Result<String, String> {
    let res = self.post_json("/chat/completions", req).await?;
    let body: ChatCompletionResponse = res.json().await.map_err(|e| e.to_string())?;
    if let Some(usage) = &body.usage {
      info!(prompt_tokens = ?usage.prompt_tokens, completion_tokens = ?usage.completion_tokens, total_tokens = ?usage.total_tokens, "OpenAI usage");
    }
    Ok(body.choices.first().and_then(|c| c.message.content.clone()).unwrap_or_default())
  }

  /// Plain-text chat completion over a full message list.
  #[instrument(level = "info", skip(self, messages), fields(model = %model, messages = messages.len()))]
  async fn chat_messages(&self, model: &str, messages: Vec<ChatMessageReq>, temperature: f32) -> Result<String, String> {
    let req = ChatCompletionRequest {
      model: model.to_string(),
      messages,
      temperature,
      response_format: None,
      max_tokens: None,
    };
    Ok(self.chat(&req).await?.trim().to_string())
  }

  /// JSON-object chat completion. Generic over the target type T.
  #[instrument(level = "info", skip(self, system, user), fields(model = %model))]
  async fn chat_json<T: for<'a> Deserialize<'a>>(
    &self,
    model: &str,
    system: &str,
    user: &str,
    temperature: f32,
  ) -> Result<T, String> {
    let req = ChatCompletionRequest {
      model: model.to_string(),
      messages: vec![ChatMessageReq::new("system", system), ChatMessageReq::new("user", user)],
      temperature,
      response_format: Some(ResponseFormat { r#type: "json_object".into() }),
      max_tokens: None,
    };
    let text = self.chat(&req).await?;
    serde_json::from_str::<T>(&text).map_err(|e| format!("JSON parse error: {}", e))
  }

  /// One tool-calling round trip. `messages` and `tools` are passed through in
  /// OpenAI's wire format; the assistant message comes back parsed.
  #[instrument(level = "info", skip(self, messages, tools), fields(model = %self.strong_model, messages = messages.len(), tools = tools.len()))]
  pub async fn chat_with_tools(&self, messages: &[Value], tools: &[Value], temperature: f32) -> Result<AssistantTurn, String> {
    let req = json!({
      "model": self.strong_model,
      "messages": messages,
      "tools": tools,
      "tool_choice": "auto",
      "temperature": temperature,
    });
    let start = std::time::Instant::now();
    let res = self.post_json("/chat/completions", &req).await?;
    let data: Value = res.json().await.map_err(|e| e.to_string())?;
    let turn = parse_assistant_turn(&data)?;
    debug!(elapsed = ?start.elapsed(), tool_calls = turn.tool_calls.len(), has_text = turn.content.is_some(), "Tool round trip");
    Ok(turn)
  }

  /// Text-to-speech as raw 16-bit little-endian mono PCM at 24 kHz.
  #[instrument(level = "info", skip(self, text), fields(model = %self.tts_model, text_len = text.len(), %voice))]
  pub async fn speech_pcm(&self, text: &str, voice: &str, language: &str) -> Result<Vec<u8>, String> {
    let req = json!({
      "model": self.tts_model,
      "input": text,
      "voice": voice,
      "response_format": "pcm",
      "instructions": format!("Speak clearly in {language}."),
    });
    let res = self.post_json("/audio/speech", &req).await?;
    let bytes = res.bytes().await.map_err(|e| e.to_string())?;
    debug!(bytes = bytes.len(), "Speech received");
    Ok(bytes.to_vec())
  }

  /// Speech-to-text for an uploaded recording.
  #[instrument(level = "info", skip(self, audio), fields(model = %self.transcribe_model, bytes = audio.len(), %mime))]
  pub async fn transcribe(&self, audio: Vec<u8>, mime: &str) -> Result<String, String> {
    let url = format!("{}/audio/transcriptions", self.base_url);
    let file_part = reqwest::multipart::Part::bytes(audio)
      .file_name(format!("speech.{}", extension_for_mime(mime)))
      .mime_str(mime)
      .map_err(|e| format!("invalid mime type: {e}"))?;
    let form = reqwest::multipart::Form::new()
      .part("file", file_part)
      .text("model", self.transcribe_model.clone());

    let res = self.client.post(&url)
      .header(USER_AGENT, UA)
      .header(AUTHORIZATION, format!("Bearer {}", self.api_key))
      .multipart(form).send().await.map_err(|e| e.to_string())?;
    let res = check_status(res).await?;

    #[derive(Deserialize)]
    struct Transcript { text: String }
    let t: Transcript = res.json().await.map_err(|e| e.to_string())?;
    Ok(t.text.trim().to_string())
  }

  // --- High-level helpers (domain-specialized) ---

  /// Grade an open answer. Returns (correct, score, explanation).
  #[instrument(level = "info", skip(self, prompts, context, answer),
               fields(%language, %question_type, context_len = context.len(), answer_len = answer.len()))]
  pub async fn evaluate_answer(
    &self,
    prompts: &Prompts,
    language: &str,
    question_type: &str,
    context: &str,
    answer: &str,
  ) -> Result<(bool, f32, String), String> {
    #[derive(Deserialize)]
    struct Eval { correct: bool, score: f32, explanation: String }

    let user = fill_template(
      &prompts.evaluation_user_template,
      &[("language", language), ("question_type", question_type), ("context", context), ("answer", answer)],
    );
    let start = std::time::Instant::now();
    let result = self.chat_json::<Eval>(&self.strong_model, &prompts.evaluation_system, &user, 0.2).await;
    match result {
      Ok(e) => {
        info!(elapsed = ?start.elapsed(), correct = e.correct, score = e.score, "Answer evaluated");
        Ok((e.correct, e.score.clamp(0.0, 100.0), e.explanation))
      }
      Err(e) => {
        error!(elapsed = ?start.elapsed(), error = %e, "Model call failed during answer evaluation");
        Err(e)
      }
    }
  }

  /// Next reply of a practice conversation.
  #[instrument(level = "info", skip(self, prompts, history, message), fields(%language, turns = history.len(), msg_len = message.len()))]
  pub async fn converse(
    &self,
    prompts: &Prompts,
    language: &str,
    proficiency: &str,
    history: &[ChatTurn],
    message: &str,
  ) -> Result<String, String> {
    let system = fill_template(&prompts.conversation_system_template, &[("language", language), ("proficiency", proficiency)]);
    let messages = conversation_messages(&system, history, message);
    let reply = self.chat_messages(&self.fast_model, messages, 0.7).await?;
    debug!(reply = %trunc_for_log(&reply, 60), "Conversation reply");
    Ok(reply)
  }
}

fn conversation_messages(system: &str, history: &[ChatTurn], message: &str) -> Vec<ChatMessageReq> {
  let mut messages = Vec::with_capacity(history.len() + 2);
  messages.push(ChatMessageReq::new("system", system));
  for turn in history {
    let role = if turn.role == "assistant" { "assistant" } else { "user" };
    messages.push(ChatMessageReq::new(role, &turn.content));
  }
  messages.push(ChatMessageReq::new("user", message));
  messages
}

async fn check_status(res: reqwest::Response) -> Result<reqwest::Response, String> {
  if res.status().is_success() {
    return Ok(res);
  }
  let status = res.status();
  let body = res.text().await.unwrap_or_default();
  let msg = extract_openai_error(&body).unwrap_or(body);
  Err(format!("OpenAI HTTP {}: {}", status, msg))
}

fn extension_for_mime(mime: &str) -> &'static str {
  match mime.split(';').next().unwrap_or_default().trim() {
    "audio/wav" | "audio/x-wav" | "audio/wave" => "wav",
    "audio/mpeg" | "audio/mp3" => "mp3",
    "audio/ogg" => "ogg",
    "audio/mp4" | "audio/m4a" | "audio/x-m4a" => "m4a",
    _ => "webm",
  }
}

/// Pull the first choice's assistant message out of a completion response.
/// Tool arguments arrive as a JSON string; unparseable arguments become
/// `Value::Null` so the tool layer can answer with a correction.
fn parse_assistant_turn(data: &Value) -> Result<AssistantTurn, String> {
  let message = data
    .get("choices")
    .and_then(|c| c.get(0))
    .and_then(|c| c.get("message"))
    .cloned()
    .ok_or_else(|| "no choices in completion response".to_string())?;

  let content = message
    .get("content")
    .and_then(Value::as_str)
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_string);

  let tool_calls = message
    .get("tool_calls")
    .and_then(Value::as_array)
    .map(|calls| {
      calls
        .iter()
        .map(|tc| {
          let function = tc.get("function").cloned().unwrap_or_default();
          let arguments = match function.get("arguments") {
            Some(Value::String(s)) => serde_json::from_str(s).unwrap_or(Value::Null),
            Some(other) => other.clone(),
            None => json!({}),
          };
          ToolCall {
            id: tc.get("id").and_then(Value::as_str).unwrap_or_default().to_string(),
            name: function.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
            arguments,
          }
        })
        .collect()
    })
    .unwrap_or_default();

  Ok(AssistantTurn { content, tool_calls, message })
}

// --- Chat DTOs ---

#[derive(Serialize)]
struct ChatCompletionRequest {
  model: String,
  messages: Vec<ChatMessageReq>,
  temperature: f32,
  #[serde(skip_serializing_if = "Option::is_none")]
  response_format: Option<ResponseFormat>,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_tokens: Option<u32>,
}
#[derive(Serialize)]
struct ChatMessageReq { role: String, content: String }
impl ChatMessageReq {
  fn new(role: &str, content: &str) -> Self { Self { role: role.into(), content: content.into() } }
}
#[derive(Serialize)]
struct ResponseFormat { #[serde(rename = "type")] r#type: String }

#[derive(Deserialize)]
struct ChatCompletionResponse {
  choices: Vec<ChatChoice>,
  #[serde(default)] usage: Option<Usage>,
}
#[derive(Deserialize)]
struct ChatChoice { message: ChatMessageResp }
#[derive(Deserialize)]
struct ChatMessageResp { content: Option<String> }
#[derive(Deserialize)]
struct Usage {
  #[serde(default)] prompt_tokens: Option<u32>,
  #[serde(default)] completion_tokens: Option<u32>,
  #[serde(default)] total_tokens: Option<u32>,
}

/// Try to extract a clean error message from OpenAI error body.
fn extract_openai_error(body: &str) -> Option<String> {
  #[derive(Deserialize)]
  struct EWrap { error: EObj }
  #[derive(Deserialize)]
  struct EObj { message: String }
  serde_json::from_str::<EWrap>(body).ok().map(|w| w.error.message)
}
