//! Core behaviors shared by both HTTP and WebSocket handlers.
//!
//! This includes:
//!   - Serving the next question of a session (buffer first, refill in the background)
//!   - Verifying answers (local for multiple choice and free text, LLM otherwise)
//!   - Speech synthesis, transcription and conversation practice

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use futures_util::StreamExt;
use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::domain::{ChatTurn, GenerationRequest, QuestionRecord};
use crate::protocol::{to_out, AnswerOut, AudioOut, QuestionOut, SubmittedAnswer};
use crate::question::GenerationError;
use crate::speech::DEFAULT_TTS_PROVIDER;
use crate::state::{AppState, Session};
use crate::util::normalize_answer;

/// Failures surfaced to transport handlers.
#[derive(Debug, Error)]
pub enum ServiceError {
  #[error("{0}")]
  BadRequest(String),
  #[error("{0}")]
  NotFound(String),
  #[error("{0}")]
  Unavailable(String),
  #[error("{0}")]
  Upstream(String),
}

impl From<GenerationError> for ServiceError {
  fn from(e: GenerationError) -> Self {
    match e {
      GenerationError::InvalidRequest(_) => ServiceError::BadRequest(e.to_string()),
      GenerationError::Unavailable(_) => ServiceError::Unavailable(e.to_string()),
      other => ServiceError::Upstream(other.to_string()),
    }
  }
}

fn openai_required(what: &str) -> ServiceError {
  ServiceError::Unavailable(format!("{what} requires OPENAI_API_KEY"))
}

/// Serve one question for `session`. The first item of the generation stream
/// answers the caller; the rest of the stream (the buffer refill) is drained
/// on a spawned task so the reply is not held up by it.
///
/// Requests for the same question type are serialized per session: the next
/// one starts only after the previous refill reached the buffer.
#[instrument(level = "info", skip(state, session, request), fields(session = %session.id, question_type = %request.question_type))]
pub async fn next_question(state: &AppState, session: &Session, request: GenerationRequest) -> Result<QuestionOut, ServiceError> {
  let generator = state.generator.as_ref().ok_or_else(|| openai_required("Question generation"))?;
  let language = request.language.clone();

  let claim = session.claim_refill(request.question_type).await;
  let mut stream = Box::pin(generator.generate(session.buffer.clone(), request));
  let first = stream.next().await;
  tokio::spawn(async move {
    while stream.next().await.is_some() {}
    debug!(target: "question", "Refill stream drained");
    drop(claim);
  });

  let record = match first {
    Some(Ok(record)) => record,
    Some(Err(e)) => return Err(e.into()),
    None => return Err(ServiceError::Upstream("generation produced no question".into())),
  };
  let id = session.issue(record.clone(), &language).await;
  info!(target: "question", session = %session.id, question_id = %id, "Question served");
  Ok(to_out(&id, &record))
}

/// Check a submitted answer against the question it refers to. A question is
/// answered once; it is retired from the session before grading.
#[instrument(level = "info", skip(state, session, answer), fields(session = %session.id, %question_id))]
pub async fn verify_answer(
  state: &AppState,
  session: &Session,
  question_id: &str,
  answer: &SubmittedAnswer,
) -> Result<AnswerOut, ServiceError> {
  let issued = session
    .retire(question_id)
    .await
    .ok_or_else(|| ServiceError::NotFound(format!("Unknown questionId: {question_id}")))?;

  let out = match &issued.record {
    QuestionRecord::MultipleChoice { options, answer_index, .. } => check_multiple_choice(options, *answer_index, answer),
    QuestionRecord::FreeText { answer: expected, .. } => check_free_text(expected, answer),
    record => {
      let text = answer_text(answer);
      match &state.openai {
        Some(oa) => {
          let qt = record.question_type();
          match oa.evaluate_answer(&state.prompts, &issued.language, qt.as_str(), &record.evaluation_context(), &text).await {
            Ok((correct, score, explanation)) => AnswerOut { correct, score, expected: String::new(), explanation },
            Err(e) => {
              error!(target: "question", %question_id, error = %e, "Answer evaluation failed");
              evaluation_unavailable()
            }
          }
        }
        None => evaluation_unavailable(),
      }
    }
  };
  info!(target: "question", %question_id, correct = out.correct, score = %format!("{:.1}", out.score), "Answer verified");
  Ok(out)
}

fn answer_text(answer: &SubmittedAnswer) -> String {
  match answer {
    SubmittedAnswer::Index(i) => i.to_string(),
    SubmittedAnswer::Text(t) => t.clone(),
  }
}

/// Index answers are compared directly; a text answer may name the option itself.
fn check_multiple_choice(options: &[String], answer_index: usize, answer: &SubmittedAnswer) -> AnswerOut {
  let chosen = match answer {
    SubmittedAnswer::Index(i) => Some(*i),
    SubmittedAnswer::Text(t) => t
      .trim()
      .parse::<usize>()
      .ok()
      .or_else(|| options.iter().position(|o| normalize_answer(o) == normalize_answer(t))),
  };
  let expected = options.get(answer_index).cloned().unwrap_or_default();
  let correct = chosen == Some(answer_index);
  let explanation = if correct {
    "Correct.".to_string()
  } else {
    format!("The correct option is \"{expected}\".")
  };
  AnswerOut { correct, score: if correct { 100.0 } else { 0.0 }, expected, explanation }
}

fn check_free_text(expected: &str, answer: &SubmittedAnswer) -> AnswerOut {
  let correct = normalize_answer(expected) == normalize_answer(&answer_text(answer));
  let explanation = if correct { "Correct.".to_string() } else { format!("The expected answer is \"{expected}\".") };
  AnswerOut { correct, score: if correct { 100.0 } else { 0.0 }, expected: expected.to_string(), explanation }
}

fn evaluation_unavailable() -> AnswerOut {
  AnswerOut {
    correct: false,
    score: 0.0,
    expected: String::new(),
    explanation: "Evaluation unavailable: this answer needs the language model, which is not reachable right now.".into(),
  }
}

/// Render `text` with a registered speech provider.
#[instrument(level = "info", skip(state, text), fields(text_len = text.len(), %language, ?voice))]
pub async fn synthesize(
  state: &AppState,
  text: &str,
  language: &str,
  voice: Option<usize>,
  provider: Option<&str>,
) -> Result<AudioOut, ServiceError> {
  if text.trim().is_empty() {
    return Err(ServiceError::BadRequest("text must not be empty".into()));
  }
  let name = provider.unwrap_or(DEFAULT_TTS_PROVIDER);
  let synth = match state.synthesizers.get(name) {
    Some(s) => s,
    None if state.synthesizers.is_empty() => return Err(openai_required("Speech synthesis")),
    None => return Err(ServiceError::BadRequest(format!("unknown tts provider `{name}`"))),
  };
  let audio = synth.synthesize(text, language, voice).await.map_err(ServiceError::Upstream)?;
  Ok(AudioOut::from(&audio))
}

#[instrument(level = "info", skip(state, audio_base64), fields(b64_len = audio_base64.len(), %mime))]
pub async fn transcribe(state: &AppState, audio_base64: &str, mime: &str) -> Result<String, ServiceError> {
  let oa = state.openai.as_ref().ok_or_else(|| openai_required("Speech-to-text"))?;
  let bytes = B64
    .decode(audio_base64.trim())
    .map_err(|e| ServiceError::BadRequest(format!("audioBase64 is not valid base64: {e}")))?;
  if bytes.is_empty() {
    return Err(ServiceError::BadRequest("audio must not be empty".into()));
  }
  oa.transcribe(bytes, mime).await.map_err(ServiceError::Upstream)
}

#[instrument(level = "info", skip(state, history, message), fields(%language, turns = history.len()))]
pub async fn converse(
  state: &AppState,
  language: &str,
  proficiency: &str,
  history: &[ChatTurn],
  message: &str,
) -> Result<String, ServiceError> {
  if message.trim().is_empty() {
    return Err(ServiceError::BadRequest("message must not be empty".into()));
  }
  let oa = state.openai.as_ref().ok_or_else(|| openai_required("Conversation practice"))?;
  oa.converse(&state.prompts, language, proficiency, history, message).await.map_err(ServiceError::Upstream)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::{GenerationSettings, Prompts};
  use crate::domain::QuestionType;
  use crate::question::generator::tests::ScriptedAgent;
  use crate::state::build_generator;
  use std::collections::HashMap;
  use std::sync::atomic::Ordering;
  use std::sync::Arc;

  fn options() -> Vec<String> {
    vec!["manges".into(), "mange".into(), "mangez".into(), "mangent".into()]
  }

  #[test]
  fn multiple_choice_accepts_index_or_option_text() {
    assert!(check_multiple_choice(&options(), 1, &SubmittedAnswer::Index(1)).correct);
    assert!(check_multiple_choice(&options(), 1, &SubmittedAnswer::Text(" Mange ".into())).correct);
    assert!(check_multiple_choice(&options(), 1, &SubmittedAnswer::Text("1".into())).correct);
    let wrong = check_multiple_choice(&options(), 1, &SubmittedAnswer::Index(0));
    assert!(!wrong.correct);
    assert_eq!(wrong.expected, "mange");
  }

  #[test]
  fn free_text_ignores_case_and_spacing() {
    assert!(check_free_text("il pleut", &SubmittedAnswer::Text("  Il   PLEUT ".into())).correct);
    assert!(!check_free_text("il pleut", &SubmittedAnswer::Text("il neige".into())).correct);
  }

  fn offline_state() -> AppState {
    AppState::from_parts(None, Arc::new(Prompts::default()), None, HashMap::new())
  }

  #[tokio::test]
  async fn open_answers_fall_back_without_openai() {
    let state = offline_state();
    let session = state.create_session().await;
    let qid = session.issue(QuestionRecord::Translation { base_text: "Bonjour.".into() }, "French").await;
    let out = verify_answer(&state, &session, &qid, &SubmittedAnswer::Text("Hello.".into())).await.unwrap();
    assert!(!out.correct);
    assert!(out.explanation.contains("unavailable"));

    let missing = verify_answer(&state, &session, "nope", &SubmittedAnswer::Index(0)).await;
    assert!(matches!(missing, Err(ServiceError::NotFound(_))));
  }

  #[tokio::test]
  async fn providers_are_required() {
    let state = offline_state();
    let session = state.create_session().await;
    let req = GenerationRequest::new(QuestionType::Translation, "French", "B1", "easy", "");
    assert!(matches!(next_question(&state, &session, req).await, Err(ServiceError::Unavailable(_))));
    assert!(matches!(transcribe(&state, "AAAA", "audio/webm").await, Err(ServiceError::Unavailable(_))));
    assert!(matches!(converse(&state, "French", "B1", &[], "Salut").await, Err(ServiceError::Unavailable(_))));
    assert!(matches!(synthesize(&state, "Salut", "French", None, None).await, Err(ServiceError::Unavailable(_))));
  }

  fn scripted_state(agent: Arc<ScriptedAgent>) -> AppState {
    let prompts = Arc::new(Prompts::default());
    let generator = build_generator(agent, prompts.clone(), GenerationSettings::default(), &HashMap::new());
    AppState::from_parts(None, prompts, Some(generator), HashMap::new())
  }

  fn base_text(out: &QuestionOut) -> String {
    serde_json::to_value(out).unwrap()["base_text"].as_str().unwrap_or_default().to_string()
  }

  #[tokio::test]
  async fn next_question_issues_and_refills_in_background() {
    let agent = Arc::new(ScriptedAgent::default());
    let state = scripted_state(agent.clone());
    let session = state.create_session().await;

    let req = GenerationRequest::new(QuestionType::Translation, "French", "B1", "easy", "");
    let out = next_question(&state, &session, req).await.unwrap();
    assert!(session.issued(&out.id).await.is_some());

    // The claim is released only once the refill has landed.
    drop(session.claim_refill(QuestionType::Translation).await);
    assert_eq!(agent.runs.load(Ordering::SeqCst), 2);
    assert_eq!(session.buffer.len(QuestionType::Translation).await, 1);

    let bad = GenerationRequest::new(QuestionType::Translation, "", "B1", "easy", "");
    assert!(matches!(next_question(&state, &session, bad).await, Err(ServiceError::BadRequest(_))));
  }

  #[tokio::test]
  async fn back_to_back_requests_see_the_previous_refill() {
    let agent = Arc::new(ScriptedAgent::default());
    let state = scripted_state(agent.clone());
    let session = state.create_session().await;
    let req = || GenerationRequest::new(QuestionType::Translation, "French", "B1", "easy", "");

    let first = next_question(&state, &session, req()).await.unwrap();
    let second = next_question(&state, &session, req()).await.unwrap();
    assert_eq!(base_text(&first), "Phrase numéro 1.");
    assert_eq!(base_text(&second), "Phrase numéro 2.");

    drop(session.claim_refill(QuestionType::Translation).await);
    assert_eq!(agent.runs.load(Ordering::SeqCst), 3);
    assert_eq!(session.buffer.len(QuestionType::Translation).await, 1);
  }

  #[tokio::test]
  async fn answered_questions_are_retired() {
    let state = offline_state();
    let session = state.create_session().await;
    let record = QuestionRecord::FreeText {
      base_text: "Il pleut.".into(),
      question_text: "Il ___.".into(),
      answer: "pleut".into(),
      hint: "weather verb".into(),
    };
    let qid = session.issue(record, "French").await;
    let out = verify_answer(&state, &session, &qid, &SubmittedAnswer::Text("pleut".into())).await.unwrap();
    assert!(out.correct);
    assert_eq!(session.issued_count().await, 0);
    let again = verify_answer(&state, &session, &qid, &SubmittedAnswer::Text("pleut".into())).await;
    assert!(matches!(again, Err(ServiceError::NotFound(_))));
  }
}
