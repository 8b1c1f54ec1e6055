//! Question generation: the per-run scratchpad, the per-type step machine,
//! the tools the agent calls, the settings-keyed look-ahead buffer and the
//! generator that ties them together.

use thiserror::Error;

pub mod buffer;
pub mod generator;
pub mod scratchpad;
pub mod steps;
pub mod tools;

pub use buffer::QuestionBuffer;
pub use generator::QuestionGenerator;
pub use tools::ToolBox;

/// Why an attempt produced no question.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GenerationError {
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  #[error("{0} is not available")]
  Unavailable(String),
  #[error("agent did not finish within {steps} steps")]
  BudgetExhausted { steps: usize },
  #[error("question is missing required field `{field}`")]
  Incomplete { field: &'static str },
  #[error("language model call failed: {0}")]
  Llm(String),
  #[error("speech synthesis failed: {0}")]
  Speech(String),
}

/// Scratchpad keys. Each tool writes only its own keys.
pub mod field {
  pub const BASE_TEXT: &str = "question_base_text";
  pub const BASE_TEXT_FOCUS: &str = "question_base_text_focus";
  pub const QUESTION_TEXT: &str = "question_text";
  pub const ANSWER: &str = "question_answer";
  pub const HINT: &str = "question_hint";
  pub const OPTIONS: &str = "question_options";
  pub const ANSWER_INDEX: &str = "question_answer_index";
  pub const TOPIC: &str = "comprehension_topic";
  pub const SPEAKERS: &str = "comprehension_speakers";
  pub const TEXT: &str = "comprehension_text";
  pub const DIALOGUE: &str = "comprehension_dialogue";
  pub const QUESTION: &str = "comprehension_question";
  pub const AUDIO: &str = "audio_data";
}

/// Token the agent puts where the answer was cut out of the base text.
pub const PLACEHOLDER: &str = "___";
