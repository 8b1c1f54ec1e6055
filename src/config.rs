//! Loading agent configuration (prompts + generation settings) from TOML.
//!
//! See `AgentConfig`, `Prompts` and `GenerationSettings` for the expected schema.
//! Every section is optional; missing values fall back to the defaults below.

use serde::Deserialize;
use tracing::{error, info, warn};

use crate::domain::QuestionType;

#[derive(Clone, Debug, Deserialize, Default)]
pub struct AgentConfig {
  #[serde(default)]
  pub prompts: Prompts,
  #[serde(default)]
  pub generation: GenerationSettings,
}

/// Knobs for one generation run.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationSettings {
  /// Agent round trips allowed per run, corrective cycles included.
  pub max_steps: usize,
  /// Silence between the sections of a comprehension recording.
  pub section_gap_secs: u32,
  /// Silence after each dialogue turn.
  pub turn_gap_secs: u32,
  pub temperature: f32,
}

impl Default for GenerationSettings {
  fn default() -> Self {
    Self { max_steps: 16, section_gap_secs: 2, turn_gap_secs: 1, temperature: 0.9 }
  }
}

/// Longest silence a recording may contain between two segments.
pub const MAX_GAP_SECS: u32 = 30;

impl GenerationSettings {
  /// Clamp values that would make runs or recordings degenerate.
  pub fn sanitized(self) -> Self {
    let clamped = Self {
      max_steps: self.max_steps.max(1),
      section_gap_secs: self.section_gap_secs.min(MAX_GAP_SECS),
      turn_gap_secs: self.turn_gap_secs.min(MAX_GAP_SECS),
      temperature: self.temperature.clamp(0.0, 2.0),
    };
    if clamped != self {
      warn!(target: "lingo_backend", configured = ?self, ?clamped, "Generation settings out of range, clamped");
    }
    clamped
  }
}

/// Prompts used by the generator, the evaluator and the conversation partner.
/// Override them in TOML to tune tone or structure.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Prompts {
  // Question generation
  pub generator_system_template: String,
  pub initial_multiple_choice: String,
  pub initial_free_text: String,
  pub initial_translation: String,
  pub initial_reading_comprehension: String,
  pub initial_listening_comprehension: String,
  // Answer evaluation
  pub evaluation_system: String,
  pub evaluation_user_template: String,
  // Conversation practice
  pub conversation_system_template: String,
}

impl Prompts {
  pub fn initial_message(&self, question_type: QuestionType) -> &str {
    match question_type {
      QuestionType::MultipleChoice => &self.initial_multiple_choice,
      QuestionType::FreeText => &self.initial_free_text,
      QuestionType::Translation => &self.initial_translation,
      QuestionType::ReadingComprehension => &self.initial_reading_comprehension,
      QuestionType::ListeningComprehension => &self.initial_listening_comprehension,
    }
  }
}

impl Default for Prompts {
  fn default() -> Self {
    Self {
      generator_system_template: "You are a question generator for language learners. \
Every question you create MUST be written in {language}, suit a learner at proficiency level {proficiency} and have difficulty {difficulty}.\n\
Additional information from the learner: {additional_info}\n\n\
You work ONLY through the provided tools. Call exactly one tool at a time, follow the instruction each tool returns, and call finish when you are told to finish up. Never answer with plain text.".into(),
      initial_multiple_choice: "Create a multiple choice question. Start by generating candidate base texts.".into(),
      initial_free_text: "Create a fill-in-the-blank question with a free text answer. Start by generating candidate base texts.".into(),
      initial_translation: "Create a sentence the learner has to translate. Generate candidate base texts, then finish.".into(),
      initial_reading_comprehension: "Create a reading comprehension exercise. Start by generating candidate topics.".into(),
      initial_listening_comprehension: "Create a listening comprehension exercise built on a dialogue between two speakers. Start by generating candidate topics.".into(),
      evaluation_system: "You are a strict but fair language teacher grading a learner's answer. Output JSON only.".into(),
      evaluation_user_template: "Language: {language}\nExercise type: {question_type}\nExercise:\n{context}\n\nLearner answer: {answer}\n\nReturn JSON: {\"correct\": boolean, \"score\": number, \"explanation\": string}\nScoring: 0-100. 'correct' = true if score >= 60. Write the explanation in English.".into(),
      conversation_system_template: "You are a friendly conversation partner helping someone practise {language} at proficiency level {proficiency}. Always reply in {language}, keep replies short and natural, and gently correct mistakes.".into(),
    }
  }
}

/// Attempt to load `AgentConfig` from AGENT_CONFIG_PATH. On any parsing/IO error, returns None.
pub fn load_agent_config_from_env() -> Option<AgentConfig> {
  let path = std::env::var("AGENT_CONFIG_PATH").ok()?;
  match std::fs::read_to_string(&path) {
    Ok(s) => match toml::from_str::<AgentConfig>(&s) {
      Ok(mut cfg) => {
        info!(target: "lingo_backend", %path, "Loaded agent config (TOML)");
        cfg.generation = cfg.generation.sanitized();
        Some(cfg)
      }
      Err(e) => {
        error!(target: "lingo_backend", %path, error = %e, "Failed to parse TOML config");
        None
      }
    },
    Err(e) => {
      error!(target: "lingo_backend", %path, error = %e, "Failed to read TOML config file");
      None
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn partial_toml_keeps_defaults() {
    let cfg: AgentConfig = toml::from_str(
      r#"
      [generation]
      max_steps = 30

      [prompts]
      initial_translation = "Translate this."
      "#,
    )
    .unwrap();
    assert_eq!(cfg.generation.max_steps, 30);
    assert_eq!(cfg.generation.section_gap_secs, 2);
    assert_eq!(cfg.prompts.initial_message(QuestionType::Translation), "Translate this.");
    assert_eq!(cfg.prompts.evaluation_system, Prompts::default().evaluation_system);
  }

  #[test]
  fn empty_toml_is_all_defaults() {
    let cfg: AgentConfig = toml::from_str("").unwrap();
    assert_eq!(cfg.generation, GenerationSettings::default());
    assert!(cfg.prompts.generator_system_template.contains("{language}"));
  }

  #[test]
  fn out_of_range_settings_are_clamped() {
    let cfg: AgentConfig = toml::from_str(
      r#"
      [generation]
      max_steps = 0
      section_gap_secs = 4000000000
      turn_gap_secs = 3
      "#,
    )
    .unwrap();
    let s = cfg.generation.sanitized();
    assert_eq!(s.max_steps, 1);
    assert_eq!(s.section_gap_secs, MAX_GAP_SECS);
    assert_eq!(s.turn_gap_secs, 3);
    assert_eq!(GenerationSettings::default().sanitized(), GenerationSettings::default());
  }
}
