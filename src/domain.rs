//! Domain models used by the backend: question types, generation requests and
//! the finished question records handed to learners.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::question::GenerationError;

/// Which exercise is the agent asked to build?
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionType {
  MultipleChoice,
  FreeText,
  Translation,
  ReadingComprehension,
  ListeningComprehension,
}

impl QuestionType {
  #[cfg(test)]
  pub const ALL: [QuestionType; 5] = [
    QuestionType::MultipleChoice,
    QuestionType::FreeText,
    QuestionType::Translation,
    QuestionType::ReadingComprehension,
    QuestionType::ListeningComprehension,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      QuestionType::MultipleChoice => "multiple_choice",
      QuestionType::FreeText => "free_text",
      QuestionType::Translation => "translation",
      QuestionType::ReadingComprehension => "reading_comprehension",
      QuestionType::ListeningComprehension => "listening_comprehension",
    }
  }

  /// Only comprehension exercises can be rendered as audio.
  pub fn supports_audio(&self) -> bool {
    matches!(self, QuestionType::ReadingComprehension | QuestionType::ListeningComprehension)
  }
}

impl std::fmt::Display for QuestionType {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Mode flags that change what a generation produces.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtraParameters {
  /// Synthesize the comprehension exercise as audio in `finish`.
  #[serde(default)] pub audio_mode: bool,
  /// Registered speech provider name; `None` means the default one.
  #[serde(default)] pub tts_provider: Option<String>,
}

/// One request for a question. Immutable once issued.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationRequest {
  pub question_type: QuestionType,
  pub language: String,
  pub proficiency: String,
  pub difficulty: String,
  pub additional_info: String,
  pub extra: Option<ExtraParameters>,
}

// Unit separator between fingerprint fields so ("ab", "c") and ("a", "bc") differ.
const FINGERPRINT_SEPARATOR: char = '\u{1f}';

impl GenerationRequest {
  pub fn new(
    question_type: QuestionType,
    language: impl Into<String>,
    proficiency: impl Into<String>,
    difficulty: impl Into<String>,
    additional_info: impl Into<String>,
  ) -> Self {
    Self {
      question_type,
      language: language.into(),
      proficiency: proficiency.into(),
      difficulty: difficulty.into(),
      additional_info: additional_info.into(),
      extra: None,
    }
  }

  pub fn with_extra(mut self, extra: ExtraParameters) -> Self {
    self.extra = Some(extra);
    self
  }

  pub fn audio_mode(&self) -> bool {
    self.question_type.supports_audio() && self.extra.as_ref().map(|e| e.audio_mode).unwrap_or(false)
  }

  pub fn tts_provider(&self) -> Option<&str> {
    self.extra.as_ref().and_then(|e| e.tts_provider.as_deref())
  }

  /// Refuse to generate when a required setting is blank.
  pub fn validate(&self) -> Result<(), GenerationError> {
    let required = [
      ("language", &self.language),
      ("proficiency", &self.proficiency),
      ("difficulty", &self.difficulty),
    ];
    for (name, value) in required {
      if value.trim().is_empty() {
        return Err(GenerationError::InvalidRequest(format!("{name} must not be empty")));
      }
    }
    Ok(())
  }

  /// Stable hash over every settings field except the question type.
  /// Extra parameters are appended in a fixed order when present.
  pub fn fingerprint(&self) -> String {
    let mut fields: Vec<String> = vec![
      self.language.clone(),
      self.proficiency.clone(),
      self.difficulty.clone(),
      self.additional_info.clone(),
    ];
    if let Some(extra) = &self.extra {
      fields.push(extra.audio_mode.to_string());
      fields.push(extra.tts_provider.clone().unwrap_or_default());
    }

    let mut hasher = Sha256::new();
    for (i, field) in fields.iter().enumerate() {
      if i > 0 {
        let mut buf = [0u8; 4];
        hasher.update(FINGERPRINT_SEPARATOR.encode_utf8(&mut buf).as_bytes());
      }
      hasher.update(field.as_bytes());
    }
    format!("{:x}", hasher.finalize())
  }
}

/// A single line of a listening-comprehension dialogue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialogueSegment {
  pub speaker_index: usize,
  pub text: String,
}

/// One earlier message of a practice conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
  /// "user" or "assistant"; anything else is treated as "user".
  pub role: String,
  pub content: String,
}

/// Mono 16-bit PCM.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AudioData {
  pub sample_rate: u32,
  pub samples: Vec<i16>,
}

impl AudioData {
  pub fn silence(sample_rate: u32, seconds: u32) -> Self {
    Self { sample_rate, samples: vec![0; Self::silence_len(sample_rate, seconds)] }
  }

  /// Sample count of `seconds` of audio, computed without `u32` overflow.
  fn silence_len(sample_rate: u32, seconds: u32) -> usize {
    (sample_rate as usize).saturating_mul(seconds as usize)
  }

  pub fn duration_secs(&self) -> f32 {
    if self.sample_rate == 0 { 0.0 } else { self.samples.len() as f32 / self.sample_rate as f32 }
  }

  /// Little-endian byte view, the layout speech providers send and clients expect.
  pub fn to_le_bytes(&self) -> Vec<u8> {
    self.samples.iter().flat_map(|s| s.to_le_bytes()).collect()
  }
}

/// A finished, complete question. Every field is present by construction.
#[derive(Clone, Debug, PartialEq)]
pub enum QuestionRecord {
  MultipleChoice {
    base_text: String,
    question_text: String,
    options: Vec<String>,
    answer_index: usize,
    hint: String,
  },
  FreeText {
    base_text: String,
    question_text: String,
    answer: String,
    hint: String,
  },
  Translation {
    base_text: String,
  },
  ReadingComprehension {
    topic: String,
    text: String,
    question: String,
    audio: Option<AudioData>,
  },
  ListeningComprehension {
    topic: String,
    speakers: Vec<String>,
    dialogue: Vec<DialogueSegment>,
    question: String,
    audio: Option<AudioData>,
  },
}

impl QuestionRecord {
  pub fn question_type(&self) -> QuestionType {
    match self {
      QuestionRecord::MultipleChoice { .. } => QuestionType::MultipleChoice,
      QuestionRecord::FreeText { .. } => QuestionType::FreeText,
      QuestionRecord::Translation { .. } => QuestionType::Translation,
      QuestionRecord::ReadingComprehension { .. } => QuestionType::ReadingComprehension,
      QuestionRecord::ListeningComprehension { .. } => QuestionType::ListeningComprehension,
    }
  }

  /// Text the learner is asked about, used as context for answer evaluation.
  pub fn evaluation_context(&self) -> String {
    match self {
      QuestionRecord::MultipleChoice { question_text, .. } => question_text.clone(),
      QuestionRecord::FreeText { question_text, .. } => question_text.clone(),
      QuestionRecord::Translation { base_text } => base_text.clone(),
      QuestionRecord::ReadingComprehension { topic, text, question, .. } => {
        format!("Topic: {topic}\nText: {text}\nQuestion: {question}")
      }
      QuestionRecord::ListeningComprehension { topic, speakers, dialogue, question, .. } => {
        let lines: Vec<String> = dialogue
          .iter()
          .map(|seg| {
            let who = speakers.get(seg.speaker_index).map(String::as_str).unwrap_or("?");
            format!("{who}: {}", seg.text)
          })
          .collect();
        format!("Topic: {topic}\nDialogue:\n{}\nQuestion: {question}", lines.join("\n"))
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn req(difficulty: &str) -> GenerationRequest {
    GenerationRequest::new(QuestionType::MultipleChoice, "French", "B1", difficulty, "")
  }

  #[test]
  fn fingerprint_is_deterministic_and_ignores_question_type() {
    let a = req("easy");
    let mut b = req("easy");
    b.question_type = QuestionType::Translation;
    assert_eq!(a.fingerprint(), b.fingerprint());
    assert_eq!(a.fingerprint().len(), 64);
  }

  #[test]
  fn fingerprint_changes_with_any_single_field() {
    let base = req("easy").fingerprint();
    assert_ne!(base, req("hard").fingerprint());
    assert_ne!(base, GenerationRequest::new(QuestionType::MultipleChoice, "German", "B1", "easy", "").fingerprint());
    assert_ne!(base, GenerationRequest::new(QuestionType::MultipleChoice, "French", "A2", "easy", "").fingerprint());
    assert_ne!(base, GenerationRequest::new(QuestionType::MultipleChoice, "French", "B1", "easy", "food").fingerprint());
    assert_ne!(base, req("easy").with_extra(ExtraParameters::default()).fingerprint());
    assert_ne!(
      req("easy").with_extra(ExtraParameters { audio_mode: true, tts_provider: None }).fingerprint(),
      req("easy").with_extra(ExtraParameters { audio_mode: false, tts_provider: None }).fingerprint(),
    );
  }

  #[test]
  fn fingerprint_separates_adjacent_fields() {
    let a = GenerationRequest::new(QuestionType::FreeText, "ab", "c", "easy", "");
    let b = GenerationRequest::new(QuestionType::FreeText, "a", "bc", "easy", "");
    assert_ne!(a.fingerprint(), b.fingerprint());
  }

  #[test]
  fn validate_rejects_blank_required_fields() {
    assert!(req("easy").validate().is_ok());
    let err = req("  ").validate().unwrap_err();
    assert!(matches!(err, GenerationError::InvalidRequest(ref m) if m.contains("difficulty")));
    let blank_lang = GenerationRequest::new(QuestionType::FreeText, "", "B1", "easy", "");
    assert!(blank_lang.validate().is_err());
  }

  #[test]
  fn audio_mode_only_applies_to_comprehension() {
    let extra = ExtraParameters { audio_mode: true, tts_provider: None };
    assert!(!req("easy").with_extra(extra.clone()).audio_mode());
    let mut reading = req("easy").with_extra(extra);
    reading.question_type = QuestionType::ReadingComprehension;
    assert!(reading.audio_mode());
  }

  #[test]
  fn silence_length_does_not_wrap() {
    assert_eq!(AudioData::silence(24_000, 2).samples.len(), 48_000);
    // 48 kHz over 100_000 s is beyond u32::MAX samples.
    assert_eq!(AudioData::silence_len(48_000, 100_000) as u64, 4_800_000_000);
    assert_eq!(AudioData::silence_len(u32::MAX, u32::MAX), (u32::MAX as usize).saturating_mul(u32::MAX as usize));
  }
}
