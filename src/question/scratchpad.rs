//! Per-run key-value store the tools write into, plus extraction of the
//! finished `QuestionRecord` once the run reaches its terminal step.

use std::collections::HashMap;

use crate::domain::{AudioData, DialogueSegment, QuestionRecord, QuestionType};
use crate::question::{field, GenerationError};

#[derive(Clone, Debug, PartialEq)]
pub enum ScratchValue {
  Text(String),
  List(Vec<String>),
  Index(usize),
  Dialogue(Vec<DialogueSegment>),
  Audio(AudioData),
}

/// Scoped to exactly one agent run. Tool calls within a run are sequential,
/// so plain ownership (`&mut`) is all the synchronization needed.
#[derive(Debug, Default)]
pub struct Scratchpad {
  values: HashMap<String, ScratchValue>,
}

impl Scratchpad {
  pub fn new() -> Self { Self::default() }

  pub fn set(&mut self, key: impl Into<String>, value: ScratchValue) {
    self.values.insert(key.into(), value);
  }

  pub fn contains(&self, key: &str) -> bool {
    self.values.contains_key(key)
  }

  pub fn text(&self, key: &str) -> Option<&str> {
    match self.values.get(key) {
      Some(ScratchValue::Text(s)) => Some(s),
      _ => None,
    }
  }

  pub fn list(&self, key: &str) -> Option<&[String]> {
    match self.values.get(key) {
      Some(ScratchValue::List(v)) => Some(v),
      _ => None,
    }
  }

  pub fn index(&self, key: &str) -> Option<usize> {
    match self.values.get(key) {
      Some(ScratchValue::Index(i)) => Some(*i),
      _ => None,
    }
  }

  pub fn dialogue(&self, key: &str) -> Option<&[DialogueSegment]> {
    match self.values.get(key) {
      Some(ScratchValue::Dialogue(d)) => Some(d),
      _ => None,
    }
  }

  pub fn audio(&self, key: &str) -> Option<&AudioData> {
    match self.values.get(key) {
      Some(ScratchValue::Audio(a)) => Some(a),
      _ => None,
    }
  }

  fn require_text(&self, key: &'static str) -> Result<String, GenerationError> {
    self.text(key).map(str::to_string).ok_or(GenerationError::Incomplete { field: key })
  }

  fn require_list(&self, key: &'static str) -> Result<Vec<String>, GenerationError> {
    self.list(key).map(<[String]>::to_vec).ok_or(GenerationError::Incomplete { field: key })
  }

  /// Build the record for `question_type`. Any missing required field is an
  /// `Incomplete` error; a partially built record never leaves this function.
  pub fn extract(&self, question_type: QuestionType) -> Result<QuestionRecord, GenerationError> {
    let record = match question_type {
      QuestionType::MultipleChoice => QuestionRecord::MultipleChoice {
        base_text: self.require_text(field::BASE_TEXT)?,
        question_text: self.require_text(field::QUESTION_TEXT)?,
        options: self.require_list(field::OPTIONS)?,
        answer_index: self.index(field::ANSWER_INDEX).ok_or(GenerationError::Incomplete { field: field::ANSWER_INDEX })?,
        hint: self.require_text(field::HINT)?,
      },
      QuestionType::FreeText => QuestionRecord::FreeText {
        base_text: self.require_text(field::BASE_TEXT)?,
        question_text: self.require_text(field::QUESTION_TEXT)?,
        answer: self.require_text(field::ANSWER)?,
        hint: self.require_text(field::HINT)?,
      },
      QuestionType::Translation => QuestionRecord::Translation {
        base_text: self.require_text(field::BASE_TEXT)?,
      },
      QuestionType::ReadingComprehension => QuestionRecord::ReadingComprehension {
        topic: self.require_text(field::TOPIC)?,
        text: self.require_text(field::TEXT)?,
        question: self.require_text(field::QUESTION)?,
        audio: self.audio(field::AUDIO).cloned(),
      },
      QuestionType::ListeningComprehension => QuestionRecord::ListeningComprehension {
        topic: self.require_text(field::TOPIC)?,
        speakers: self.require_list(field::SPEAKERS)?,
        dialogue: self
          .dialogue(field::DIALOGUE)
          .map(<[DialogueSegment]>::to_vec)
          .ok_or(GenerationError::Incomplete { field: field::DIALOGUE })?,
        question: self.require_text(field::QUESTION)?,
        audio: self.audio(field::AUDIO).cloned(),
      },
    };
    Ok(record)
  }
}
