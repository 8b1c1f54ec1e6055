//! Look-ahead buffer of pre-generated questions.
//!
//! One FIFO queue per question type. Every entry remembers the fingerprint of
//! the settings it was generated under; an entry taken under different
//! settings is stale and discarded.

use std::collections::{HashMap, VecDeque};

use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{QuestionRecord, QuestionType};

#[derive(Debug)]
struct BufferEntry {
  value: QuestionRecord,
  fingerprint: String,
}

/// Owned by one session; concurrent sessions never share a buffer.
#[derive(Debug, Default)]
pub struct QuestionBuffer {
  queues: Mutex<HashMap<QuestionType, VecDeque<BufferEntry>>>,
}

impl QuestionBuffer {
  pub fn new() -> Self { Self::default() }

  pub async fn is_empty(&self, question_type: QuestionType) -> bool {
    let queues = self.queues.lock().await;
    queues.get(&question_type).map_or(true, VecDeque::is_empty)
  }

  #[cfg(test)]
  pub async fn len(&self, question_type: QuestionType) -> usize {
    let queues = self.queues.lock().await;
    queues.get(&question_type).map_or(0, VecDeque::len)
  }

  /// Pop the oldest entry for `question_type`. It is returned only when it was
  /// generated under `fingerprint`; a stale entry is dropped either way.
  pub async fn take(&self, question_type: QuestionType, fingerprint: &str) -> Option<QuestionRecord> {
    let mut queues = self.queues.lock().await;
    let entry = queues.get_mut(&question_type)?.pop_front()?;
    if entry.fingerprint == fingerprint {
      Some(entry.value)
    } else {
      debug!(target: "question", %question_type, "Discarding buffered question generated under other settings");
      None
    }
  }

  pub async fn put(&self, question_type: QuestionType, value: QuestionRecord, fingerprint: String) {
    let mut queues = self.queues.lock().await;
    queues.entry(question_type).or_default().push_back(BufferEntry { value, fingerprint });
  }
}
