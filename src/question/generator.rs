//! Orchestrates agent runs into a lazy stream of questions.
//!
//! Each call serves at most one question to the caller and tops the buffer up
//! by exactly one: a buffer hit costs one refill run, a miss costs one run for
//! the caller plus one refill run. The refill only starts once the consumer
//! polls past the first item.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::Stream;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{info, instrument, warn};

use crate::agent::AgentRunner;
use crate::config::{GenerationSettings, Prompts};
use crate::domain::{GenerationRequest, QuestionRecord};
use crate::question::tools::AudioSettings;
use crate::question::{GenerationError, QuestionBuffer, ToolBox};
use crate::speech::{Gaps, SpeechSynthesizer, DEFAULT_TTS_PROVIDER};
use crate::util::fill_template;

#[derive(Clone)]
pub struct QuestionGenerator {
  agent: Arc<dyn AgentRunner>,
  prompts: Arc<Prompts>,
  settings: GenerationSettings,
  synthesizers: HashMap<String, Arc<dyn SpeechSynthesizer>>,
}

impl QuestionGenerator {
  pub fn new(agent: Arc<dyn AgentRunner>, prompts: Arc<Prompts>, settings: GenerationSettings) -> Self {
    Self { agent, prompts, settings, synthesizers: HashMap::new() }
  }

  /// Register a speech provider under the name requests use in `tts_provider`.
  pub fn with_synthesizer(mut self, name: impl Into<String>, synth: Arc<dyn SpeechSynthesizer>) -> Self {
    self.synthesizers.insert(name.into(), synth);
    self
  }

  fn audio_settings(&self, request: &GenerationRequest) -> Result<Option<AudioSettings>, GenerationError> {
    if !request.audio_mode() {
      return Ok(None);
    }
    let name = request.tts_provider().unwrap_or(DEFAULT_TTS_PROVIDER);
    match self.synthesizers.get(name) {
      Some(synth) => Ok(Some(AudioSettings {
        synth: synth.clone(),
        language: request.language.clone(),
        gaps: Gaps { section_secs: self.settings.section_gap_secs, turn_secs: self.settings.turn_gap_secs },
      })),
      None if self.synthesizers.is_empty() => Err(GenerationError::Unavailable("speech synthesis".into())),
      None => Err(GenerationError::InvalidRequest(format!("unknown tts provider `{name}`"))),
    }
  }

  fn system_prompt(&self, request: &GenerationRequest) -> String {
    let additional = if request.additional_info.trim().is_empty() { "none" } else { request.additional_info.as_str() };
    fill_template(
      &self.prompts.generator_system_template,
      &[
        ("language", &request.language),
        ("proficiency", &request.proficiency),
        ("difficulty", &request.difficulty),
        ("additional_info", additional),
      ],
    )
  }

  /// One complete agent run with a fresh scratchpad.
  #[instrument(level = "info", target = "question", skip_all, fields(question_type = %request.question_type, audio = audio.is_some()))]
  async fn run_once(&self, request: &GenerationRequest, audio: Option<AudioSettings>) -> Result<QuestionRecord, GenerationError> {
    let mut tools = ToolBox::new(request.question_type, StdRng::from_entropy(), audio);
    let system = self.system_prompt(request);
    let initial = self.prompts.initial_message(request.question_type);
    self.agent.run(&system, initial, &mut tools, self.settings.max_steps).await?;
    tools.into_record()
  }

  /// Lazily yield the question for `request`: a buffered one generated under
  /// the same settings when available, otherwise a fresh one. After the first
  /// item the stream generates one more question into `buffer` and ends.
  ///
  /// Invalid requests and a failed run for the caller yield a single `Err`.
  /// A failed refill is logged and leaves the buffer untouched.
  pub fn generate(
    &self,
    buffer: Arc<QuestionBuffer>,
    request: GenerationRequest,
  ) -> impl Stream<Item = Result<QuestionRecord, GenerationError>> + Send + 'static {
    let this = self.clone();
    async_stream::stream! {
      if let Err(e) = request.validate() {
        yield Err(e);
        return;
      }
      let audio = match this.audio_settings(&request) {
        Ok(a) => a,
        Err(e) => {
          yield Err(e);
          return;
        }
      };
      let question_type = request.question_type;
      let fingerprint = request.fingerprint();

      let buffered = if buffer.is_empty(question_type).await {
        None
      } else {
        buffer.take(question_type, &fingerprint).await
      };
      if let Some(hit) = buffered {
        info!(target: "question", %question_type, "Serving buffered question");
        yield Ok(hit);
      } else {
        match this.run_once(&request, audio.clone()).await {
          Ok(record) => {
            info!(target: "question", %question_type, "Serving freshly generated question");
            yield Ok(record);
          }
          Err(e) => {
            warn!(target: "question", %question_type, error = %e, "Generation failed");
            yield Err(e);
            return;
          }
        }
      }

      match this.run_once(&request, audio).await {
        Ok(record) => {
          buffer.put(question_type, record, fingerprint).await;
          info!(target: "question", %question_type, "Buffer refilled");
        }
        Err(e) => warn!(target: "question", %question_type, error = %e, "Buffer refill failed"),
      }
    }
  }
}
