//! Tools exposed to the generation agent.
//!
//! Validation is pure: each `validate_*` function inspects its arguments (and,
//! where needed, a read-only scratchpad) and returns a `Command`. `ToolBox`
//! applies accepted writes, advances the step machine and answers the agent
//! with the next step's instruction. Malformed agent input never becomes an
//! error; it becomes a corrective instruction so the agent can retry.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, instrument, warn};

use crate::domain::{DialogueSegment, QuestionRecord, QuestionType};
use crate::question::scratchpad::{ScratchValue, Scratchpad};
use crate::question::steps::{Admission, Step, StepMachine};
use crate::question::{field, GenerationError, PLACEHOLDER};
use crate::speech::{listening_audio, pick_voice, reading_audio, Gaps, SpeechSynthesizer};
use crate::util::{normalize_answer, squash_whitespace};

/// Candidate lists must be at least this long so the host-side pick has room to vary.
pub const MIN_CANDIDATES: usize = 5;
pub const INCORRECT_OPTION_COUNT: usize = 3;

/// Result of validating one tool call.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
  Write(Vec<(&'static str, ScratchValue)>),
  Reject(String),
}

#[derive(Clone, Debug, Deserialize)]
pub struct BaseTextCandidate {
  pub text: String,
  #[serde(default)]
  pub focus: String,
}

pub fn validate_base_text<R: Rng + ?Sized>(candidates: &[BaseTextCandidate], rng: &mut R) -> Command {
  if candidates.len() < MIN_CANDIDATES {
    return Command::Reject(format!(
      "Please ensure that the candidates list contains at least {MIN_CANDIDATES} options."
    ));
  }
  if candidates.iter().any(|c| c.text.contains(PLACEHOLDER)) {
    return Command::Reject(
      "Your response includes the placeholder marker \"___\". Please repeat this step and ensure not to include \"___\" in any option.".into(),
    );
  }
  if candidates.iter().any(|c| c.text.trim().is_empty()) {
    return Command::Reject("Every candidate must contain a non-empty text. Please repeat this step.".into());
  }
  match candidates.choose(rng) {
    Some(chosen) => Command::Write(vec![
      (field::BASE_TEXT, ScratchValue::Text(chosen.text.trim().to_string())),
      (field::BASE_TEXT_FOCUS, ScratchValue::Text(chosen.focus.trim().to_string())),
    ]),
    None => Command::Reject("Please provide candidates.".into()),
  }
}

pub fn validate_placeholder_question(pad: &Scratchpad, question_text: &str, answer: &str) -> Command {
  let occurrences = question_text.matches(PLACEHOLDER).count();
  if occurrences == 0 {
    return Command::Reject(
      "Your question text was malformed and does not contain the placeholder for the answer which is: \"___\". Please correct this.".into(),
    );
  }
  if occurrences > 1 {
    return Command::Reject("Your question text must contain the placeholder \"___\" exactly once. Please correct this.".into());
  }
  let answer = answer.trim();
  if answer.is_empty() {
    return Command::Reject("The answer must be the part of the text you replaced with \"___\" and must not be empty.".into());
  }
  let Some(base) = pad.text(field::BASE_TEXT) else {
    return Command::Reject("There is no base text yet. Call create_base_text first.".into());
  };
  let restored = question_text.replacen(PLACEHOLDER, answer, 1);
  if squash_whitespace(&restored) != squash_whitespace(base) {
    return Command::Reject(format!(
      "Putting the answer \"{answer}\" back in place of \"___\" does not give the base text:\n\n```\n{base}\n```\n\nKeep the base text unchanged and replace only the answer with \"___\"."
    ));
  }
  Command::Write(vec![
    (field::QUESTION_TEXT, ScratchValue::Text(question_text.trim().to_string())),
    (field::ANSWER, ScratchValue::Text(answer.to_string())),
  ])
}

pub fn validate_hint(hint: &str) -> Command {
  let hint = hint.trim();
  if hint.is_empty() {
    return Command::Reject("The hint must not be empty.".into());
  }
  if hint.contains('\n') {
    return Command::Reject(
      "The hint MUST not contain newline characters. If you want to separate multiple keypoints use commas.".into(),
    );
  }
  Command::Write(vec![(field::HINT, ScratchValue::Text(hint.to_string()))])
}

/// Insert `answer` at a uniformly random slot among the distractors and
/// return the options together with the answer's index.
pub fn insert_answer<R: Rng + ?Sized>(rng: &mut R, answer: &str, distractors: &[String]) -> (Vec<String>, usize) {
  let mut options = distractors.to_vec();
  let index = rng.gen_range(0..=options.len());
  options.insert(index, answer.to_string());
  (options, index)
}

pub fn validate_incorrect_options<R: Rng + ?Sized>(pad: &Scratchpad, options: &[String], rng: &mut R) -> Command {
  if options.len() != INCORRECT_OPTION_COUNT {
    return Command::Reject(format!(
      "The options must contain exactly {INCORRECT_OPTION_COUNT} incorrect values, not more and not less. You gave {}.",
      options.len()
    ));
  }
  let Some(answer) = pad.text(field::ANSWER) else {
    return Command::Reject("There is no answer yet. Call create_question_with_placeholder first.".into());
  };
  let answer_norm = normalize_answer(answer);
  let mut seen: Vec<String> = Vec::with_capacity(options.len());
  for option in options {
    let norm = normalize_answer(option);
    if norm.is_empty() {
      return Command::Reject("The incorrect options must not be empty.".into());
    }
    if norm == answer_norm {
      return Command::Reject(format!("The incorrect options must not include the correct answer \"{answer}\"."));
    }
    if seen.contains(&norm) {
      return Command::Reject("The incorrect options must all be different from each other.".into());
    }
    seen.push(norm);
  }
  let trimmed: Vec<String> = options.iter().map(|o| o.trim().to_string()).collect();
  let (all, index) = insert_answer(rng, answer, &trimmed);
  Command::Write(vec![
    (field::OPTIONS, ScratchValue::List(all)),
    (field::ANSWER_INDEX, ScratchValue::Index(index)),
  ])
}

pub fn validate_topic<R: Rng + ?Sized>(topics: &[String], rng: &mut R) -> Command {
  if topics.len() < MIN_CANDIDATES {
    return Command::Reject(format!("Please ensure that the topics list contains at least {MIN_CANDIDATES} options."));
  }
  if topics.iter().any(|t| t.trim().is_empty()) {
    return Command::Reject("Every topic must be non-empty. Please repeat this step.".into());
  }
  match topics.choose(rng) {
    Some(topic) => Command::Write(vec![(field::TOPIC, ScratchValue::Text(topic.trim().to_string()))]),
    None => Command::Reject("Please provide topics.".into()),
  }
}

pub fn validate_speakers(speakers: &[String]) -> Command {
  if speakers.len() != 2 {
    return Command::Reject("The speakers list must contain exactly 2 names.".into());
  }
  let a = speakers[0].trim();
  let b = speakers[1].trim();
  if a.is_empty() || b.is_empty() {
    return Command::Reject("Speaker names must not be empty.".into());
  }
  if a == b {
    return Command::Reject("The two speakers must have different names.".into());
  }
  Command::Write(vec![(field::SPEAKERS, ScratchValue::List(vec![a.to_string(), b.to_string()]))])
}

pub fn validate_comprehension_text(text: &str) -> Command {
  let text = text.trim();
  if text.is_empty() {
    return Command::Reject("The text must not be empty.".into());
  }
  Command::Write(vec![(field::TEXT, ScratchValue::Text(text.to_string()))])
}

pub fn validate_dialogue(segments: &[DialogueSegment]) -> Command {
  if segments.is_empty() {
    return Command::Reject("The dialogue must contain at least one segment.".into());
  }
  if let Some(bad) = segments.iter().find(|s| s.speaker_index > 1) {
    return Command::Reject(format!(
      "speaker_index must be 0 or 1, but one segment uses {}. Please correct this.",
      bad.speaker_index
    ));
  }
  if segments.iter().any(|s| s.text.trim().is_empty()) {
    return Command::Reject("Every dialogue segment needs a non-empty text.".into());
  }
  let cleaned = segments
    .iter()
    .map(|s| DialogueSegment { speaker_index: s.speaker_index, text: s.text.trim().to_string() })
    .collect();
  Command::Write(vec![(field::DIALOGUE, ScratchValue::Dialogue(cleaned))])
}

pub fn validate_comprehension_question(question: &str) -> Command {
  let question = question.trim();
  if question.is_empty() {
    return Command::Reject("The question must not be empty.".into());
  }
  Command::Write(vec![(field::QUESTION, ScratchValue::Text(question.to_string()))])
}

// --- Tool arguments as the agent sends them ---

#[derive(Deserialize)]
struct BaseTextArgs { candidates: Vec<BaseTextCandidate> }
#[derive(Deserialize)]
struct PlaceholderArgs { question_text: String, answer: String }
#[derive(Deserialize)]
struct HintArgs { hint: String }
#[derive(Deserialize)]
struct IncorrectOptionsArgs { incorrect_options: Vec<String> }
#[derive(Deserialize)]
struct TopicArgs { topics: Vec<String> }
#[derive(Deserialize)]
struct SpeakersArgs { speakers: Vec<String> }
#[derive(Deserialize)]
struct TextArgs { text: String }
#[derive(Deserialize)]
struct DialogueArgs { segments: Vec<DialogueSegment> }
#[derive(Deserialize)]
struct QuestionArgs { question: String }

/// What the agent sees after a tool call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolReply {
  pub text: String,
  pub finished: bool,
}

impl ToolReply {
  fn next(text: String) -> Self { Self { text, finished: false } }
}

/// Speech collaborator plus the settings `finish` needs to render audio.
#[derive(Clone)]
pub struct AudioSettings {
  pub synth: Arc<dyn SpeechSynthesizer>,
  pub language: String,
  pub gaps: Gaps,
}

/// Everything one agent run may touch: its scratchpad, its step machine and
/// the randomness used for host-side choices.
pub struct ToolBox {
  machine: StepMachine,
  pad: Scratchpad,
  rng: StdRng,
  audio: Option<AudioSettings>,
}

impl ToolBox {
  pub fn new(question_type: QuestionType, rng: StdRng, audio: Option<AudioSettings>) -> Self {
    Self { machine: StepMachine::new(question_type), pad: Scratchpad::new(), rng, audio }
  }

  pub fn question_type(&self) -> QuestionType { self.machine.question_type() }

  pub fn is_finished(&self) -> bool { self.machine.is_terminal() }

  /// OpenAI-style function definitions for the steps on this type's path.
  pub fn definitions(&self) -> Vec<Value> {
    self.machine.path().iter().map(|s| definition(*s)).collect()
  }

  /// Dispatch one tool call. Only a failing speech collaborator is an error;
  /// everything the agent gets wrong comes back as an instruction.
  #[instrument(level = "debug", target = "question", skip(self, args), fields(question_type = %self.question_type()))]
  pub async fn invoke(&mut self, name: &str, args: Value) -> Result<ToolReply, GenerationError> {
    if self.is_finished() {
      return Ok(ToolReply { text: "The process was finished.".into(), finished: true });
    }
    let Some(step) = Step::from_tool_name(name) else {
      warn!(target: "question", tool = %name, "Agent called an unknown tool");
      return Ok(ToolReply::next(self.machine.not_on_path_message(name)));
    };
    match self.machine.admit(step) {
      Admission::Accept => {}
      Admission::NotOnPath => return Ok(ToolReply::next(self.machine.not_on_path_message(name))),
      Admission::OutOfOrder { first } => {
        debug!(target: "question", tool = %name, expected = first.tool_name(), "Tool called out of order");
        return Ok(ToolReply::next(self.machine.out_of_order_message(step, first)));
      }
    }

    if step == Step::Finish {
      return self.finish().await;
    }

    let command = match self.validate(step, args) {
      Ok(c) => c,
      Err(e) => Command::Reject(format!(
        "The arguments for {} were malformed ({}). Please call it again with the documented parameters.",
        step.tool_name(),
        e
      )),
    };

    match command {
      Command::Reject(text) => {
        debug!(target: "question", tool = %name, "Tool input rejected");
        Ok(ToolReply::next(text))
      }
      Command::Write(writes) => {
        for (key, value) in writes {
          self.pad.set(key, value);
        }
        self.machine.complete(step);
        Ok(ToolReply::next(self.machine.next_instruction(&self.pad)))
      }
    }
  }

  fn validate(&mut self, step: Step, args: Value) -> Result<Command, serde_json::Error> {
    let rng = &mut self.rng;
    let pad = &self.pad;
    let command = match step {
      Step::BaseText => {
        let a: BaseTextArgs = serde_json::from_value(args)?;
        validate_base_text(&a.candidates, rng)
      }
      Step::PlaceholderQuestion => {
        let a: PlaceholderArgs = serde_json::from_value(args)?;
        validate_placeholder_question(pad, &a.question_text, &a.answer)
      }
      Step::Hint => validate_hint(&serde_json::from_value::<HintArgs>(args)?.hint),
      Step::IncorrectOptions => {
        let a: IncorrectOptionsArgs = serde_json::from_value(args)?;
        validate_incorrect_options(pad, &a.incorrect_options, rng)
      }
      Step::Topic => validate_topic(&serde_json::from_value::<TopicArgs>(args)?.topics, rng),
      Step::Speakers => validate_speakers(&serde_json::from_value::<SpeakersArgs>(args)?.speakers),
      Step::ComprehensionText => validate_comprehension_text(&serde_json::from_value::<TextArgs>(args)?.text),
      Step::Dialogue => validate_dialogue(&serde_json::from_value::<DialogueArgs>(args)?.segments),
      Step::ComprehensionQuestion => {
        validate_comprehension_question(&serde_json::from_value::<QuestionArgs>(args)?.question)
      }
      Step::Finish => Command::Write(Vec::new()),
    };
    Ok(command)
  }

  async fn finish(&mut self) -> Result<ToolReply, GenerationError> {
    if let Some(step) = self.machine.current().filter(|s| *s != Step::Finish) {
      let field_name = step.fields().first().copied().unwrap_or("unknown");
      return Ok(ToolReply::next(self.machine.missing_message(step, field_name)));
    }
    if let Some((step, field_name)) = self.machine.missing_before_finish(&self.pad) {
      return Ok(ToolReply::next(self.machine.missing_message(step, field_name)));
    }

    if let Some(audio) = self.audio.clone() {
      self.render_audio(&audio).await?;
    }

    self.machine.complete(Step::Finish);
    debug!(target: "question", question_type = %self.question_type(), "Question complete");
    Ok(ToolReply { text: "The process was finished.".into(), finished: true })
  }

  async fn render_audio(&mut self, audio: &AudioSettings) -> Result<(), GenerationError> {
    let count = audio.synth.voice_count(&audio.language);
    let synth = audio.synth.as_ref();
    let text = |key: &str| self.pad.text(key).unwrap_or_default().to_string();
    let rendered = match self.machine.question_type() {
      QuestionType::ReadingComprehension => {
        let narrator = pick_voice(&mut self.rng, count, &[]);
        let reader = pick_voice(&mut self.rng, count, &narrator.into_iter().collect::<Vec<_>>());
        let (topic, body, question) = (text(field::TOPIC), text(field::TEXT), text(field::QUESTION));
        reading_audio(synth, &audio.language, [narrator, reader], &topic, &body, &question, audio.gaps).await
      }
      QuestionType::ListeningComprehension => {
        let first = pick_voice(&mut self.rng, count, &[]);
        let taken: Vec<usize> = first.into_iter().collect();
        let second = pick_voice(&mut self.rng, count, &taken);
        let taken: Vec<usize> = first.into_iter().chain(second).collect();
        let narrator = pick_voice(&mut self.rng, count, &taken);
        let (topic, question) = (text(field::TOPIC), text(field::QUESTION));
        let dialogue = self.pad.dialogue(field::DIALOGUE).unwrap_or_default().to_vec();
        listening_audio(synth, &audio.language, [narrator, first, second], &topic, &dialogue, &question, audio.gaps)
          .await
      }
      _ => return Ok(()),
    };
    let data = rendered.map_err(GenerationError::Speech)?;
    self.pad.set(field::AUDIO, ScratchValue::Audio(data));
    Ok(())
  }

  /// The finished record. Fails unless the run reached its terminal step.
  pub fn into_record(self) -> Result<QuestionRecord, GenerationError> {
    if let Some(step) = self.machine.current() {
      let field_name = step.fields().first().copied().unwrap_or("finish");
      return Err(GenerationError::Incomplete { field: field_name });
    }
    self.pad.extract(self.machine.question_type())
  }
}

fn definition(step: Step) -> Value {
  let (description, parameters) = match step {
    Step::BaseText => (
      "Register the base text of the question. Give at least five candidate sentences, each with the grammar structure it focuses on; one will be selected. No candidate may contain \"___\".",
      json!({
        "type": "object",
        "properties": {
          "candidates": {
            "type": "array",
            "minItems": MIN_CANDIDATES,
            "items": {
              "type": "object",
              "properties": {
                "text": { "type": "string" },
                "focus": { "type": "string", "description": "Grammar structure this sentence focuses on." }
              },
              "required": ["text", "focus"]
            }
          }
        },
        "required": ["candidates"]
      }),
    ),
    Step::PlaceholderQuestion => (
      "Register the question. question_text MUST be the base text with one grammatically interesting part replaced by \"___\"; the replaced part MUST be given as answer.",
      json!({
        "type": "object",
        "properties": {
          "question_text": { "type": "string" },
          "answer": { "type": "string" }
        },
        "required": ["question_text", "answer"]
      }),
    ),
    Step::Hint => (
      "Register a hint in english that helps answering, written as comma separated keypoints on one line.",
      json!({
        "type": "object",
        "properties": { "hint": { "type": "string" } },
        "required": ["hint"]
      }),
    ),
    Step::IncorrectOptions => (
      "Register exactly three incorrect options for the multiple choice question. They must not include the correct answer.",
      json!({
        "type": "object",
        "properties": {
          "incorrect_options": {
            "type": "array",
            "items": { "type": "string" },
            "minItems": INCORRECT_OPTION_COUNT,
            "maxItems": INCORRECT_OPTION_COUNT
          }
        },
        "required": ["incorrect_options"]
      }),
    ),
    Step::Topic => (
      "Register at least five diverse candidate topics; one will be selected.",
      json!({
        "type": "object",
        "properties": {
          "topics": { "type": "array", "items": { "type": "string" }, "minItems": MIN_CANDIDATES }
        },
        "required": ["topics"]
      }),
    ),
    Step::Speakers => (
      "Register the names of the two speakers of the dialogue.",
      json!({
        "type": "object",
        "properties": {
          "speakers": { "type": "array", "items": { "type": "string" }, "minItems": 2, "maxItems": 2 }
        },
        "required": ["speakers"]
      }),
    ),
    Step::ComprehensionText => (
      "Register the text for the chosen topic. It must not start with the topic.",
      json!({
        "type": "object",
        "properties": { "text": { "type": "string" } },
        "required": ["text"]
      }),
    ),
    Step::Dialogue => (
      "Register the dialogue as an ordered list of segments. speaker_index is 0 for the first speaker and 1 for the second.",
      json!({
        "type": "object",
        "properties": {
          "segments": {
            "type": "array",
            "items": {
              "type": "object",
              "properties": {
                "speaker_index": { "type": "integer", "enum": [0, 1] },
                "text": { "type": "string" }
              },
              "required": ["speaker_index", "text"]
            }
          }
        },
        "required": ["segments"]
      }),
    ),
    Step::ComprehensionQuestion => (
      "Register a question about the text.",
      json!({
        "type": "object",
        "properties": { "question": { "type": "string" } },
        "required": ["question"]
      }),
    ),
    Step::Finish => (
      "Finish the generation. This must be called at the end of every process.",
      json!({ "type": "object", "properties": {} }),
    ),
  };
  json!({
    "type": "function",
    "function": { "name": step.tool_name(), "description": description, "parameters": parameters }
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::speech::tests::FakeSpeech;
  use rand::SeedableRng;

  fn rng() -> StdRng { StdRng::seed_from_u64(42) }

  fn candidates(n: usize) -> Vec<BaseTextCandidate> {
    (0..n).map(|i| BaseTextCandidate { text: format!("Je mange la pomme {i}."), focus: "present tense".into() }).collect()
  }

  fn pad_with(pairs: &[(&'static str, &str)]) -> Scratchpad {
    let mut pad = Scratchpad::new();
    for (k, v) in pairs {
      pad.set(*k, ScratchValue::Text(v.to_string()));
    }
    pad
  }

  #[test]
  fn base_text_needs_five_candidates_without_placeholder() {
    assert!(matches!(validate_base_text(&candidates(4), &mut rng()), Command::Reject(_)));
    let mut bad = candidates(5);
    bad[3].text = "Je ___ la pomme.".into();
    assert!(matches!(validate_base_text(&bad, &mut rng()), Command::Reject(m) if m.contains("___")));
  }

  #[test]
  fn base_text_choice_covers_every_candidate() {
    let cands = candidates(5);
    let mut rng = rng();
    let mut seen = std::collections::HashSet::new();
    for _ in 0..200 {
      if let Command::Write(writes) = validate_base_text(&cands, &mut rng) {
        if let ScratchValue::Text(t) = &writes[0].1 {
          seen.insert(t.clone());
        }
      }
    }
    assert_eq!(seen.len(), 5);
  }

  #[test]
  fn placeholder_must_restore_the_base_text() {
    let pad = pad_with(&[(field::BASE_TEXT, "Je mange une pomme.")]);
    assert!(matches!(validate_placeholder_question(&pad, "Je mange une pomme.", "mange"), Command::Reject(_)));
    assert!(matches!(validate_placeholder_question(&pad, "Je ___ une ___.", "mange"), Command::Reject(_)));
    assert!(matches!(validate_placeholder_question(&pad, "Je ___ une pomme.", "bois"), Command::Reject(_)));
    assert!(matches!(validate_placeholder_question(&pad, "Je ___ une pomme.", "  "), Command::Reject(_)));

    match validate_placeholder_question(&pad, "Je  ___ une pomme.", " mange ") {
      Command::Write(writes) => {
        let question = match &writes[0].1 { ScratchValue::Text(t) => t.clone(), _ => unreachable!() };
        assert_eq!(question.matches(PLACEHOLDER).count(), 1);
        assert_ne!(question, "Je mange une pomme.");
        assert_eq!(writes[1], (field::ANSWER, ScratchValue::Text("mange".into())));
      }
      Command::Reject(m) => panic!("rejected: {m}"),
    }
  }

  #[test]
  fn hint_must_be_one_line() {
    assert!(matches!(validate_hint("verb, present\nfirst person"), Command::Reject(_)));
    assert!(matches!(validate_hint("verb, present, first person"), Command::Write(_)));
  }

  #[test]
  fn incorrect_options_produce_four_with_answer_once() {
    let pad = pad_with(&[(field::ANSWER, "mange")]);
    let opts: Vec<String> = vec!["manges".into(), "mangeons".into(), "mangez".into()];
    let mut rng = rng();
    for _ in 0..50 {
      match validate_incorrect_options(&pad, &opts, &mut rng) {
        Command::Write(writes) => {
          let (ScratchValue::List(all), ScratchValue::Index(idx)) = (&writes[0].1, &writes[1].1) else {
            panic!("unexpected shapes");
          };
          assert_eq!(all.len(), 4);
          assert_eq!(all.iter().filter(|o| *o == "mange").count(), 1);
          assert_eq!(all[*idx], "mange");
        }
        Command::Reject(m) => panic!("rejected: {m}"),
      }
    }
  }

  #[test]
  fn incorrect_options_reject_wrong_count_duplicates_and_the_answer() {
    let pad = pad_with(&[(field::ANSWER, "mange")]);
    let two: Vec<String> = vec!["a".into(), "b".into()];
    assert!(matches!(validate_incorrect_options(&pad, &two, &mut rng()), Command::Reject(_)));
    let with_answer: Vec<String> = vec!["a".into(), "Mange".into(), "b".into()];
    assert!(matches!(validate_incorrect_options(&pad, &with_answer, &mut rng()), Command::Reject(_)));
    let dupes: Vec<String> = vec!["a".into(), "a".into(), "b".into()];
    assert!(matches!(validate_incorrect_options(&pad, &dupes, &mut rng()), Command::Reject(_)));
  }

  #[test]
  fn answer_placement_is_uniform() {
    let distractors: Vec<String> = vec!["x".into(), "y".into(), "z".into()];
    let mut rng = StdRng::seed_from_u64(1234);
    let mut counts = [0usize; 4];
    let trials = 1000;
    for _ in 0..trials {
      let (_, idx) = insert_answer(&mut rng, "a", &distractors);
      counts[idx] += 1;
    }
    let expected = trials as f64 / 4.0;
    let chi2: f64 = counts.iter().map(|c| (*c as f64 - expected).powi(2) / expected).sum();
    // df = 3, p = 0.001
    assert!(chi2 < 16.27, "chi-square {chi2} for {counts:?}");
  }

  #[test]
  fn speakers_and_dialogue_validation() {
    let names = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    assert!(matches!(validate_speakers(&names(&["Anna"])), Command::Reject(_)));
    assert!(matches!(validate_speakers(&names(&["Anna", "Anna"])), Command::Reject(_)));
    assert!(matches!(validate_speakers(&names(&["Anna", "Marc"])), Command::Write(_)));
    let bad = vec![DialogueSegment { speaker_index: 2, text: "Salut".into() }];
    assert!(matches!(validate_dialogue(&bad), Command::Reject(_)));
    assert!(matches!(validate_dialogue(&[]), Command::Reject(_)));
  }

  #[tokio::test]
  async fn multiple_choice_run_reaches_terminal_state() {
    let mut tb = ToolBox::new(QuestionType::MultipleChoice, rng(), None);
    let texts: Vec<Value> = (0..5).map(|_| json!({"text": "Je mange une pomme.", "focus": "verbs"})).collect();

    let r = tb.invoke("create_base_text", json!({ "candidates": texts })).await.unwrap();
    assert!(r.text.contains("Je mange une pomme."));
    assert!(r.text.contains("verbs"));

    let r = tb.invoke("create_question_with_placeholder", json!({"question_text": "Je ___ une pomme.", "answer": "mange"})).await.unwrap();
    assert!(r.text.contains("hint"));

    let r = tb.invoke("create_question_hint", json!({"hint": "verb, present"})).await.unwrap();
    assert!(r.text.contains("incorrect options"));

    let r = tb.invoke("create_incorrect_options", json!({"incorrect_options": ["manges", "mangent", "mangez"]})).await.unwrap();
    assert!(r.text.contains("finish up"));
    assert!(!tb.is_finished());

    let r = tb.invoke("finish", json!({})).await.unwrap();
    assert!(r.finished);
    match tb.into_record().unwrap() {
      QuestionRecord::MultipleChoice { options, answer_index, hint, .. } => {
        assert_eq!(options.len(), 4);
        assert_eq!(options[answer_index], "mange");
        assert_eq!(hint, "verb, present");
      }
      other => panic!("unexpected record {other:?}"),
    }
  }

  #[tokio::test]
  async fn free_text_hint_leads_to_finish() {
    let mut tb = ToolBox::new(QuestionType::FreeText, rng(), None);
    let texts: Vec<Value> = (0..5).map(|_| json!({"text": "Il pleut.", "focus": "weather"})).collect();
    tb.invoke("create_base_text", json!({ "candidates": texts })).await.unwrap();
    tb.invoke("create_question_with_placeholder", json!({"question_text": "Il ___.", "answer": "pleut"})).await.unwrap();
    let r = tb.invoke("create_question_hint", json!({"hint": "verb"})).await.unwrap();
    assert!(r.text.contains("finish up"));
    let r = tb.invoke("create_incorrect_options", json!({"incorrect_options": ["a", "b", "c"]})).await.unwrap();
    assert!(r.text.contains("not available"));
  }

  #[tokio::test]
  async fn finish_before_completion_names_missing_field() {
    let mut tb = ToolBox::new(QuestionType::ReadingComprehension, rng(), None);
    let r = tb.invoke("finish", json!({})).await.unwrap();
    assert!(!r.finished);
    assert!(r.text.contains(field::TOPIC));
    assert!(tb.into_record().is_err());
  }

  #[tokio::test]
  async fn agent_mistakes_become_instructions() {
    let mut tb = ToolBox::new(QuestionType::Translation, rng(), None);
    let r = tb.invoke("delete_everything", json!({})).await.unwrap();
    assert!(r.text.contains("create_base_text"));
    let r = tb.invoke("create_base_text", json!({"candidates": "not a list"})).await.unwrap();
    assert!(r.text.contains("malformed"));
    let r = tb.invoke("create_question_hint", json!({"hint": "x"})).await.unwrap();
    assert!(r.text.contains("not available"));
    assert!(!tb.is_finished());
  }

  #[tokio::test]
  async fn out_of_order_call_points_at_first_missing_step() {
    let mut tb = ToolBox::new(QuestionType::ListeningComprehension, rng(), None);
    let r = tb.invoke("create_dialogue", json!({"segments": [{"speaker_index": 0, "text": "Salut"}]})).await.unwrap();
    assert!(r.text.contains("create_topic"));
  }

  #[tokio::test]
  async fn finish_renders_listening_audio() {
    let synth = Arc::new(FakeSpeech::new(8_000));
    let audio = AudioSettings {
      synth: synth.clone(),
      language: "French".into(),
      gaps: Gaps { section_secs: 2, turn_secs: 1 },
    };
    let mut tb = ToolBox::new(QuestionType::ListeningComprehension, rng(), Some(audio));
    tb.invoke("create_topic", json!({"topics": ["a", "b", "c", "d", "e"]})).await.unwrap();
    let r = tb.invoke("create_speakers", json!({"speakers": ["Anna", "Marc"]})).await.unwrap();
    assert!(r.text.contains("Speaker 0 is Anna"));
    tb.invoke("create_dialogue", json!({"segments": [
      {"speaker_index": 0, "text": "Salut"},
      {"speaker_index": 1, "text": "Bonjour"}
    ]})).await.unwrap();
    tb.invoke("create_comprehension_question", json!({"question": "Qui parle ?"})).await.unwrap();
    let r = tb.invoke("finish", json!({})).await.unwrap();
    assert!(r.finished);

    let calls = synth.calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 4);
    let narrator = calls[0].1;
    assert_eq!(calls[3].1, narrator);
    assert_ne!(calls[1].1, calls[2].1);
    assert_ne!(calls[1].1, narrator);

    match tb.into_record().unwrap() {
      QuestionRecord::ListeningComprehension { audio: Some(a), speakers, dialogue, .. } => {
        assert_eq!(a.sample_rate, 8_000);
        assert_eq!(speakers, vec!["Anna".to_string(), "Marc".to_string()]);
        assert_eq!(dialogue.len(), 2);
      }
      other => panic!("unexpected record {other:?}"),
    }
  }
}
