//! Explicit per-type step machine.
//!
//! Every question type follows its own fixed path of steps ending in `Finish`.
//! The machine tracks how far along the path a run is; the instruction sent
//! back to the agent after a successful tool call is the one belonging to the
//! next step on the path, rendered with values from the scratchpad.

use crate::domain::QuestionType;
use crate::question::field;
use crate::question::scratchpad::Scratchpad;
use crate::util::fill_template;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
  BaseText,
  PlaceholderQuestion,
  Hint,
  IncorrectOptions,
  Topic,
  Speakers,
  ComprehensionText,
  Dialogue,
  ComprehensionQuestion,
  Finish,
}

const MULTIPLE_CHOICE_PATH: &[Step] =
  &[Step::BaseText, Step::PlaceholderQuestion, Step::Hint, Step::IncorrectOptions, Step::Finish];
const FREE_TEXT_PATH: &[Step] = &[Step::BaseText, Step::PlaceholderQuestion, Step::Hint, Step::Finish];
const TRANSLATION_PATH: &[Step] = &[Step::BaseText, Step::Finish];
const READING_PATH: &[Step] =
  &[Step::Topic, Step::ComprehensionText, Step::ComprehensionQuestion, Step::Finish];
const LISTENING_PATH: &[Step] =
  &[Step::Topic, Step::Speakers, Step::Dialogue, Step::ComprehensionQuestion, Step::Finish];

/// Transition table: the ordered steps a question type must pass through.
pub fn path(question_type: QuestionType) -> &'static [Step] {
  match question_type {
    QuestionType::MultipleChoice => MULTIPLE_CHOICE_PATH,
    QuestionType::FreeText => FREE_TEXT_PATH,
    QuestionType::Translation => TRANSLATION_PATH,
    QuestionType::ReadingComprehension => READING_PATH,
    QuestionType::ListeningComprehension => LISTENING_PATH,
  }
}

impl Step {
  pub const ALL: [Step; 10] = [
    Step::BaseText,
    Step::PlaceholderQuestion,
    Step::Hint,
    Step::IncorrectOptions,
    Step::Topic,
    Step::Speakers,
    Step::ComprehensionText,
    Step::Dialogue,
    Step::ComprehensionQuestion,
    Step::Finish,
  ];

  pub fn tool_name(&self) -> &'static str {
    match self {
      Step::BaseText => "create_base_text",
      Step::PlaceholderQuestion => "create_question_with_placeholder",
      Step::Hint => "create_question_hint",
      Step::IncorrectOptions => "create_incorrect_options",
      Step::Topic => "create_topic",
      Step::Speakers => "create_speakers",
      Step::ComprehensionText => "create_comprehension_text",
      Step::Dialogue => "create_dialogue",
      Step::ComprehensionQuestion => "create_comprehension_question",
      Step::Finish => "finish",
    }
  }

  pub fn from_tool_name(name: &str) -> Option<Step> {
    Step::ALL.into_iter().find(|s| s.tool_name() == name)
  }

  /// Scratchpad fields a successful call of this step writes.
  pub fn fields(&self) -> &'static [&'static str] {
    match self {
      Step::BaseText => &[field::BASE_TEXT],
      Step::PlaceholderQuestion => &[field::QUESTION_TEXT, field::ANSWER],
      Step::Hint => &[field::HINT],
      Step::IncorrectOptions => &[field::OPTIONS, field::ANSWER_INDEX],
      Step::Topic => &[field::TOPIC],
      Step::Speakers => &[field::SPEAKERS],
      Step::ComprehensionText => &[field::TEXT],
      Step::Dialogue => &[field::DIALOGUE],
      Step::ComprehensionQuestion => &[field::QUESTION],
      Step::Finish => &[],
    }
  }

  fn describe(&self) -> &'static str {
    match self {
      Step::BaseText => "a base text",
      Step::PlaceholderQuestion => "the question with its placeholder and answer",
      Step::Hint => "a hint",
      Step::IncorrectOptions => "the incorrect options",
      Step::Topic => "a topic",
      Step::Speakers => "the speakers",
      Step::ComprehensionText => "a text",
      Step::Dialogue => "a dialogue",
      Step::ComprehensionQuestion => "a question",
      Step::Finish => "a finish call",
    }
  }

  /// Instruction template sent when this step is the next one to perform.
  fn instruction_template(&self) -> &'static str {
    match self {
      Step::BaseText => {
        "Generate at least five different candidate sentences, each with the grammar structure it focuses on, and register them with create_base_text."
      }
      Step::PlaceholderQuestion => {
        "You have started the question generation with this text:\n\n```\n{text}\n```\n\nEvery following step MUST ensure that the question is about {focus}.\n\nNow replace a grammatically interesting part of the text with the placeholder \"___\" and register it with create_question_with_placeholder. The replaced part MUST be given as the answer."
      }
      Step::Hint => {
        "You MUST now generate a hint for the answer with create_question_hint. The hint MUST be in english, written as comma separated keypoints on a single line."
      }
      Step::IncorrectOptions => {
        "You must now generate exactly three incorrect options with create_incorrect_options. They should resemble the answer \"{answer}\" but must not fit the hint, and none of them may be the answer."
      }
      Step::Topic => {
        "Generate at least five diverse topics that differ from each other and register them with create_topic."
      }
      Step::Speakers => {
        "You have started the generation with this topic:\n\n```\n{topic}\n```\n\nNow name the two speakers of the dialogue with create_speakers."
      }
      Step::ComprehensionText => {
        "You have started the generation with this topic:\n\n```\n{topic}\n```\n\nNow write the text for this topic with create_comprehension_text. It MUST NOT repeat the topic at the beginning."
      }
      Step::Dialogue => {
        "In the next step you will write the dialogue with create_dialogue. Please use the speakers you just provided. Speaker 0 is {speaker_0} and speaker 1 is {speaker_1}."
      }
      Step::ComprehensionQuestion => {
        "Now generate a question for the given text with create_comprehension_question."
      }
      Step::Finish => "You have done everything you can now finish up.",
    }
  }

  pub fn instruction(&self, pad: &Scratchpad) -> String {
    let speakers = pad.list(field::SPEAKERS).unwrap_or(&[]);
    let pairs = [
      ("text", pad.text(field::BASE_TEXT).unwrap_or_default()),
      ("focus", pad.text(field::BASE_TEXT_FOCUS).unwrap_or_default()),
      ("answer", pad.text(field::ANSWER).unwrap_or_default()),
      ("topic", pad.text(field::TOPIC).unwrap_or_default()),
      ("speaker_0", speakers.first().map(String::as_str).unwrap_or_default()),
      ("speaker_1", speakers.get(1).map(String::as_str).unwrap_or_default()),
    ];
    fill_template(self.instruction_template(), &pairs)
  }
}

/// Outcome of asking whether a tool may run now.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
  Accept,
  NotOnPath,
  OutOfOrder { first: Step },
}

/// Position of one run along its question type's path.
#[derive(Clone, Debug)]
pub struct StepMachine {
  question_type: QuestionType,
  completed: usize,
}

impl StepMachine {
  pub fn new(question_type: QuestionType) -> Self {
    Self { question_type, completed: 0 }
  }

  pub fn question_type(&self) -> QuestionType { self.question_type }

  pub fn path(&self) -> &'static [Step] { path(self.question_type) }

  /// The next step still to be performed; `None` once finished.
  pub fn current(&self) -> Option<Step> {
    self.path().get(self.completed).copied()
  }

  pub fn is_terminal(&self) -> bool {
    self.completed >= self.path().len()
  }

  /// A step may run when every step before it is complete. Re-running a
  /// completed step is allowed; it overwrites that step's own fields.
  pub fn admit(&self, step: Step) -> Admission {
    match self.path().iter().position(|s| *s == step) {
      None => Admission::NotOnPath,
      Some(idx) if idx <= self.completed => Admission::Accept,
      Some(_) => match self.current() {
        Some(first) => Admission::OutOfOrder { first },
        None => Admission::Accept,
      },
    }
  }

  /// Mark `step` done. Completing an earlier step again rewinds the machine
  /// so every later step has to be redone against the new values.
  pub fn complete(&mut self, step: Step) {
    if let Some(idx) = self.path().iter().position(|s| *s == step) {
      self.completed = idx + 1;
    }
  }

  /// First earlier step whose fields are not all present, checked at finish time.
  pub fn missing_before_finish(&self, pad: &Scratchpad) -> Option<(Step, &'static str)> {
    self
      .path()
      .iter()
      .take_while(|s| **s != Step::Finish)
      .find_map(|s| s.fields().iter().find(|f| !pad.contains(f)).map(|f| (*s, *f)))
  }

  pub fn next_instruction(&self, pad: &Scratchpad) -> String {
    match self.current() {
      Some(step) => step.instruction(pad),
      None => "The process was finished.".to_string(),
    }
  }

  /// Corrective message for calling `finish` while `step` is still missing.
  pub fn missing_message(&self, step: Step, field_name: &str) -> String {
    format!(
      "You have not provided {} (`{}`) for the {} question. Call {} first and ensure that you have provided all the necessary information before calling finish.",
      step.describe(),
      field_name,
      self.question_type.as_str().replace('_', " "),
      step.tool_name(),
    )
  }

  pub fn out_of_order_message(&self, requested: Step, first: Step) -> String {
    format!(
      "You cannot call {} yet. You must first provide {} with {}.",
      requested.tool_name(),
      first.describe(),
      first.tool_name(),
    )
  }

  pub fn not_on_path_message(&self, name: &str) -> String {
    let allowed: Vec<&str> = self.path().iter().map(Step::tool_name).collect();
    format!(
      "The tool `{}` is not available for a {} question. Use only these tools: {}.",
      name,
      self.question_type.as_str().replace('_', " "),
      allowed.join(", "),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::question::scratchpad::ScratchValue;

  #[test]
  fn every_path_ends_in_finish_and_tool_names_round_trip() {
    for qt in QuestionType::ALL {
      assert_eq!(path(qt).last(), Some(&Step::Finish));
    }
    for step in Step::ALL {
      assert_eq!(Step::from_tool_name(step.tool_name()), Some(step));
    }
    assert_eq!(Step::from_tool_name("nope"), None);
  }

  #[test]
  fn hint_is_followed_by_options_only_for_multiple_choice() {
    let mut mc = StepMachine::new(QuestionType::MultipleChoice);
    let mut ft = StepMachine::new(QuestionType::FreeText);
    for m in [&mut mc, &mut ft] {
      m.complete(Step::BaseText);
      m.complete(Step::PlaceholderQuestion);
      m.complete(Step::Hint);
    }
    assert_eq!(mc.current(), Some(Step::IncorrectOptions));
    assert_eq!(ft.current(), Some(Step::Finish));
  }

  #[test]
  fn admission_enforces_order_and_path() {
    let mut m = StepMachine::new(QuestionType::ReadingComprehension);
    assert_eq!(m.admit(Step::Topic), Admission::Accept);
    assert_eq!(m.admit(Step::ComprehensionQuestion), Admission::OutOfOrder { first: Step::Topic });
    assert_eq!(m.admit(Step::Hint), Admission::NotOnPath);
    m.complete(Step::Topic);
    assert_eq!(m.admit(Step::Topic), Admission::Accept);
    assert_eq!(m.admit(Step::ComprehensionText), Admission::Accept);
  }

  #[test]
  fn redoing_an_earlier_step_rewinds() {
    let mut m = StepMachine::new(QuestionType::FreeText);
    m.complete(Step::BaseText);
    m.complete(Step::PlaceholderQuestion);
    m.complete(Step::Hint);
    assert_eq!(m.current(), Some(Step::Finish));
    m.complete(Step::BaseText);
    assert_eq!(m.current(), Some(Step::PlaceholderQuestion));
  }

  #[test]
  fn terminal_only_after_finish_completes() {
    let mut m = StepMachine::new(QuestionType::Translation);
    m.complete(Step::BaseText);
    assert!(!m.is_terminal());
    m.complete(Step::Finish);
    assert!(m.is_terminal());
    assert_eq!(m.current(), None);
  }

  #[test]
  fn missing_before_finish_names_the_field() {
    let m = StepMachine::new(QuestionType::ReadingComprehension);
    let mut pad = Scratchpad::new();
    pad.set(field::TOPIC, ScratchValue::Text("Travel".into()));
    assert_eq!(m.missing_before_finish(&pad), Some((Step::ComprehensionText, field::TEXT)));
    let msg = m.missing_message(Step::ComprehensionText, field::TEXT);
    assert!(msg.contains("comprehension_text"));
    assert!(msg.contains("reading comprehension"));
  }

  #[test]
  fn instructions_are_rendered_from_the_scratchpad() {
    let mut pad = Scratchpad::new();
    pad.set(field::SPEAKERS, ScratchValue::List(vec!["Anna".into(), "Marc".into()]));
    let text = Step::Dialogue.instruction(&pad);
    assert!(text.contains("Speaker 0 is Anna and speaker 1 is Marc"));
  }
}
