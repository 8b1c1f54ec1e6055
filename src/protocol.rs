//! Public protocol structs for WebSocket and HTTP endpoints (serde ready).
//! Keep this small and stable to evolve backend and frontend independently.
//!
//! Questions leave the server without their ground truth: no answer index for
//! multiple choice, no answer or base text for fill-in-the-blank.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use serde::{Deserialize, Serialize};

use crate::domain::{AudioData, ChatTurn, DialogueSegment, ExtraParameters, GenerationRequest, QuestionRecord, QuestionType};

/// Messages the client can send over WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientWsMessage {
    Ping,
    NewQuestion {
        #[serde(flatten)]
        request: QuestionRequestIn,
    },
    SubmitAnswer {
        #[serde(rename = "questionId")]
        question_id: String,
        answer: SubmittedAnswer,
    },
    SpeechToText {
        #[serde(rename = "audioBase64")]
        audio_base64: String,
        mime: String,
    },
    Conversation {
        #[serde(flatten)]
        body: ConversationIn,
    },
}

/// Messages the server sends back over WebSocket.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerWsMessage {
    Pong,
    Question {
        question: QuestionOut,
    },
    AnswerResult {
        correct: bool,
        score: f32,
        expected: String,
        explanation: String,
    },
    SpeechToText {
        text: String,
    },
    ConversationReply {
        text: String,
    },
    Error {
        message: String,
    },
}

/// Settings for one question, as clients send them.
#[derive(Clone, Debug, Deserialize)]
pub struct QuestionRequestIn {
    pub question_type: QuestionType,
    pub language: String,
    pub proficiency: String,
    pub difficulty: String,
    #[serde(default)]
    pub additional_info: String,
    #[serde(default)]
    pub extra: Option<ExtraParameters>,
}

impl QuestionRequestIn {
    pub fn into_request(self) -> GenerationRequest {
        let req = GenerationRequest::new(
            self.question_type,
            self.language,
            self.proficiency,
            self.difficulty,
            self.additional_info,
        );
        match self.extra {
            Some(extra) => req.with_extra(extra),
            None => req,
        }
    }
}

/// Multiple choice answers are option indices; everything else is text.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SubmittedAnswer {
    Index(usize),
    Text(String),
}

/// Mono 16-bit PCM, little-endian, base64 encoded.
#[derive(Debug, Serialize)]
pub struct AudioOut {
    pub sample_rate: u32,
    pub pcm_base64: String,
}

impl From<&AudioData> for AudioOut {
    fn from(a: &AudioData) -> Self {
        AudioOut { sample_rate: a.sample_rate, pcm_base64: B64.encode(a.to_le_bytes()) }
    }
}

/// DTO used by both WS and HTTP for question delivery.
#[derive(Debug, Serialize)]
pub struct QuestionOut {
    pub id: String,
    #[serde(flatten)]
    pub body: QuestionBody,
}

#[derive(Debug, Serialize)]
#[serde(tag = "question_type", rename_all = "snake_case")]
pub enum QuestionBody {
    MultipleChoice {
        question_text: String,
        options: Vec<String>,
        hint: String,
    },
    FreeText {
        question_text: String,
        hint: String,
    },
    Translation {
        base_text: String,
    },
    ReadingComprehension {
        topic: String,
        text: String,
        question: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<AudioOut>,
    },
    ListeningComprehension {
        topic: String,
        speakers: Vec<String>,
        /// Transcript; withheld when the exercise comes with audio.
        #[serde(skip_serializing_if = "Option::is_none")]
        dialogue: Option<Vec<DialogueSegment>>,
        question: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        audio: Option<AudioOut>,
    },
}

impl From<AnswerOut> for ServerWsMessage {
    fn from(a: AnswerOut) -> Self {
        ServerWsMessage::AnswerResult {
            correct: a.correct,
            score: a.score,
            expected: a.expected,
            explanation: a.explanation,
        }
    }
}

/// Convert a full `QuestionRecord` (internal) to the public DTO.
pub fn to_out(id: &str, q: &QuestionRecord) -> QuestionOut {
    let body = match q {
        QuestionRecord::MultipleChoice { question_text, options, hint, .. } => QuestionBody::MultipleChoice {
            question_text: question_text.clone(),
            options: options.clone(),
            hint: hint.clone(),
        },
        QuestionRecord::FreeText { question_text, hint, .. } => QuestionBody::FreeText {
            question_text: question_text.clone(),
            hint: hint.clone(),
        },
        QuestionRecord::Translation { base_text } => QuestionBody::Translation { base_text: base_text.clone() },
        QuestionRecord::ReadingComprehension { topic, text, question, audio } => QuestionBody::ReadingComprehension {
            topic: topic.clone(),
            text: text.clone(),
            question: question.clone(),
            audio: audio.as_ref().map(AudioOut::from),
        },
        QuestionRecord::ListeningComprehension { topic, speakers, dialogue, question, audio } => {
            QuestionBody::ListeningComprehension {
                topic: topic.clone(),
                speakers: speakers.clone(),
                dialogue: if audio.is_some() { None } else { Some(dialogue.clone()) },
                question: question.clone(),
                audio: audio.as_ref().map(AudioOut::from),
            }
        }
    };
    QuestionOut { id: id.to_string(), body }
}

//
// HTTP request/response DTOs
//

#[derive(Serialize)]
pub struct SessionOut {
    #[serde(rename = "sessionId")]
    pub session_id: String,
}

#[derive(Deserialize)]
pub struct QuestionIn {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(flatten)]
    pub request: QuestionRequestIn,
}

#[derive(Deserialize)]
pub struct AnswerIn {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    #[serde(rename = "questionId")]
    pub question_id: String,
    pub answer: SubmittedAnswer,
}
#[derive(Debug, Serialize)]
pub struct AnswerOut {
    pub correct: bool,
    pub score: f32,
    pub expected: String,
    pub explanation: String,
}

#[derive(Deserialize)]
pub struct SpeechIn {
    pub text: String,
    pub language: String,
    #[serde(default)]
    pub voice: Option<usize>,
    #[serde(default)]
    pub tts_provider: Option<String>,
}

#[derive(Deserialize)]
pub struct TranscribeIn {
    #[serde(rename = "audioBase64")]
    pub audio_base64: String,
    pub mime: String,
}
#[derive(Serialize)]
pub struct TranscribeOut {
    pub text: String,
}

#[derive(Debug, Deserialize)]
pub struct ConversationIn {
    pub language: String,
    pub proficiency: String,
    #[serde(default)]
    pub history: Vec<ChatTurn>,
    pub message: String,
}
#[derive(Serialize)]
pub struct ConversationOut {
    pub text: String,
}

#[derive(Serialize)]
pub struct HealthOut {
    pub ok: bool,
    pub openai: bool,
}

#[derive(Serialize)]
pub struct ErrorOut {
    pub message: String,
}
