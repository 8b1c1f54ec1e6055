//! Application state: sessions, prompts, OpenAI client, speech providers and
//! the question generator.
//!
//! Every session owns its own look-ahead buffer and the questions it has been
//! served, so two learners never see each other's pre-generated questions.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::agent::OpenAiAgent;
use crate::config::{load_agent_config_from_env, GenerationSettings, Prompts};
use crate::domain::{QuestionRecord, QuestionType};
use crate::openai::OpenAI;
use crate::question::{QuestionBuffer, QuestionGenerator};
use crate::speech::{OpenAiSpeech, SpeechSynthesizer, DEFAULT_TTS_PROVIDER};

/// Unanswered questions kept per session; the oldest is dropped beyond this.
pub const MAX_ISSUED_PER_SESSION: usize = 32;
/// HTTP sessions idle for longer than this are evicted.
pub const SESSION_IDLE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
/// Upper bound on live HTTP sessions; the least recently used goes first.
pub const MAX_SESSIONS: usize = 1024;

/// A question as it was handed out, kept for verifying the learner's answer.
#[derive(Clone, Debug)]
pub struct IssuedQuestion {
    pub record: QuestionRecord,
    pub language: String,
}

#[derive(Default)]
struct IssuedQuestions {
    by_id: HashMap<String, IssuedQuestion>,
    order: VecDeque<String>,
}

pub struct Session {
    pub id: String,
    pub buffer: Arc<QuestionBuffer>,
    issued: RwLock<IssuedQuestions>,
    // One lock per question type, held from a request until its refill lands.
    refills: Mutex<HashMap<QuestionType, Arc<Mutex<()>>>>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            buffer: Arc::new(QuestionBuffer::new()),
            issued: RwLock::new(IssuedQuestions::default()),
            refills: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until no request or refill for `question_type` is in flight and
    /// claim the slot. Release it by dropping the guard once the refill is done.
    pub async fn claim_refill(&self, question_type: QuestionType) -> OwnedMutexGuard<()> {
        let lock = self.refills.lock().await.entry(question_type).or_default().clone();
        lock.lock_owned().await
    }

    /// Remember `record` and return the id clients use to answer it.
    #[instrument(level = "debug", skip(self, record), fields(session = %self.id, question_type = %record.question_type()))]
    pub async fn issue(&self, record: QuestionRecord, language: &str) -> String {
        let id = Uuid::new_v4().to_string();
        let mut issued = self.issued.write().await;
        while issued.order.len() >= MAX_ISSUED_PER_SESSION {
            if let Some(old) = issued.order.pop_front() {
                issued.by_id.remove(&old);
                debug!(target: "question", session = %self.id, question_id = %old, "Dropping oldest unanswered question");
            }
        }
        issued.order.push_back(id.clone());
        issued.by_id.insert(id.clone(), IssuedQuestion { record, language: language.to_string() });
        id
    }

    #[cfg(test)]
    pub async fn issued(&self, question_id: &str) -> Option<IssuedQuestion> {
        self.issued.read().await.by_id.get(question_id).cloned()
    }

    /// Remove a question once it has been answered.
    pub async fn retire(&self, question_id: &str) -> Option<IssuedQuestion> {
        let mut issued = self.issued.write().await;
        issued.order.retain(|id| id != question_id);
        issued.by_id.remove(question_id)
    }

    #[cfg(test)]
    pub async fn issued_count(&self) -> usize {
        self.issued.read().await.by_id.len()
    }
}

struct SessionSlot {
    session: Arc<Session>,
    last_used: Instant,
}

#[derive(Clone)]
pub struct AppState {
    pub openai: Option<OpenAI>,
    pub prompts: Arc<Prompts>,
    pub generator: Option<QuestionGenerator>,
    pub synthesizers: HashMap<String, Arc<dyn SpeechSynthesizer>>,
    sessions: Arc<RwLock<HashMap<String, SessionSlot>>>,
}

impl AppState {
    /// Build state from env: load config, init OpenAI, wire the generator.
    #[instrument(level = "info", skip_all)]
    pub fn new() -> Self {
        let cfg = load_agent_config_from_env().unwrap_or_default();
        let prompts = Arc::new(cfg.prompts);
        let settings = cfg.generation.sanitized();
        info!(target: "lingo_backend", max_steps = settings.max_steps, section_gap_secs = settings.section_gap_secs, turn_gap_secs = settings.turn_gap_secs, "Generation settings");

        let openai = OpenAI::from_env();
        match &openai {
            Some(oa) => {
                info!(target: "lingo_backend", base_url = %oa.base_url, fast_model = %oa.fast_model, strong_model = %oa.strong_model, tts_model = %oa.tts_model, transcribe_model = %oa.transcribe_model, "OpenAI enabled.");
            }
            None => {
                info!(target: "lingo_backend", "OpenAI disabled (no OPENAI_API_KEY). Question generation, speech and evaluation are unavailable.");
            }
        }

        let mut synthesizers: HashMap<String, Arc<dyn SpeechSynthesizer>> = HashMap::new();
        if let Some(oa) = &openai {
            synthesizers.insert(DEFAULT_TTS_PROVIDER.to_string(), Arc::new(OpenAiSpeech::new(oa.clone())));
        }

        let generator = openai.as_ref().map(|oa| {
            let agent = Arc::new(OpenAiAgent::new(oa.clone(), settings.temperature));
            build_generator(agent, prompts.clone(), settings, &synthesizers)
        });

        Self::from_parts(openai, prompts, generator, synthesizers)
    }

    pub fn from_parts(
        openai: Option<OpenAI>,
        prompts: Arc<Prompts>,
        generator: Option<QuestionGenerator>,
        synthesizers: HashMap<String, Arc<dyn SpeechSynthesizer>>,
    ) -> Self {
        Self { openai, prompts, generator, synthesizers, sessions: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Register a fresh session for HTTP clients. Idle sessions are evicted first.
    #[instrument(level = "info", skip(self))]
    pub async fn create_session(&self) -> Arc<Session> {
        let session = Arc::new(Session::new());
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        evict_sessions(&mut sessions, now);
        sessions.insert(session.id.clone(), SessionSlot { session: session.clone(), last_used: now });
        info!(target: "lingo_backend", session = %session.id, live = sessions.len(), "Session created");
        session
    }

    /// Look up a session and mark it as used. An expired session is dropped.
    pub async fn session(&self, id: &str) -> Option<Arc<Session>> {
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        let slot = sessions.get_mut(id)?;
        if now.saturating_duration_since(slot.last_used) > SESSION_IDLE_TTL {
            sessions.remove(id);
            debug!(target: "lingo_backend", session = %id, "Session expired");
            return None;
        }
        slot.last_used = now;
        Some(slot.session.clone())
    }

    pub async fn remove_session(&self, id: &str) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!(target: "lingo_backend", session = %id, "Session removed");
        }
        removed
    }

    #[cfg(test)]
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// Expire idle sessions, then trim least recently used ones so a new session fits.
fn evict_sessions(sessions: &mut HashMap<String, SessionSlot>, now: Instant) {
    sessions.retain(|id, slot| {
        let keep = now.saturating_duration_since(slot.last_used) <= SESSION_IDLE_TTL;
        if !keep {
            debug!(target: "lingo_backend", session = %id, "Evicting idle session");
        }
        keep
    });
    while sessions.len() >= MAX_SESSIONS {
        let oldest = sessions.iter().min_by_key(|(_, slot)| slot.last_used).map(|(id, _)| id.clone());
        match oldest {
            Some(id) => {
                sessions.remove(&id);
                debug!(target: "lingo_backend", session = %id, "Evicting least recently used session");
            }
            None => break,
        }
    }
}

/// Generator with every known speech provider registered.
pub fn build_generator(
    agent: Arc<dyn crate::agent::AgentRunner>,
    prompts: Arc<Prompts>,
    settings: GenerationSettings,
    synthesizers: &HashMap<String, Arc<dyn SpeechSynthesizer>>,
) -> QuestionGenerator {
    synthesizers
        .iter()
        .fold(QuestionGenerator::new(agent, prompts, settings), |g, (name, synth)| {
            g.with_synthesizer(name.clone(), synth.clone())
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline() -> AppState {
        AppState::from_parts(None, Arc::new(Prompts::default()), None, HashMap::new())
    }

    fn translation(text: &str) -> QuestionRecord {
        QuestionRecord::Translation { base_text: text.into() }
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let state = offline();
        let a = state.create_session().await;
        let b = state.create_session().await;
        assert_ne!(a.id, b.id);
        assert!(!Arc::ptr_eq(&a.buffer, &b.buffer));

        let qid = a.issue(translation("Bonjour."), "French").await;
        assert!(a.issued(&qid).await.is_some());
        assert!(b.issued(&qid).await.is_none());
        assert!(state.session(&a.id).await.is_some());
        assert!(state.session("missing").await.is_none());
    }

    #[tokio::test]
    async fn retired_questions_are_gone() {
        let session = Session::new();
        let qid = session.issue(translation("Bonjour."), "French").await;
        assert!(session.retire(&qid).await.is_some());
        assert!(session.issued(&qid).await.is_none());
        assert!(session.retire(&qid).await.is_none());
        assert_eq!(session.issued_count().await, 0);
    }

    #[tokio::test]
    async fn unanswered_questions_are_capped() {
        let session = Session::new();
        let first = session.issue(translation("0"), "French").await;
        for i in 1..=MAX_ISSUED_PER_SESSION {
            session.issue(translation(&i.to_string()), "French").await;
        }
        assert_eq!(session.issued_count().await, MAX_ISSUED_PER_SESSION);
        assert!(session.issued(&first).await.is_none());
    }

    #[tokio::test]
    async fn idle_sessions_expire_and_can_be_removed() {
        let state = offline();
        let a = state.create_session().await;
        let b = state.create_session().await;
        assert_eq!(state.session_count().await, 2);

        assert!(state.remove_session(&a.id).await);
        assert!(!state.remove_session(&a.id).await);
        assert!(state.session(&a.id).await.is_none());

        let later = Instant::now() + SESSION_IDLE_TTL + Duration::from_secs(1);
        let mut sessions = state.sessions.write().await;
        evict_sessions(&mut sessions, Instant::now());
        assert_eq!(sessions.len(), 1);
        evict_sessions(&mut sessions, later);
        assert!(sessions.is_empty());
        drop(sessions);
        assert!(state.session(&b.id).await.is_none());
    }

    #[tokio::test]
    async fn session_map_is_bounded() {
        let state = offline();
        let first = state.create_session().await;
        std::thread::sleep(Duration::from_millis(2));
        for _ in 0..MAX_SESSIONS {
            state.create_session().await;
        }
        assert_eq!(state.session_count().await, MAX_SESSIONS);
        assert!(state.session(&first.id).await.is_none());
    }

    #[tokio::test]
    async fn refill_claims_are_per_type() {
        let session = Session::new();
        let held = session.claim_refill(QuestionType::Translation).await;
        // Another type is not blocked by the held one.
        drop(session.claim_refill(QuestionType::FreeText).await);
        let lock = session.refills.lock().await.get(&QuestionType::Translation).cloned().unwrap();
        assert!(lock.try_lock().is_err());
        drop(held);
        assert!(lock.try_lock().is_ok());
    }
}
