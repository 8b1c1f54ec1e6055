//! Speech synthesis seam and audio stitching for comprehension exercises.
//!
//! Providers return mono 16-bit PCM. Exercises are assembled from several
//! synthesized segments separated by fixed stretches of silence.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{debug, instrument};

use crate::domain::{AudioData, DialogueSegment};
use crate::openai::OpenAI;

/// Name under which the OpenAI synthesizer is registered.
pub const DEFAULT_TTS_PROVIDER: &str = "openai";

/// OpenAI's `pcm` response format: 24 kHz, 16-bit little-endian mono.
pub const OPENAI_PCM_SAMPLE_RATE: u32 = 24_000;

const OPENAI_VOICES: &[&str] = &["alloy", "ash", "coral", "echo", "fable", "nova", "onyx", "sage", "shimmer"];

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
  /// Number of distinct voices usable for `language`. Voice ids are `0..count`.
  fn voice_count(&self, language: &str) -> usize;

  async fn synthesize(&self, text: &str, language: &str, voice_id: Option<usize>) -> Result<AudioData, String>;
}

pub struct OpenAiSpeech {
  client: OpenAI,
}

impl OpenAiSpeech {
  pub fn new(client: OpenAI) -> Self { Self { client } }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
  fn voice_count(&self, _language: &str) -> usize {
    OPENAI_VOICES.len()
  }

  #[instrument(level = "info", skip(self, text), fields(text_len = text.len(), %language, ?voice_id))]
  async fn synthesize(&self, text: &str, language: &str, voice_id: Option<usize>) -> Result<AudioData, String> {
    let voice = OPENAI_VOICES[voice_id.unwrap_or(0) % OPENAI_VOICES.len()];
    let bytes = self.client.speech_pcm(text, voice, language).await?;
    Ok(decode_pcm_le(&bytes, OPENAI_PCM_SAMPLE_RATE))
  }
}

/// Interpret raw little-endian 16-bit samples. A trailing odd byte is dropped.
pub fn decode_pcm_le(bytes: &[u8], sample_rate: u32) -> AudioData {
  let samples = bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]])).collect();
  AudioData { sample_rate, samples }
}

/// Pick a random voice not in `exclude`. When every voice is excluded a
/// repeat is allowed rather than going silent.
pub fn pick_voice<R: Rng + ?Sized>(rng: &mut R, count: usize, exclude: &[usize]) -> Option<usize> {
  let fresh: Vec<usize> = (0..count).filter(|v| !exclude.contains(v)).collect();
  if let Some(v) = fresh.choose(rng) {
    return Some(*v);
  }
  if count == 0 { None } else { Some(rng.gen_range(0..count)) }
}

/// One piece of a stitched recording.
#[derive(Clone, Debug)]
pub enum AudioPart {
  Speech(AudioData),
  Silence { seconds: u32 },
}

/// Concatenate parts into one waveform. Silence is rendered at the sample
/// rate of the speech segments, which must all agree.
pub fn stitch(parts: Vec<AudioPart>) -> Result<AudioData, String> {
  let sample_rate = parts
    .iter()
    .find_map(|p| match p {
      AudioPart::Speech(a) => Some(a.sample_rate),
      AudioPart::Silence { .. } => None,
    })
    .ok_or_else(|| "no speech segments to stitch".to_string())?;

  let mut out = AudioData { sample_rate, samples: Vec::new() };
  for part in parts {
    match part {
      AudioPart::Speech(a) => {
        if a.sample_rate != sample_rate {
          return Err(format!("sample rate mismatch: {} vs {}", a.sample_rate, sample_rate));
        }
        out.samples.extend(a.samples);
      }
      AudioPart::Silence { seconds } => {
        out.samples.extend(AudioData::silence(sample_rate, seconds).samples);
      }
    }
  }
  Ok(out)
}

/// Silence lengths between logical sections and between dialogue turns.
#[derive(Clone, Copy, Debug)]
pub struct Gaps {
  pub section_secs: u32,
  pub turn_secs: u32,
}

/// Topic and question in the narrator's voice, the body in a second voice.
#[instrument(level = "info", skip_all, fields(%language, text_len = text.len()))]
pub async fn reading_audio(
  synth: &dyn SpeechSynthesizer,
  language: &str,
  voices: [Option<usize>; 2],
  topic: &str,
  text: &str,
  question: &str,
  gaps: Gaps,
) -> Result<AudioData, String> {
  let [narrator, reader] = voices;
  let parts = vec![
    AudioPart::Speech(synth.synthesize(topic, language, narrator).await?),
    AudioPart::Silence { seconds: gaps.section_secs },
    AudioPart::Speech(synth.synthesize(text, language, reader).await?),
    AudioPart::Silence { seconds: gaps.section_secs },
    AudioPart::Speech(synth.synthesize(question, language, narrator).await?),
  ];
  let audio = stitch(parts)?;
  debug!(target: "question", secs = audio.duration_secs(), "Reading audio stitched");
  Ok(audio)
}

/// Topic and question by a narrator; each dialogue turn in its speaker's
/// voice followed by a short pause.
#[instrument(level = "info", skip_all, fields(%language, turns = dialogue.len()))]
pub async fn listening_audio(
  synth: &dyn SpeechSynthesizer,
  language: &str,
  voices: [Option<usize>; 3],
  topic: &str,
  dialogue: &[DialogueSegment],
  question: &str,
  gaps: Gaps,
) -> Result<AudioData, String> {
  let [narrator, first, second] = voices;
  let mut parts = vec![
    AudioPart::Speech(synth.synthesize(topic, language, narrator).await?),
    AudioPart::Silence { seconds: gaps.section_secs },
  ];
  for seg in dialogue {
    let voice = if seg.speaker_index == 0 { first } else { second };
    parts.push(AudioPart::Speech(synth.synthesize(&seg.text, language, voice).await?));
    parts.push(AudioPart::Silence { seconds: gaps.turn_secs });
  }
  parts.push(AudioPart::Silence { seconds: gaps.section_secs });
  parts.push(AudioPart::Speech(synth.synthesize(question, language, narrator).await?));
  let audio = stitch(parts)?;
  debug!(target: "question", secs = audio.duration_secs(), "Listening audio stitched");
  Ok(audio)
}

#[cfg(test)]
pub(crate) mod tests {
  use super::*;
  use rand::rngs::StdRng;
  use rand::SeedableRng;
  use std::sync::Mutex;

  /// Returns `samples_per_char * text.len()` samples and records every call.
  pub(crate) struct FakeSpeech {
    pub sample_rate: u32,
    pub samples_per_char: usize,
    pub voices: usize,
    pub calls: Mutex<Vec<(String, Option<usize>)>>,
  }

  impl FakeSpeech {
    pub(crate) fn new(sample_rate: u32) -> Self {
      Self { sample_rate, samples_per_char: 10, voices: 4, calls: Mutex::new(Vec::new()) }
    }
  }

  #[async_trait]
  impl SpeechSynthesizer for FakeSpeech {
    fn voice_count(&self, _language: &str) -> usize { self.voices }

    async fn synthesize(&self, text: &str, _language: &str, voice_id: Option<usize>) -> Result<AudioData, String> {
      self.calls.lock().unwrap().push((text.to_string(), voice_id));
      Ok(AudioData { sample_rate: self.sample_rate, samples: vec![1; text.len() * self.samples_per_char] })
    }
  }

  fn speech(sr: u32, n: usize) -> AudioPart {
    AudioPart::Speech(AudioData { sample_rate: sr, samples: vec![7; n] })
  }

  #[test]
  fn three_segments_two_gaps_add_four_seconds() {
    let sr = 16_000;
    let parts = vec![
      speech(sr, 1_000),
      AudioPart::Silence { seconds: 2 },
      speech(sr, 2_500),
      AudioPart::Silence { seconds: 2 },
      speech(sr, 300),
    ];
    let out = stitch(parts).unwrap();
    assert_eq!(out.samples.len(), 1_000 + 2_500 + 300 + 2 * 2 * sr as usize);
    assert_eq!(out.sample_rate, sr);
    assert!(out.samples[1_000..1_000 + 2 * sr as usize].iter().all(|s| *s == 0));
  }

  #[test]
  fn stitch_rejects_mixed_sample_rates() {
    let err = stitch(vec![speech(16_000, 10), speech(24_000, 10)]).unwrap_err();
    assert!(err.contains("mismatch"));
    assert!(stitch(vec![AudioPart::Silence { seconds: 1 }]).is_err());
  }

  #[test]
  fn decode_pcm_reads_little_endian_pairs() {
    let audio = decode_pcm_le(&[0x01, 0x00, 0xff, 0xff, 0x09], 24_000);
    assert_eq!(audio.samples, vec![1, -1]);
  }

  #[test]
  fn pick_voice_avoids_excluded_until_exhausted() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..50 {
      let v = pick_voice(&mut rng, 3, &[0, 2]).unwrap();
      assert_eq!(v, 1);
    }
    assert!(pick_voice(&mut rng, 2, &[0, 1]).is_some());
    assert_eq!(pick_voice(&mut rng, 0, &[]), None);
  }

  #[tokio::test]
  async fn reading_audio_uses_narrator_for_topic_and_question() {
    let synth = FakeSpeech::new(8_000);
    let gaps = Gaps { section_secs: 2, turn_secs: 1 };
    let audio = reading_audio(&synth, "French", [Some(0), Some(1)], "ab", "abcd", "abc", gaps).await.unwrap();
    assert_eq!(audio.samples.len(), (2 + 4 + 3) * 10 + 2 * 2 * 8_000);
    let calls = synth.calls.lock().unwrap().clone();
    assert_eq!(calls.iter().map(|c| c.1).collect::<Vec<_>>(), vec![Some(0), Some(1), Some(0)]);
  }

  #[tokio::test]
  async fn listening_audio_alternates_speaker_voices() {
    let synth = FakeSpeech::new(8_000);
    let gaps = Gaps { section_secs: 2, turn_secs: 1 };
    let dialogue = vec![
      DialogueSegment { speaker_index: 0, text: "a".into() },
      DialogueSegment { speaker_index: 1, text: "bb".into() },
    ];
    let audio = listening_audio(&synth, "French", [Some(2), Some(0), Some(1)], "t", &dialogue, "q", gaps)
      .await
      .unwrap();
    let speech_samples = (1 + 1 + 2 + 1) * 10;
    let silence = (2 + 1 + 1 + 2) * 8_000;
    assert_eq!(audio.samples.len(), speech_samples + silence);
    let voices: Vec<_> = synth.calls.lock().unwrap().iter().map(|c| c.1).collect();
    assert_eq!(voices, vec![Some(2), Some(0), Some(1), Some(2)]);
  }
}
