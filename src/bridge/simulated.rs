use futures::stream::{self, StreamExt};
use std::f32::consts::PI;

use super::provider::{
    ChatCompletion, ChatRequest, SpeechAudio, SpeechRequest, TextStream, TranscribeRequest,
    TranscriptSegment, Transcription, VoiceProvider,
};
use crate::audio::codec;
use crate::error::VoiceError;

/// Tone length per synthesized word
const MS_PER_WORD: u32 = 120;

/// Offline provider with deterministic output, for local runs and tests.
///
/// Transcripts describe the audio length, replies echo the last user
/// message, and speech is a short tone per word.
pub struct SimulatedProvider {
    sample_rate: u32,
}

impl SimulatedProvider {
    pub fn new(sample_rate: u32) -> Self {
        Self { sample_rate }
    }

    fn reply_for(request: &ChatRequest) -> String {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.trim())
            .unwrap_or("");

        if last_user.is_empty() {
            "I did not catch that.".to_string()
        } else {
            format!("You said: {}", last_user)
        }
    }

    /// Split after each space so the tokens concatenate back to `text`
    fn tokens(text: &str) -> Vec<String> {
        text.split_inclusive(' ').map(str::to_string).collect()
    }
}

#[async_trait::async_trait]
impl VoiceProvider for SimulatedProvider {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn transcribe(&self, request: &TranscribeRequest) -> Result<Transcription, VoiceError> {
        let ms = codec::duration_ms(request.audio.len(), request.sample_rate, request.channels);
        if ms == 0 {
            return Ok(Transcription {
                text: String::new(),
                confidence: None,
                segments: Vec::new(),
            });
        }

        let text = format!("{} milliseconds of audio", ms);
        Ok(Transcription {
            segments: vec![TranscriptSegment {
                text: text.clone(),
                start: 0.0,
                end: ms as f32 / 1000.0,
            }],
            text,
            confidence: Some(1.0),
        })
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatCompletion, VoiceError> {
        let text = Self::reply_for(request);
        Ok(ChatCompletion {
            tokens_used: Some(Self::tokens(&text).len() as u32),
            text,
            model: request.model.clone().unwrap_or_else(|| "simulated".to_string()),
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<TextStream, VoiceError> {
        let tokens = Self::tokens(&Self::reply_for(request));
        Ok(stream::iter(tokens.into_iter().map(Ok)).boxed())
    }

    async fn synthesize(&self, request: &SpeechRequest) -> Result<SpeechAudio, VoiceError> {
        let words = request.text.split_whitespace().count() as u32;
        let speed = request.speed.filter(|s| *s > 0.0).unwrap_or(1.0);
        let total = ((self.sample_rate * MS_PER_WORD / 1000 * words) as f32 / speed) as usize;

        let samples: Vec<i16> = (0..total)
            .map(|i| {
                let t = i as f32 / self.sample_rate as f32;
                ((2.0 * PI * 440.0 * t).sin() * 8000.0) as i16
            })
            .collect();

        Ok(SpeechAudio {
            audio_bytes: codec::samples_to_bytes(&samples),
            format: "pcm16".to_string(),
        })
    }
}
