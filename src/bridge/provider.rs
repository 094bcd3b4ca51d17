use anyhow::{bail, Result};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;

use super::openai::OpenAiProvider;
use super::simulated::SimulatedProvider;
use crate::config::UpstreamConfig;
use crate::error::VoiceError;

/// Incremental chat tokens
pub type TextStream = BoxStream<'static, Result<String, VoiceError>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    /// Seconds from the start of the audio
    pub start: f32,
    pub end: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    pub text: String,
    pub confidence: Option<f32>,
    #[serde(default)]
    pub segments: Vec<TranscriptSegment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscribeRequest {
    /// Complete utterance, PCM16
    pub audio: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    pub language: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

impl ChatRequest {
    /// Messages as sent upstream: the system prompt, if any, goes first
    pub fn upstream_messages(&self) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        if let Some(prompt) = self.system_prompt.as_deref().filter(|p| !p.is_empty()) {
            messages.push(ChatMessage::system(prompt));
        }
        messages.extend(self.messages.iter().cloned());
        messages
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub text: String,
    pub model: String,
    pub tokens_used: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeechRequest {
    pub text: String,
    #[serde(default)]
    pub voice: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub speed: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpeechAudio {
    /// PCM16LE at the session sample rate
    pub audio_bytes: Vec<u8>,
    pub format: String,
}

/// Upstream speech and text capabilities
#[async_trait::async_trait]
pub trait VoiceProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn transcribe(&self, request: &TranscribeRequest) -> Result<Transcription, VoiceError>;

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatCompletion, VoiceError>;

    /// Chat completion delivered token by token
    async fn chat_stream(&self, request: &ChatRequest) -> Result<TextStream, VoiceError>;

    async fn synthesize(&self, request: &SpeechRequest) -> Result<SpeechAudio, VoiceError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    OpenAi,
    Simulated,
}

impl FromStr for ProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(ProviderKind::OpenAi),
            "simulated" => Ok(ProviderKind::Simulated),
            other => bail!("unknown upstream kind '{}' (expected openai or simulated)", other),
        }
    }
}

impl ProviderKind {
    pub fn build(self, cfg: &UpstreamConfig, sample_rate: u32) -> Result<Arc<dyn VoiceProvider>> {
        Ok(match self {
            ProviderKind::OpenAi => Arc::new(OpenAiProvider::new(cfg)?),
            ProviderKind::Simulated => Arc::new(SimulatedProvider::new(sample_rate)),
        })
    }
}
