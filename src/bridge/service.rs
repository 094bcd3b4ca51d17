// Bridge service
//
// Fronts a `VoiceProvider` with the four bridge operations. The streaming
// conversation buffers inbound audio until a final-flagged frame, then runs
// transcribe -> chat stream -> synthesis for that turn before reading the
// next frame, so responses never interleave across turns.

use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::provider::{
    ChatCompletion, ChatMessage, ChatRequest, SpeechAudio, SpeechRequest, TranscribeRequest,
    Transcription, VoiceProvider,
};
use crate::audio::codec;
use crate::config::Config;
use crate::error::VoiceError;
use crate::protocol::ServerEvent;

/// Prior messages kept as chat context
const MAX_HISTORY: usize = 20;

/// Bytes per `response.audio.delta` message
const AUDIO_CHUNK_BYTES: usize = 9600;

#[derive(Debug, Clone)]
pub struct BridgeOptions {
    pub synthesize_speech: bool,
    pub max_turn_bytes: usize,
    pub event_buffer: usize,
    pub sample_rate: u32,
    pub channels: u16,
    pub system_prompt: Option<String>,
    pub voice: Option<String>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            synthesize_speech: true,
            max_turn_bytes: 10 * 1024 * 1024,
            event_buffer: 64,
            sample_rate: 24000,
            channels: 1,
            system_prompt: None,
            voice: None,
        }
    }
}

impl From<&Config> for BridgeOptions {
    fn from(cfg: &Config) -> Self {
        Self {
            synthesize_speech: cfg.bridge.synthesize_speech,
            max_turn_bytes: cfg.bridge.max_turn_bytes,
            event_buffer: cfg.bridge.event_buffer,
            sample_rate: cfg.audio.sample_rate,
            channels: cfg.audio.channels,
            system_prompt: cfg.upstream.system_prompt.clone(),
            voice: Some(cfg.upstream.voice.clone()),
        }
    }
}

/// One inbound audio frame of a streaming conversation
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    /// PCM16LE bytes
    pub audio_data: Vec<u8>,
    /// Closes the current turn
    pub is_final: bool,
}

/// Outbound item of a streaming conversation
#[derive(Debug, Clone, PartialEq)]
pub enum ConversationEvent {
    /// What the user said (non-final text)
    Transcript(String),
    /// One incremental response token (non-final text)
    TextDelta(String),
    /// The complete response (final text)
    TextDone(String),
    /// Synthesized response, PCM16LE (final audio)
    Audio(Vec<u8>),
    /// The turn failed upstream (final text carrying the description)
    Failed(String),
}

impl ConversationEvent {
    pub fn text(&self) -> Option<&str> {
        match self {
            ConversationEvent::Transcript(t)
            | ConversationEvent::TextDelta(t)
            | ConversationEvent::TextDone(t)
            | ConversationEvent::Failed(t) => Some(t),
            ConversationEvent::Audio(_) => None,
        }
    }

    pub fn audio(&self) -> Option<&[u8]> {
        match self {
            ConversationEvent::Audio(bytes) => Some(bytes),
            _ => None,
        }
    }

    pub fn is_final(&self) -> bool {
        !matches!(
            self,
            ConversationEvent::Transcript(_) | ConversationEvent::TextDelta(_)
        )
    }

    /// Wire messages for the conversation socket
    pub fn into_server_events(self) -> Vec<ServerEvent> {
        match self {
            ConversationEvent::Transcript(transcript) => {
                vec![ServerEvent::InputTranscriptCompleted { transcript }]
            }
            ConversationEvent::TextDelta(delta) => vec![ServerEvent::TextDelta { delta }],
            ConversationEvent::TextDone(text) => vec![ServerEvent::TextDone { text: Some(text) }],
            ConversationEvent::Audio(bytes) => {
                let mut events: Vec<ServerEvent> = bytes
                    .chunks(AUDIO_CHUNK_BYTES)
                    .map(|chunk| ServerEvent::AudioDelta {
                        delta: codec::encode_bytes(chunk),
                    })
                    .collect();
                events.push(ServerEvent::AudioDone);
                events
            }
            ConversationEvent::Failed(message) => vec![
                ServerEvent::Error { message },
                ServerEvent::TextDone { text: None },
            ],
        }
    }
}

pub struct BridgeService {
    provider: Arc<dyn VoiceProvider>,
    options: BridgeOptions,
}

impl BridgeService {
    pub fn new(provider: Arc<dyn VoiceProvider>, options: BridgeOptions) -> Self {
        info!("Bridge service using {} provider", provider.name());
        Self { provider, options }
    }

    pub fn options(&self) -> &BridgeOptions {
        &self.options
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Single-shot transcription of a complete utterance
    pub async fn transcribe(&self, request: TranscribeRequest) -> Result<Transcription, VoiceError> {
        debug!("Transcribing {} samples", request.audio.len());
        self.provider.transcribe(&request).await
    }

    /// Single-shot chat; the configured system prompt applies when the
    /// request has none
    pub async fn chat_completion(&self, mut request: ChatRequest) -> Result<ChatCompletion, VoiceError> {
        if request.system_prompt.is_none() {
            request.system_prompt = self.options.system_prompt.clone();
        }
        self.provider.chat_completion(&request).await
    }

    pub async fn text_to_speech(&self, mut request: SpeechRequest) -> Result<SpeechAudio, VoiceError> {
        if request.voice.is_none() {
            request.voice = self.options.voice.clone();
        }
        self.provider.synthesize(&request).await
    }

    /// Run a conversation over `inbound` until it ends or the receiver is dropped
    pub fn streaming_conversation<S>(self: &Arc<Self>, inbound: S) -> mpsc::Receiver<ConversationEvent>
    where
        S: Stream<Item = InboundFrame> + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(self.options.event_buffer.max(1));
        tokio::spawn(Arc::clone(self).run_conversation(inbound, tx));
        rx
    }

    async fn run_conversation<S>(self: Arc<Self>, mut inbound: S, events: mpsc::Sender<ConversationEvent>)
    where
        S: Stream<Item = InboundFrame> + Send + Unpin + 'static,
    {
        let mut buffer: Vec<u8> = Vec::new();
        let mut overflowed = false;
        let mut history: Vec<ChatMessage> = Vec::new();
        let mut turns = 0u64;

        while let Some(frame) = inbound.next().await {
            if frame.audio_data.len() % 2 != 0 {
                warn!("Skipping frame with odd byte count ({})", frame.audio_data.len());
            } else if !overflowed {
                if buffer.len() + frame.audio_data.len() > self.options.max_turn_bytes {
                    overflowed = true;
                    buffer = Vec::new();
                } else {
                    buffer.extend_from_slice(&frame.audio_data);
                }
            }

            if !frame.is_final {
                continue;
            }

            let turn = std::mem::take(&mut buffer);
            if std::mem::take(&mut overflowed) {
                let message = format!(
                    "turn exceeds {} bytes of audio and was discarded",
                    self.options.max_turn_bytes
                );
                warn!("{}", message);
                if events.send(ConversationEvent::Failed(message)).await.is_err() {
                    break;
                }
                continue;
            }
            if turn.is_empty() {
                debug!("Skipping empty turn");
                continue;
            }

            turns += 1;
            debug!("Processing turn {} ({} bytes)", turns, turn.len());
            if !self.process_turn(turn, &mut history, &events).await {
                break;
            }
        }

        info!("Conversation ended after {} turns", turns);
    }

    /// Returns false once the event receiver is gone
    async fn process_turn(
        &self,
        audio: Vec<u8>,
        history: &mut Vec<ChatMessage>,
        events: &mpsc::Sender<ConversationEvent>,
    ) -> bool {
        let samples = match codec::bytes_to_samples(&audio) {
            Ok(samples) => samples,
            Err(e) => return fail(events, "decode", e).await,
        };
        drop(audio);

        let request = TranscribeRequest {
            audio: samples,
            sample_rate: self.options.sample_rate,
            channels: self.options.channels,
            language: None,
            model: None,
        };
        let transcript = match self.provider.transcribe(&request).await {
            Ok(t) => t.text,
            Err(e) => return fail(events, "transcription", e).await,
        };
        drop(request);

        if events
            .send(ConversationEvent::Transcript(transcript.clone()))
            .await
            .is_err()
        {
            return false;
        }
        if transcript.trim().is_empty() {
            return send(events, ConversationEvent::Failed("no speech detected".to_string())).await;
        }

        let mut messages = history.clone();
        messages.push(ChatMessage::user(transcript.clone()));
        let chat = ChatRequest {
            messages,
            system_prompt: self.options.system_prompt.clone(),
            model: None,
            temperature: None,
        };

        let mut tokens = match self.provider.chat_stream(&chat).await {
            Ok(tokens) => tokens,
            Err(e) => return fail(events, "chat", e).await,
        };
        let mut reply = String::new();
        while let Some(token) = tokens.next().await {
            match token {
                Ok(token) => {
                    reply.push_str(&token);
                    if !send(events, ConversationEvent::TextDelta(token)).await {
                        return false;
                    }
                }
                Err(e) => return fail(events, "chat", e).await,
            }
        }

        if !send(events, ConversationEvent::TextDone(reply.clone())).await {
            return false;
        }

        history.push(ChatMessage::user(transcript));
        history.push(ChatMessage::assistant(reply.clone()));
        if history.len() > MAX_HISTORY {
            let excess = history.len() - MAX_HISTORY;
            history.drain(..excess);
        }

        if !self.options.synthesize_speech || reply.trim().is_empty() {
            return true;
        }

        let speech = SpeechRequest {
            text: reply,
            voice: self.options.voice.clone(),
            model: None,
            speed: None,
        };
        match self.provider.synthesize(&speech).await {
            Ok(audio) => send(events, ConversationEvent::Audio(audio.audio_bytes)).await,
            Err(e) => fail(events, "speech synthesis", e).await,
        }
    }
}

async fn send(events: &mpsc::Sender<ConversationEvent>, event: ConversationEvent) -> bool {
    events.send(event).await.is_ok()
}

async fn fail(events: &mpsc::Sender<ConversationEvent>, stage: &str, err: VoiceError) -> bool {
    warn!("Turn failed during {}: {}", stage, err);
    send(events, ConversationEvent::Failed(format!("{} failed: {}", stage, err))).await
}
