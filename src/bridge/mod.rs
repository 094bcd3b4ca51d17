//! Streaming bridge between the voice wire protocol and an upstream provider
//!
//! - `provider`: the `VoiceProvider` capability trait and request types
//! - `openai`: OpenAI-compatible HTTPS upstream
//! - `simulated`: deterministic offline upstream
//! - `service`: the bridge operations, including the streaming conversation

pub mod openai;
pub mod provider;
pub mod service;
pub mod simulated;

pub use openai::OpenAiProvider;
pub use provider::{
    ChatCompletion, ChatMessage, ChatRequest, ProviderKind, SpeechAudio, SpeechRequest, TextStream,
    TranscribeRequest, TranscriptSegment, Transcription, VoiceProvider,
};
pub use service::{BridgeOptions, BridgeService, ConversationEvent, InboundFrame};
pub use simulated::SimulatedProvider;
