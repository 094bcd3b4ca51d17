use serde::{Deserialize, Serialize};

/// Close code for an expected shutdown; anything else is abnormal
pub const NORMAL_CLOSURE: u16 = 1000;

/// Messages received by the client (sent by the bridge)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    /// Handshake: nothing else is acted on before this arrives
    #[serde(rename = "session.connected")]
    SessionConnected {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    #[serde(rename = "session.disconnected")]
    SessionDisconnected { code: u16, reason: String },

    /// Base64 PCM16LE chunk of assistant speech
    #[serde(rename = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.audio_transcript.delta")]
    AudioTranscriptDelta { delta: String },

    #[serde(rename = "response.audio_transcript.done")]
    AudioTranscriptDone,

    #[serde(rename = "response.text.delta")]
    TextDelta { delta: String },

    #[serde(rename = "response.text.done")]
    TextDone {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },

    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptDelta { delta: String },

    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptCompleted { transcript: String },

    #[serde(rename = "error")]
    Error { message: String },

    /// Reply to a client `ping`
    #[serde(rename = "pong")]
    Pong,

    /// Any kind this client does not know about
    #[serde(other)]
    Unknown,
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            ServerEvent::SessionConnected { .. } => "session.connected",
            ServerEvent::SessionDisconnected { .. } => "session.disconnected",
            ServerEvent::AudioDelta { .. } => "response.audio.delta",
            ServerEvent::AudioDone => "response.audio.done",
            ServerEvent::AudioTranscriptDelta { .. } => "response.audio_transcript.delta",
            ServerEvent::AudioTranscriptDone => "response.audio_transcript.done",
            ServerEvent::TextDelta { .. } => "response.text.delta",
            ServerEvent::TextDone { .. } => "response.text.done",
            ServerEvent::InputTranscriptDelta { .. } => {
                "conversation.item.input_audio_transcription.delta"
            }
            ServerEvent::InputTranscriptCompleted { .. } => {
                "conversation.item.input_audio_transcription.completed"
            }
            ServerEvent::Error { .. } => "error",
            ServerEvent::Pong => "pong",
            ServerEvent::Unknown => "unknown",
        }
    }
}

/// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    /// Base64 PCM16LE capture frame
    #[serde(rename = "input_audio_buffer.append")]
    AudioAppend {
        audio: String,
        #[serde(default, skip_serializing_if = "is_false")]
        is_final: bool,
    },

    /// End of the current turn without further audio
    #[serde(rename = "input_audio_buffer.commit")]
    AudioCommit,

    #[serde(rename = "ping")]
    Ping,
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Session configuration sent in `session.update` after the handshake
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub modalities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub sample_rate: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            modalities: vec!["text".to_string(), "audio".to_string()],
            voice: None,
            instructions: None,
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            sample_rate: 24000,
        }
    }
}

impl SessionConfig {
    pub fn from_config(cfg: &crate::config::Config) -> Self {
        Self {
            voice: Some(cfg.upstream.voice.clone()),
            instructions: cfg.upstream.system_prompt.clone(),
            sample_rate: cfg.audio.sample_rate,
            ..Self::default()
        }
    }
}
