use anyhow::{bail, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub service: ServiceConfig,
    pub client: ClientConfig,
    pub audio: AudioConfig,
    pub upstream: UpstreamConfig,
    pub bridge: BridgeSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    pub bind: String,
    pub port: u16,
}

/// Connection manager knobs (all durations in milliseconds)
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub url: String,
    pub connect_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub stale_after_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_jitter: f64,
    pub max_reconnect_attempts: u32,
    pub send_queue: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    /// `openai` or `simulated`
    pub kind: String,
    pub base_url: String,
    /// Name of the environment variable holding the API key
    pub api_key_env: String,
    pub transcribe_model: String,
    pub chat_model: String,
    pub speech_model: String,
    pub voice: String,
    pub speed: f32,
    pub temperature: f32,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeSettings {
    pub synthesize_speech: bool,
    pub max_turn_bytes: usize,
    pub event_buffer: usize,
}

impl Config {
    /// Load configuration: built-in defaults, then `path` (optional file),
    /// then `LOQA_VOICE__*` environment overrides.
    pub fn load(path: &str) -> Result<Self> {
        let settings = Self::defaults()?
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("LOQA_VOICE").separator("__"))
            .build()?;

        let cfg: Config = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        Ok(config::Config::builder()
            .set_default("service.name", "loqa-voice")?
            .set_default("service.http.bind", "127.0.0.1")?
            .set_default("service.http.port", 8787)?
            .set_default("client.url", "ws://127.0.0.1:8787/v1/conversation")?
            .set_default("client.connect_timeout_ms", 20_000)?
            .set_default("client.heartbeat_interval_ms", 30_000)?
            .set_default("client.stale_after_ms", 40_000)?
            .set_default("client.backoff_base_ms", 1_000)?
            .set_default("client.backoff_max_ms", 10_000)?
            .set_default("client.backoff_jitter", 0.3)?
            .set_default("client.max_reconnect_attempts", 5)?
            .set_default("client.send_queue", 256)?
            .set_default("audio.sample_rate", 24_000)?
            .set_default("audio.channels", 1)?
            .set_default("audio.frame_ms", 100)?
            .set_default("upstream.kind", "simulated")?
            .set_default("upstream.base_url", "https://api.openai.com/v1")?
            .set_default("upstream.api_key_env", "OPENAI_API_KEY")?
            .set_default("upstream.transcribe_model", "whisper-1")?
            .set_default("upstream.chat_model", "gpt-4o-mini")?
            .set_default("upstream.speech_model", "tts-1")?
            .set_default("upstream.voice", "alloy")?
            .set_default("upstream.speed", 1.0)?
            .set_default("upstream.temperature", 0.7)?
            .set_default("bridge.synthesize_speech", true)?
            .set_default("bridge.max_turn_bytes", 10 * 1024 * 1024)?
            .set_default("bridge.event_buffer", 64)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service.http.port == 0 {
            bail!("service.http.port cannot be 0");
        }
        let c = &self.client;
        if c.connect_timeout_ms == 0 || c.heartbeat_interval_ms == 0 || c.stale_after_ms == 0 {
            bail!("client timeouts and intervals must be greater than 0");
        }
        if c.stale_after_ms * 2 < c.heartbeat_interval_ms {
            bail!(
                "client.stale_after_ms ({}) is too short for heartbeat interval {}ms",
                c.stale_after_ms,
                c.heartbeat_interval_ms
            );
        }
        if !(0.0..=1.0).contains(&c.backoff_jitter) {
            bail!("client.backoff_jitter must be within [0, 1]");
        }
        if c.backoff_base_ms == 0 || c.backoff_max_ms < c.backoff_base_ms {
            bail!("client.backoff_max_ms must be >= backoff_base_ms > 0");
        }
        if c.max_reconnect_attempts == 0 || c.send_queue == 0 {
            bail!("client.max_reconnect_attempts and client.send_queue must be greater than 0");
        }
        if self.audio.sample_rate == 0 || self.audio.channels == 0 || self.audio.frame_ms == 0 {
            bail!("audio format values must be greater than 0");
        }
        if self.bridge.max_turn_bytes == 0 || self.bridge.event_buffer == 0 {
            bail!("bridge buffers must be greater than 0");
        }
        Ok(())
    }
}
