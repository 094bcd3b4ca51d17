// OpenAI-compatible upstream over HTTPS
//
// - POST {base}/audio/transcriptions  multipart WAV, verbose_json
// - POST {base}/chat/completions      json, optionally SSE-streamed
// - POST {base}/audio/speech          json, raw 24kHz PCM16LE back

use anyhow::Context;
use futures::stream::{BoxStream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use super::provider::{
    ChatCompletion, ChatRequest, SpeechAudio, SpeechRequest, TextStream, TranscribeRequest,
    TranscriptSegment, Transcription, VoiceProvider,
};
use crate::audio::wav_bytes;
use crate::config::UpstreamConfig;
use crate::error::VoiceError;

pub struct OpenAiProvider {
    client: reqwest::Client,
    api_key: String,
    defaults: UpstreamConfig,
}

impl OpenAiProvider {
    /// Reads the API key from the environment variable named in `cfg`
    pub fn new(cfg: &UpstreamConfig) -> anyhow::Result<Self> {
        let api_key = std::env::var(&cfg.api_key_env)
            .with_context(|| format!("{} is not set", cfg.api_key_env))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        info!("Using OpenAI-compatible upstream at {}", cfg.base_url);
        Ok(Self {
            client,
            api_key,
            defaults: cfg.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.defaults.base_url.trim_end_matches('/'), path)
    }

    async fn post(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, VoiceError> {
        let response = builder
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| VoiceError::Upstream(format!("request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VoiceError::Upstream(format!("status {}: {}", status, body)));
        }
        Ok(response)
    }

    fn chat_body(&self, request: &ChatRequest, stream: bool) -> serde_json::Value {
        json!({
            "model": request.model.as_deref().unwrap_or(&self.defaults.chat_model),
            "messages": request.upstream_messages(),
            "temperature": request.temperature.unwrap_or(self.defaults.temperature),
            "stream": stream,
        })
    }
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    text: String,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    text: String,
    start: f32,
    end: f32,
    #[serde(default)]
    avg_logprob: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    model: String,
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SseItem {
    Token(String),
    Done,
}

/// Splits a server-sent-event byte stream into chat tokens
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    pending: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseItem> {
        self.pending.extend_from_slice(chunk);

        let mut items = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let Some(data) = line.trim().strip_prefix("data:") else {
                continue;
            };
            let data = data.trim();

            if data == "[DONE]" {
                items.push(SseItem::Done);
                continue;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => items.extend(
                    chunk
                        .choices
                        .into_iter()
                        .filter_map(|c| c.delta.content)
                        .filter(|t| !t.is_empty())
                        .map(SseItem::Token),
                ),
                Err(e) => debug!("Skipping unparseable stream chunk: {}", e),
            }
        }
        items
    }
}

struct SseState {
    bytes: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    decoder: SseDecoder,
    tokens: VecDeque<String>,
    done: bool,
}

#[async_trait::async_trait]
impl VoiceProvider for OpenAiProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn transcribe(&self, request: &TranscribeRequest) -> Result<Transcription, VoiceError> {
        let wav = wav_bytes(&request.audio, request.sample_rate, request.channels)
            .map_err(|e| VoiceError::Upstream(format!("{:#}", e)))?;

        let file = reqwest::multipart::Part::bytes(wav)
            .file_name("turn.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Upstream(e.to_string()))?;
        let model = request
            .model
            .clone()
            .unwrap_or_else(|| self.defaults.transcribe_model.clone());

        let mut form = reqwest::multipart::Form::new()
            .part("file", file)
            .text("model", model)
            .text("response_format", "verbose_json");
        if let Some(language) = &request.language {
            form = form.text("language", language.clone());
        }

        let response = self
            .post(self.client.post(self.url("audio/transcriptions")).multipart(form))
            .await?;
        let body: VerboseTranscription = response
            .json()
            .await
            .map_err(|e| VoiceError::Upstream(format!("bad transcription body: {}", e)))?;

        let probabilities: Vec<f32> = body
            .segments
            .iter()
            .filter_map(|s| s.avg_logprob)
            .map(f32::exp)
            .collect();
        let confidence = if probabilities.is_empty() {
            None
        } else {
            Some(probabilities.iter().sum::<f32>() / probabilities.len() as f32)
        };

        Ok(Transcription {
            text: body.text.trim().to_string(),
            confidence,
            segments: body
                .segments
                .into_iter()
                .map(|s| TranscriptSegment {
                    text: s.text,
                    start: s.start,
                    end: s.end,
                })
                .collect(),
        })
    }

    async fn chat_completion(&self, request: &ChatRequest) -> Result<ChatCompletion, VoiceError> {
        let response = self
            .post(
                self.client
                    .post(self.url("chat/completions"))
                    .json(&self.chat_body(request, false)),
            )
            .await?;
        let body: ChatResponse = response
            .json()
            .await
            .map_err(|e| VoiceError::Upstream(format!("bad chat body: {}", e)))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| VoiceError::Upstream("chat response had no content".to_string()))?;

        Ok(ChatCompletion {
            text,
            model: body.model,
            tokens_used: body.usage.map(|u| u.total_tokens),
        })
    }

    async fn chat_stream(&self, request: &ChatRequest) -> Result<TextStream, VoiceError> {
        let response = self
            .post(
                self.client
                    .post(self.url("chat/completions"))
                    .json(&self.chat_body(request, true)),
            )
            .await?;

        let state = SseState {
            bytes: response.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed(),
            decoder: SseDecoder::default(),
            tokens: VecDeque::new(),
            done: false,
        };

        let stream = futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(token) = st.tokens.pop_front() {
                    return Some((Ok(token), st));
                }
                if st.done {
                    return None;
                }
                match st.bytes.next().await {
                    Some(Ok(chunk)) => {
                        for item in st.decoder.push(&chunk) {
                            match item {
                                SseItem::Token(token) => st.tokens.push_back(token),
                                SseItem::Done => st.done = true,
                            }
                        }
                    }
                    Some(Err(e)) => {
                        st.done = true;
                        st.tokens.clear();
                        return Some((Err(VoiceError::Upstream(format!("stream broke: {}", e))), st));
                    }
                    None => st.done = true,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn synthesize(&self, request: &SpeechRequest) -> Result<SpeechAudio, VoiceError> {
        let body = json!({
            "model": request.model.as_deref().unwrap_or(&self.defaults.speech_model),
            "input": request.text,
            "voice": request.voice.as_deref().unwrap_or(&self.defaults.voice),
            "speed": request.speed.unwrap_or(self.defaults.speed),
            "response_format": "pcm",
        });

        let response = self
            .post(self.client.post(self.url("audio/speech")).json(&body))
            .await?;
        let audio_bytes = response
            .bytes()
            .await
            .map_err(|e| VoiceError::Upstream(format!("speech body: {}", e)))?
            .to_vec();

        Ok(SpeechAudio {
            audio_bytes,
            format: "pcm16".to_string(),
        })
    }
}
