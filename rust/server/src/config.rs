//! Server configuration.
//!
//! Values merge in order: built-in defaults, then a YAML file (`--config`
//! or `ZASR_CONFIG`), then command-line flags. Model-path defaults consult
//! `MODELS_DIR` and `DEPLOY_DIR`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use zasr_recognizer::{
    OfflineModelConfig, OnlineModelConfig, PunctuationConfig, RecognizerType, VadModelConfig,
};

use crate::error::{Result, ServerError};
use crate::session::PipelineConfig;

/// Speaker-identification settings.
#[derive(Debug, Clone)]
pub struct SpeakerIdConfig {
    pub enabled: bool,
    /// Path to the embedding model.
    pub model: PathBuf,
    /// Voice-print database root; empty selects `~/.zasr/voice-prints`.
    pub db: PathBuf,
    /// Cosine similarity a match must reach.
    pub threshold: f32,
    /// Track unmatched voices as `unknown-N`.
    pub auto_track: bool,
}

impl Default for SpeakerIdConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            model: PathBuf::new(),
            db: PathBuf::new(),
            threshold: 0.75,
            auto_track: true,
        }
    }
}

/// Full server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_connections: usize,
    pub worker_threads: usize,

    pub sample_rate: u32,
    /// Bytes per sample; the protocol is fixed to s16le.
    pub sample_width: usize,

    pub recognizer_type: RecognizerType,
    pub vad: VadModelConfig,
    pub offline: OfflineModelConfig,
    pub online: OnlineModelConfig,
    pub punctuation: PunctuationConfig,
    pub speaker: SpeakerIdConfig,

    /// Minimum interval between partial results, in ms.
    pub update_interval_ms: u64,
    /// Decode batching cap, reserved for batching backends.
    pub max_batch_size: usize,

    pub connection_timeout: Duration,
    pub recognition_timeout: Duration,

    pub log_file: Option<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2026,
            max_connections: 256,
            worker_threads: 4,
            sample_rate: 16000,
            sample_width: 2,
            recognizer_type: RecognizerType::SenseVoice,
            vad: VadModelConfig::default(),
            offline: OfflineModelConfig::default(),
            online: OnlineModelConfig::default(),
            punctuation: PunctuationConfig::default(),
            speaker: SpeakerIdConfig::default(),
            update_interval_ms: 200,
            max_batch_size: 5,
            connection_timeout: Duration::from_secs(15),
            recognition_timeout: Duration::from_secs(30),
            log_file: None,
            data_dir: None,
        }
    }
}

/// Returns the default location for a model file: `$MODELS_DIR/<name>`,
/// `$DEPLOY_DIR/models/<name>`, or `/models/k2-fsa/<name>`.
pub fn default_model_path(name: &str) -> PathBuf {
    if let Ok(dir) = std::env::var("MODELS_DIR") {
        if !dir.is_empty() {
            return Path::new(&dir).join(name);
        }
    }
    if let Ok(dir) = std::env::var("DEPLOY_DIR") {
        if !dir.is_empty() {
            return Path::new(&dir).join("models").join(name);
        }
    }
    Path::new("/models/k2-fsa").join(name)
}

// YAML file schema. Every key is optional; present keys override the
// defaults accumulated so far.

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlFile {
    server: YamlServer,
    audio: YamlAudio,
    vad: YamlVad,
    asr: YamlAsr,
    punctuation: YamlPunctuation,
    processing: YamlProcessing,
    speaker: YamlSpeaker,
    timeouts: YamlTimeouts,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlServer {
    host: Option<String>,
    port: Option<u16>,
    max_connections: Option<usize>,
    worker_threads: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlAudio {
    sample_rate: Option<u32>,
    sample_width: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlVad {
    enabled: Option<bool>,
    model: Option<PathBuf>,
    threshold: Option<f32>,
    min_silence_duration: Option<f32>,
    min_speech_duration: Option<f32>,
    max_speech_duration: Option<f32>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlAsr {
    #[serde(rename = "type")]
    kind: Option<String>,
    num_threads: Option<usize>,
    use_itn: Option<bool>,
    sense_voice: YamlOfflineModel,
    streaming_zipformer: YamlOnlineModel,
    streaming_paraformer: YamlOnlineModel,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlOfflineModel {
    model: Option<PathBuf>,
    tokens: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlOnlineModel {
    encoder: Option<PathBuf>,
    decoder: Option<PathBuf>,
    joiner: Option<PathBuf>,
    tokens: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlPunctuation {
    enabled: Option<bool>,
    model: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlProcessing {
    vad_window_size_ms: Option<f32>,
    update_interval_ms: Option<u64>,
    max_batch_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlSpeaker {
    enabled: Option<bool>,
    model: Option<PathBuf>,
    db: Option<PathBuf>,
    threshold: Option<f32>,
    auto_track: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct YamlTimeouts {
    connection: Option<u64>,
    recognition: Option<u64>,
}

macro_rules! merge {
    ($target:expr, $value:expr) => {
        if let Some(v) = $value {
            $target = v;
        }
    };
}

impl ServerConfig {
    /// Applies a YAML config file over the current values.
    pub fn apply_yaml_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        self.apply_yaml(&text)
    }

    /// Applies YAML text over the current values.
    pub fn apply_yaml(&mut self, text: &str) -> Result<()> {
        let file: YamlFile = serde_yaml::from_str(text)?;

        merge!(self.host, file.server.host);
        merge!(self.port, file.server.port);
        merge!(self.max_connections, file.server.max_connections);
        merge!(self.worker_threads, file.server.worker_threads);

        merge!(self.sample_rate, file.audio.sample_rate);
        merge!(self.sample_width, file.audio.sample_width);

        if file.vad.enabled == Some(false) {
            // VAD is optional for the streaming recognizers
            self.vad.model = PathBuf::new();
        }
        merge!(self.vad.model, file.vad.model);
        merge!(self.vad.threshold, file.vad.threshold);
        merge!(self.vad.min_silence_duration, file.vad.min_silence_duration);
        merge!(self.vad.min_speech_duration, file.vad.min_speech_duration);
        merge!(self.vad.max_speech_duration, file.vad.max_speech_duration);

        if let Some(kind) = file.asr.kind {
            self.recognizer_type = RecognizerType::parse(&kind)
                .ok_or_else(|| ServerError::Config(format!("unknown asr.type: {kind}")))?;
        }
        if let Some(n) = file.asr.num_threads {
            self.offline.num_threads = n;
            self.online.num_threads = n;
        }
        merge!(self.offline.use_itn, file.asr.use_itn);
        merge!(self.offline.model, file.asr.sense_voice.model);
        if let Some(tokens) = file.asr.sense_voice.tokens {
            self.offline.tokens = tokens.clone();
            self.online.tokens = tokens;
        }
        let streaming = match self.recognizer_type {
            RecognizerType::StreamingParaformer => file.asr.streaming_paraformer,
            _ => file.asr.streaming_zipformer,
        };
        merge!(self.online.encoder, streaming.encoder);
        merge!(self.online.decoder, streaming.decoder);
        if streaming.joiner.is_some() {
            self.online.joiner = streaming.joiner;
        }
        merge!(self.online.tokens, streaming.tokens);

        merge!(self.punctuation.enabled, file.punctuation.enabled);
        merge!(self.punctuation.model, file.punctuation.model);

        merge!(self.vad.window_size_ms, file.processing.vad_window_size_ms);
        merge!(self.update_interval_ms, file.processing.update_interval_ms);
        merge!(self.max_batch_size, file.processing.max_batch_size);

        merge!(self.speaker.enabled, file.speaker.enabled);
        merge!(self.speaker.model, file.speaker.model);
        merge!(self.speaker.db, file.speaker.db);
        merge!(self.speaker.threshold, file.speaker.threshold);
        merge!(self.speaker.auto_track, file.speaker.auto_track);

        if let Some(secs) = file.timeouts.connection {
            self.connection_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.timeouts.recognition {
            self.recognition_timeout = Duration::from_secs(secs);
        }

        Ok(())
    }

    /// Fills in default model locations for paths still unset.
    pub fn fill_model_defaults(&mut self) {
        if self.recognizer_type == RecognizerType::SenseVoice
            && self.vad.model.as_os_str().is_empty()
        {
            self.vad.model = default_model_path("silero_vad.int8.onnx");
        }
        if self.punctuation.enabled && self.punctuation.model.as_os_str().is_empty() {
            self.punctuation.model = default_model_path(
                "sherpa-onnx-punct-ct-transformer-zh-en-vocab272727-2024-04-12/model.onnx",
            );
        }
    }

    /// Checks the configuration is complete enough to start.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ServerError::Config("port must be non-zero".into()));
        }
        if self.sample_rate != 16000 {
            return Err(ServerError::Config(format!(
                "unsupported sample rate: {} (only 16000 is supported)",
                self.sample_rate
            )));
        }
        if self.worker_threads == 0 {
            return Err(ServerError::Config("worker_threads must be at least 1".into()));
        }

        match self.recognizer_type {
            RecognizerType::SenseVoice => {
                if self.offline.tokens.as_os_str().is_empty() {
                    return Err(ServerError::Config("tokens path is required".into()));
                }
                if self.vad.model.as_os_str().is_empty() {
                    return Err(ServerError::Config(
                        "silero VAD model is required for sense-voice".into(),
                    ));
                }
            }
            RecognizerType::StreamingZipformer => {
                if self.online.tokens.as_os_str().is_empty() {
                    return Err(ServerError::Config("tokens path is required".into()));
                }
                if self.online.encoder.as_os_str().is_empty()
                    || self.online.decoder.as_os_str().is_empty()
                    || self.online.joiner.is_none()
                {
                    return Err(ServerError::Config(
                        "streaming-zipformer requires encoder, decoder and joiner models".into(),
                    ));
                }
            }
            RecognizerType::StreamingParaformer => {
                if self.online.tokens.as_os_str().is_empty() {
                    return Err(ServerError::Config("tokens path is required".into()));
                }
                if self.online.encoder.as_os_str().is_empty()
                    || self.online.decoder.as_os_str().is_empty()
                {
                    return Err(ServerError::Config(
                        "streaming-paraformer requires encoder and decoder models".into(),
                    ));
                }
            }
        }
        Ok(())
    }

    /// The per-session pipeline tuning derived from this config.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            sample_rate: self.sample_rate,
            vad_window_size: self.vad.window_size(),
            update_interval: Duration::from_millis(self.update_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_expectations() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 2026);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.worker_threads, 4);
        assert_eq!(cfg.sample_rate, 16000);
        assert_eq!(cfg.connection_timeout, Duration::from_secs(15));
        assert_eq!(cfg.update_interval_ms, 200);
        assert_eq!(cfg.recognizer_type, RecognizerType::SenseVoice);
    }

    #[test]
    fn yaml_overrides_defaults() {
        let mut cfg = ServerConfig::default();
        cfg.apply_yaml(
            r#"
server:
  host: 127.0.0.1
  port: 9000
  worker_threads: 8
vad:
  threshold: 0.6
asr:
  type: streaming-zipformer
  streaming_zipformer:
    encoder: /m/encoder.onnx
    decoder: /m/decoder.onnx
    joiner: /m/joiner.onnx
    tokens: /m/tokens.txt
processing:
  update_interval_ms: 100
timeouts:
  connection: 30
"#,
        )
        .unwrap();

        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.worker_threads, 8);
        assert_eq!(cfg.vad.threshold, 0.6);
        assert_eq!(cfg.recognizer_type, RecognizerType::StreamingZipformer);
        assert_eq!(cfg.online.encoder, PathBuf::from("/m/encoder.onnx"));
        assert_eq!(cfg.online.joiner, Some(PathBuf::from("/m/joiner.onnx")));
        assert_eq!(cfg.update_interval_ms, 100);
        assert_eq!(cfg.connection_timeout, Duration::from_secs(30));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unknown_yaml_keys_are_ignored() {
        let mut cfg = ServerConfig::default();
        cfg.apply_yaml("server:\n  port: 1234\nfuture_section:\n  knob: 1\n")
            .unwrap();
        assert_eq!(cfg.port, 1234);
    }

    #[test]
    fn bad_asr_type_is_rejected() {
        let mut cfg = ServerConfig::default();
        assert!(cfg.apply_yaml("asr:\n  type: whisper\n").is_err());
    }

    #[test]
    fn validate_requires_models_per_recognizer() {
        let mut cfg = ServerConfig::default();
        // sense-voice without tokens
        assert!(cfg.validate().is_err());

        cfg.offline.tokens = PathBuf::from("/m/tokens.txt");
        cfg.vad.model = PathBuf::from("/m/vad.onnx");
        assert!(cfg.validate().is_ok());

        cfg.recognizer_type = RecognizerType::StreamingZipformer;
        cfg.online.tokens = PathBuf::from("/m/tokens.txt");
        cfg.online.encoder = PathBuf::from("/m/enc.onnx");
        cfg.online.decoder = PathBuf::from("/m/dec.onnx");
        // missing joiner
        assert!(cfg.validate().is_err());
        cfg.online.joiner = Some(PathBuf::from("/m/join.onnx"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn rejects_non_16k_sample_rate() {
        let cfg = ServerConfig {
            sample_rate: 8000,
            ..ServerConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
