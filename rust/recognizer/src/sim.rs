//! Self-contained simulated engines.
//!
//! These back the test suite and let the server run end-to-end without model
//! files. The VAD is a plain energy detector honouring the configured
//! speech/silence durations; the recognizers emit one scripted word per
//! second of voiced audio; the embedding extractor is a normalized
//! autocorrelation, which keeps recordings of the same pitch close in cosine
//! space and different pitches far apart.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::config::{EndpointConfig, VadModelConfig};
use crate::error::{RecognizerError, Result};
use crate::traits::{
    DecoderKind, EmbeddingExtractor, EngineFactory, OfflineRecognizer, OfflineStream,
    OnlineRecognizer, OnlineStream, Punctuator, SessionDecoder, SessionOptions, SpeakerCounter,
    VoiceActivity, VoiceSegment,
};

/// Amplitude a sample must reach to count as voiced, for a probability
/// threshold of 1.0. The detector scales this by the configured threshold.
const FULL_SCALE_AMPLITUDE: f32 = 0.02;

const DEFAULT_WORDS: &[&str] = &["hello", "world", "how", "are", "you", "today"];

fn rms(window: &[f32]) -> f32 {
    if window.is_empty() {
        return 0.0;
    }
    let sum: f32 = window.iter().map(|s| s * s).sum();
    (sum / window.len() as f32).sqrt()
}

fn voiced_samples(samples: &[f32], amp_threshold: f32) -> usize {
    samples.iter().filter(|s| s.abs() >= amp_threshold).count()
}

/// Energy-threshold voice activity detector.
pub struct EnergyVad {
    amp_threshold: f32,
    window_size: usize,
    min_speech_windows: usize,
    min_silence_windows: usize,
    max_speech_windows: usize,

    windows_fed: usize,
    in_speech: bool,
    speech_run: usize,
    silence_run: usize,
    run_start: usize,
    pending: Vec<f32>,
    segments: VecDeque<VoiceSegment>,
}

impl EnergyVad {
    pub fn new(cfg: &VadModelConfig) -> Self {
        let window_size = cfg.window_size().max(1);
        let windows_per_sec = 1000.0 / cfg.window_size_ms.max(1.0);
        let to_windows = |secs: f32| ((secs * windows_per_sec).ceil() as usize).max(1);
        Self {
            amp_threshold: cfg.threshold * FULL_SCALE_AMPLITUDE,
            window_size,
            min_speech_windows: to_windows(cfg.min_speech_duration),
            min_silence_windows: to_windows(cfg.min_silence_duration),
            max_speech_windows: to_windows(cfg.max_speech_duration),
            windows_fed: 0,
            in_speech: false,
            speech_run: 0,
            silence_run: 0,
            run_start: 0,
            pending: Vec::new(),
            segments: VecDeque::new(),
        }
    }

    fn close_segment(&mut self) {
        let samples = std::mem::take(&mut self.pending);
        self.segments.push_back(VoiceSegment {
            start: self.run_start,
            samples,
        });
        self.in_speech = false;
        self.speech_run = 0;
        self.silence_run = 0;
    }
}

impl VoiceActivity for EnergyVad {
    fn accept_waveform(&mut self, window: &[f32]) {
        let voiced = rms(window) >= self.amp_threshold;

        if self.in_speech {
            self.pending.extend_from_slice(window);
            if voiced {
                self.silence_run = 0;
            } else {
                self.silence_run += 1;
            }
            let too_long = self.pending.len() >= self.max_speech_windows * self.window_size;
            if self.silence_run >= self.min_silence_windows || too_long {
                self.close_segment();
            }
        } else if voiced {
            if self.speech_run == 0 {
                self.run_start = self.windows_fed * self.window_size;
                self.pending.clear();
            }
            self.speech_run += 1;
            self.pending.extend_from_slice(window);
            if self.speech_run >= self.min_speech_windows {
                self.in_speech = true;
                self.silence_run = 0;
            }
        } else {
            self.speech_run = 0;
            self.pending.clear();
        }

        self.windows_fed += 1;
    }

    fn is_speech_detected(&self) -> bool {
        self.in_speech
    }

    fn pop_segment(&mut self) -> Option<VoiceSegment> {
        self.segments.pop_front()
    }
}

/// Offline recognizer producing one scripted word per second of voiced audio.
pub struct SimOfflineRecognizer {
    words: Arc<Vec<String>>,
    amp_threshold: f32,
}

impl SimOfflineRecognizer {
    pub fn new(words: Arc<Vec<String>>) -> Self {
        Self {
            words,
            amp_threshold: 0.5 * FULL_SCALE_AMPLITUDE,
        }
    }
}

impl OfflineRecognizer for SimOfflineRecognizer {
    fn create_stream(&self) -> Result<Box<dyn OfflineStream>> {
        Ok(Box::new(SimOfflineStream {
            words: self.words.clone(),
            amp_threshold: self.amp_threshold,
            sample_rate: 16000,
            voiced: 0,
            text: String::new(),
        }))
    }
}

struct SimOfflineStream {
    words: Arc<Vec<String>>,
    amp_threshold: f32,
    sample_rate: u32,
    voiced: usize,
    text: String,
}

impl OfflineStream for SimOfflineStream {
    fn accept_waveform(&mut self, sample_rate: u32, samples: &[f32]) {
        self.sample_rate = sample_rate;
        self.voiced += voiced_samples(samples, self.amp_threshold);
    }

    fn decode(&mut self) -> Result<()> {
        let n = ((self.voiced as f32 / self.sample_rate as f32).round() as usize)
            .min(self.words.len());
        self.text = self.words[..n].join(" ");
        Ok(())
    }

    fn text(&self) -> String {
        self.text.clone()
    }
}

/// Online recognizer with a trailing-silence endpointer.
pub struct SimOnlineRecognizer {
    words: Arc<Vec<String>>,
    endpoint: EndpointConfig,
    sample_rate: u32,
}

impl SimOnlineRecognizer {
    pub fn new(words: Arc<Vec<String>>, endpoint: EndpointConfig, sample_rate: u32) -> Self {
        Self {
            words,
            endpoint,
            sample_rate,
        }
    }
}

impl OnlineRecognizer for SimOnlineRecognizer {
    fn create_stream(&self) -> Result<Box<dyn OnlineStream>> {
        let rate = self.sample_rate as f32;
        Ok(Box::new(SimOnlineStream {
            words: self.words.clone(),
            amp_threshold: 0.5 * FULL_SCALE_AMPLITUDE,
            sample_rate: self.sample_rate,
            // one decode step per 100 ms of audio
            chunk: (self.sample_rate / 10) as usize,
            rule1_silence: (self.endpoint.rule1_min_trailing_silence * rate) as usize,
            rule2_silence: (self.endpoint.rule2_min_trailing_silence * rate) as usize,
            pending: 0,
            voiced: 0,
            trailing_silence: 0,
            seen_voice: false,
            text: String::new(),
        }))
    }
}

struct SimOnlineStream {
    words: Arc<Vec<String>>,
    amp_threshold: f32,
    sample_rate: u32,
    chunk: usize,
    rule1_silence: usize,
    rule2_silence: usize,

    pending: usize,
    voiced: usize,
    trailing_silence: usize,
    seen_voice: bool,
    text: String,
}

impl OnlineStream for SimOnlineStream {
    fn accept_waveform(&mut self, sample_rate: u32, samples: &[f32]) {
        self.sample_rate = sample_rate;
        for s in samples {
            if s.abs() >= self.amp_threshold {
                self.voiced += 1;
                self.trailing_silence = 0;
                self.seen_voice = true;
            } else {
                self.trailing_silence += 1;
            }
        }
        self.pending += samples.len();
    }

    fn is_ready(&self) -> bool {
        self.pending >= self.chunk
    }

    fn decode(&mut self) -> Result<()> {
        self.pending = 0;
        let n = ((self.voiced as f32 / self.sample_rate as f32).round() as usize)
            .min(self.words.len());
        self.text = self.words[..n].join(" ");
        Ok(())
    }

    fn is_endpoint(&self) -> bool {
        if self.seen_voice {
            self.trailing_silence >= self.rule2_silence
        } else {
            self.trailing_silence >= self.rule1_silence
        }
    }

    fn reset(&mut self) {
        self.pending = 0;
        self.voiced = 0;
        self.trailing_silence = 0;
        self.seen_voice = false;
        self.text.clear();
    }

    fn text(&self) -> String {
        self.text.clone()
    }
}

/// Punctuator that terminates a hypothesis with a period.
pub struct SimPunctuator;

impl Punctuator for SimPunctuator {
    fn add_punctuation(&self, text: &str) -> Result<String> {
        let trimmed = text.trim_end();
        if trimmed.is_empty() || trimmed.ends_with(['.', '!', '?', '。', '！', '？']) {
            return Ok(trimmed.to_string());
        }
        Ok(format!("{trimmed}."))
    }
}

/// Normalized-autocorrelation embedding extractor.
pub struct SimEmbeddingExtractor {
    dim: usize,
}

impl SimEmbeddingExtractor {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }
}

impl Default for SimEmbeddingExtractor {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EmbeddingExtractor for SimEmbeddingExtractor {
    fn dim(&self) -> usize {
        self.dim
    }

    fn compute(&self, sample_rate: u32, samples: &[f32]) -> Result<Vec<f32>> {
        let min_samples = (sample_rate / 2) as usize;
        if samples.len() < min_samples {
            return Err(RecognizerError::Embedding(format!(
                "audio too short: {} samples, need {}",
                samples.len(),
                min_samples
            )));
        }

        let n = samples.len() - self.dim - 1;
        let mut emb = Vec::with_capacity(self.dim);
        for lag in 1..=self.dim {
            let mut acc = 0.0f32;
            for i in 0..n {
                acc += samples[i] * samples[i + lag];
            }
            emb.push(acc / n as f32);
        }

        let norm = emb.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm < 1e-9 {
            return Err(RecognizerError::Embedding("silent audio".into()));
        }
        for v in &mut emb {
            *v /= norm;
        }
        Ok(emb)
    }
}

/// Speaker counter returning a fixed count.
pub struct SimSpeakerCounter {
    count: usize,
}

impl SimSpeakerCounter {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl SpeakerCounter for SimSpeakerCounter {
    fn count_speakers(&self, _sample_rate: u32, _samples: &[f32]) -> Result<usize> {
        Ok(self.count)
    }
}

/// Factory wiring the simulated engines into the session contract.
pub struct SimEngineFactory {
    kind: DecoderKind,
    vad: VadModelConfig,
    endpoint: EndpointConfig,
    sample_rate: u32,
    words: Arc<Vec<String>>,
    punctuator: Option<Arc<dyn Punctuator>>,
}

impl SimEngineFactory {
    /// Offline-with-VAD factory.
    pub fn offline(vad: VadModelConfig) -> Self {
        let sample_rate = vad.sample_rate;
        Self {
            kind: DecoderKind::OfflineVad,
            vad,
            endpoint: EndpointConfig::default(),
            sample_rate,
            words: Arc::new(DEFAULT_WORDS.iter().map(|w| w.to_string()).collect()),
            punctuator: None,
        }
    }

    /// Online factory with the given endpoint rules.
    pub fn online(endpoint: EndpointConfig, sample_rate: u32) -> Self {
        Self {
            kind: DecoderKind::Online,
            vad: VadModelConfig::default(),
            endpoint,
            sample_rate,
            words: Arc::new(DEFAULT_WORDS.iter().map(|w| w.to_string()).collect()),
            punctuator: None,
        }
    }

    /// Enables the period-appending punctuator.
    pub fn with_punctuation(mut self) -> Self {
        self.punctuator = Some(Arc::new(SimPunctuator));
        self
    }

    /// Replaces the scripted word list.
    pub fn with_words<I: IntoIterator<Item = S>, S: Into<String>>(mut self, words: I) -> Self {
        self.words = Arc::new(words.into_iter().map(Into::into).collect());
        self
    }
}

impl EngineFactory for SimEngineFactory {
    fn kind(&self) -> DecoderKind {
        self.kind
    }

    fn create_decoder(&self, opts: &SessionOptions) -> Result<SessionDecoder> {
        match self.kind {
            DecoderKind::OfflineVad => {
                let mut vad_cfg = self.vad.clone();
                // The client silence threshold wins only above the 50 ms floor.
                if let Some(ms) = opts.sentence_silence_ms {
                    if ms > 50 {
                        vad_cfg.min_silence_duration = ms as f32 / 1000.0;
                    }
                }
                Ok(SessionDecoder::OfflineVad {
                    vad: Box::new(EnergyVad::new(&vad_cfg)),
                    recognizer: Box::new(SimOfflineRecognizer::new(self.words.clone())),
                })
            }
            DecoderKind::Online => Ok(SessionDecoder::Online {
                recognizer: Box::new(SimOnlineRecognizer::new(
                    self.words.clone(),
                    self.endpoint.clone(),
                    self.sample_rate,
                )),
            }),
        }
    }

    fn punctuator(&self) -> Option<Arc<dyn Punctuator>> {
        self.punctuator.clone()
    }
}
