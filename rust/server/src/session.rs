//! Per-connection session: protocol state machine and audio pipeline.
//!
//! A session is driven from two sides. Text frames arrive synchronously on
//! the control executor through [`Session::handle_text`]; binary frames and
//! the end-of-session drain arrive in order on the work executor through
//! [`Session::handle_binary`] / [`Session::finish`]. All outbound traffic
//! goes through the [`Outbound`] seam, which buffers onto the connection's
//! send lane, so no lock is ever held across an await and no reentrancy is
//! needed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use zasr_recognizer::{
    DecoderKind, EngineFactory, Punctuator, SessionDecoder, SessionOptions,
};
use zasr_voiceprint::SpeakerIdentifier;

use crate::protocol::{self, code, BeginPayload};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, waiting for `Begin`.
    Connected,
    /// `Begin` accepted, no audio yet.
    Started,
    /// Audio flowing.
    Processing,
    /// Draining; no further input is accepted.
    Closing,
    /// Resources released.
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connected => "connected",
            SessionState::Started => "started",
            SessionState::Processing => "processing",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Client options from the `Begin` payload.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub format: String,
    pub sample_rate: u32,
    pub use_itn: bool,
    pub sentence_silence_ms: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            format: "pcm".to_string(),
            sample_rate: 16000,
            use_itn: true,
            sentence_silence_ms: 800,
        }
    }
}

impl From<&BeginPayload> for ClientConfig {
    fn from(p: &BeginPayload) -> Self {
        Self {
            format: p.fmt.clone(),
            sample_rate: p.rate,
            use_itn: p.itn,
            sentence_silence_ms: p.silence,
        }
    }
}

/// Sink for outbound frames. The server's implementation posts onto the
/// connection's ordered send lane on the control executor.
pub trait Outbound: Send + Sync {
    /// Queues one text frame.
    fn send(&self, text: String);

    /// Queues a close of the underlying socket.
    fn close(&self, reason: &str);
}

/// What the control executor must do after a text frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextAction {
    /// Nothing; any reply was already queued.
    None,
    /// Queue a drain job behind the session's pending audio.
    Drain,
}

/// Pipeline tuning shared by all sessions.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// The only accepted inbound sample rate.
    pub sample_rate: u32,
    /// VAD window size in samples.
    pub vad_window_size: usize,
    /// Minimum interval between partial `Result` events.
    pub update_interval: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            vad_window_size: 480,
            update_interval: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SentenceState {
    index: u32,
    begin_time: u64,
    current_time: u64,
    text: String,
    active: bool,
}

struct SessionInner {
    state: SessionState,
    session_id: String,
    client: ClientConfig,

    decoder: Option<SessionDecoder>,
    offline_stream: Option<Box<dyn zasr_recognizer::OfflineStream>>,
    online_stream: Option<Box<dyn zasr_recognizer::OnlineStream>>,

    /// Raw s16le samples awaiting processing.
    audio: Vec<i16>,
    /// Next VAD read position, in samples of the float view of `audio`.
    vad_offset: usize,
    /// Samples already fed to the decoder stream.
    streamed_offset: usize,
    speech_started: bool,

    total_samples: u64,
    total_ms: u64,

    sentence: SentenceState,
    sentence_counter: u32,
    last_update: Instant,

    /// Audio of the sentence in flight, for speaker identification.
    sentence_audio: Vec<i16>,
}

/// One WebSocket connection's session.
pub struct Session {
    conn_id: u64,
    out: Arc<dyn Outbound>,
    engines: Arc<dyn EngineFactory>,
    punctuator: Option<Arc<dyn Punctuator>>,
    speaker: Option<Arc<SpeakerIdentifier>>,
    cfg: PipelineConfig,

    created: Instant,
    last_activity_ms: AtomicU64,
    inner: Mutex<SessionInner>,
}

fn to_floats(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|s| *s as f32 / 32768.0).collect()
}

impl Session {
    pub fn new(
        conn_id: u64,
        out: Arc<dyn Outbound>,
        engines: Arc<dyn EngineFactory>,
        speaker: Option<Arc<SpeakerIdentifier>>,
        cfg: PipelineConfig,
    ) -> Self {
        let punctuator = engines.punctuator();
        Self {
            conn_id,
            out,
            engines,
            punctuator,
            speaker,
            cfg,
            created: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
            inner: Mutex::new(SessionInner {
                state: SessionState::Connected,
                session_id: String::new(),
                client: ClientConfig::default(),
                decoder: None,
                offline_stream: None,
                online_stream: None,
                audio: Vec::new(),
                vad_offset: 0,
                streamed_offset: 0,
                speech_started: false,
                total_samples: 0,
                total_ms: 0,
                sentence: SentenceState::default(),
                sentence_counter: 0,
                last_update: Instant::now(),
                sentence_audio: Vec::new(),
            }),
        }
    }

    /// The connection this session belongs to.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Current state, for logs and tests.
    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// Records inbound activity. The reaper reads the stamp without taking
    /// the session lock.
    pub fn touch(&self) {
        self.last_activity_ms
            .store(self.created.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    /// Time since the last inbound frame.
    pub fn idle(&self) -> Duration {
        let now = self.created.elapsed().as_millis() as u64;
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(now.saturating_sub(last))
    }

    fn emit_failed(&self, inner: &SessionInner, status: i32, text: &str) {
        let sid = if inner.session_id.is_empty() {
            None
        } else {
            Some(inner.session_id.as_str())
        };
        self.out.send(protocol::failed(sid, status, text));
    }

    /// Handles one inbound text frame. Runs on the control executor.
    pub fn handle_text(&self, text: &str) -> TextAction {
        self.touch();
        let inner = &mut *self.inner.lock();
        if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
            return TextAction::None;
        }

        let inbound = match protocol::parse_inbound(text) {
            Ok(inbound) => inbound,
            Err(violation) => {
                self.emit_failed(inner, violation.code, &violation.message);
                return TextAction::None;
            }
        };

        match inbound.name.as_str() {
            "Begin" => {
                self.handle_begin(inner, &inbound.payload);
                TextAction::None
            }
            "End" => {
                if inner.state == SessionState::Connected {
                    self.emit_failed(inner, code::NOT_STARTED, "Transcription not started");
                    TextAction::None
                } else {
                    TextAction::Drain
                }
            }
            other => {
                self.emit_failed(
                    inner,
                    code::UNSUPPORTED_NAME,
                    &format!("Unsupported message name: {other}"),
                );
                TextAction::None
            }
        }
    }

    fn handle_begin(&self, inner: &mut SessionInner, payload: &Value) {
        if inner.state != SessionState::Connected {
            self.emit_failed(inner, code::INVALID_STATE_FOR_BEGIN, "Invalid state for Begin");
            return;
        }

        let begin = BeginPayload::from_value(payload);
        if begin.fmt != "pcm" {
            self.emit_failed(
                inner,
                code::UNSUPPORTED_AUDIO_FORMAT,
                &format!("Unsupported audio format: {}", begin.fmt),
            );
            return;
        }
        if begin.rate != self.cfg.sample_rate {
            self.emit_failed(
                inner,
                code::UNSUPPORTED_SAMPLE_RATE,
                &format!("Unsupported sample rate: {}Hz", begin.rate),
            );
            return;
        }

        let opts = SessionOptions {
            sample_rate: self.cfg.sample_rate,
            use_itn: begin.itn,
            sentence_silence_ms: Some(begin.silence),
        };
        match self.engines.create_decoder(&opts) {
            Ok(decoder) => inner.decoder = Some(decoder),
            Err(e) => {
                warn!(conn = self.conn_id, error = %e, "decoder construction failed");
                self.emit_failed(
                    inner,
                    code::BEGIN_FAILED,
                    &format!("Error processing Begin: {e}"),
                );
                return;
            }
        }

        inner.client = ClientConfig::from(&begin);
        inner.session_id = begin
            .session_id
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.out.send(protocol::started(&inner.session_id));
        inner.state = SessionState::Started;
        info!(conn = self.conn_id, sid = %inner.session_id, "transcription started");
    }

    /// Handles one binary audio frame. Runs on the work executor, in arrival
    /// order for this session.
    pub fn handle_binary(&self, data: &[u8]) {
        self.touch();
        let inner = &mut *self.inner.lock();
        match inner.state {
            SessionState::Closing | SessionState::Closed => return,
            SessionState::Started | SessionState::Processing => {}
            SessionState::Connected => {
                self.emit_failed(
                    inner,
                    code::BINARY_IN_WRONG_STATE,
                    "Transcription not started or wrong state",
                );
                return;
            }
        }

        // s16le; a trailing odd byte is ignored
        let samples: Vec<i16> = data
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        if samples.is_empty() {
            return;
        }

        let kind = match inner.decoder.as_ref() {
            Some(decoder) => decoder.kind(),
            None => return,
        };

        inner.audio.extend_from_slice(&samples);
        inner.total_samples += samples.len() as u64;
        inner.total_ms = inner.total_samples / (self.cfg.sample_rate as u64 / 1000);
        if kind == DecoderKind::OfflineVad && inner.speech_started {
            inner.sentence_audio.extend_from_slice(&samples);
        }

        if inner.state == SessionState::Started {
            inner.state = SessionState::Processing;
        }

        let result = match kind {
            DecoderKind::OfflineVad => self.process_offline(inner),
            DecoderKind::Online => self.process_online(inner),
        };
        if let Err(e) = result {
            self.pipeline_failure(inner, &e);
        }
    }

    /// Offline mode: walk VAD windows over the buffered audio, open a
    /// sentence when speech starts, feed the decoder incrementally, and
    /// finalize when the VAD closes a segment.
    fn process_offline(&self, inner: &mut SessionInner) -> zasr_recognizer::Result<()> {
        let w = self.cfg.vad_window_size;
        let SessionInner {
            decoder,
            offline_stream,
            audio,
            vad_offset,
            streamed_offset,
            speech_started,
            total_samples,
            total_ms,
            sentence,
            sentence_counter,
            last_update,
            sentence_audio,
            session_id,
            ..
        } = inner;
        let Some(SessionDecoder::OfflineVad { vad, recognizer }) = decoder.as_mut() else {
            return Ok(());
        };

        let mut floats = to_floats(audio);

        while *vad_offset + w <= floats.len() {
            vad.accept_waveform(&floats[*vad_offset..*vad_offset + w]);

            if !*speech_started && vad.is_speech_detected() {
                *speech_started = true;
                *streamed_offset = 0;
                *offline_stream = Some(recognizer.create_stream()?);

                *sentence_counter += 1;
                *sentence = SentenceState {
                    index: *sentence_counter,
                    begin_time: *total_ms,
                    current_time: *total_ms,
                    text: String::new(),
                    active: true,
                };
                *sentence_audio = audio.clone();
                self.out
                    .send(protocol::sentence_begin(session_id, *sentence_counter, *total_ms));
                debug!(conn = self.conn_id, idx = *sentence_counter, "speech detected");
            }

            *vad_offset += w;
        }

        // Bound memory during silence: keep only the last 10 windows, and
        // move both offsets back by the same amount, clamped at zero.
        if !*speech_started && floats.len() > 10 * w {
            let excess = floats.len() - 10 * w;
            *vad_offset = vad_offset.saturating_sub(excess);
            *streamed_offset = streamed_offset.saturating_sub(excess);
            audio.drain(..excess);
            floats.drain(..excess);
            debug!(conn = self.conn_id, kept = floats.len(), "trimmed silent buffer");
        }

        if *speech_started {
            if let Some(stream) = offline_stream.as_mut() {
                if *streamed_offset > floats.len() {
                    *streamed_offset = 0;
                }
                if *streamed_offset < floats.len() {
                    stream.accept_waveform(self.cfg.sample_rate, &floats[*streamed_offset..]);
                    *streamed_offset = floats.len();
                }

                if last_update.elapsed() >= self.cfg.update_interval {
                    stream.decode()?;
                    let text = stream.text();
                    sentence.current_time = *total_ms;
                    if text != sentence.text {
                        sentence.text = text;
                        self.out.send(protocol::result(
                            session_id,
                            sentence.index,
                            *total_ms,
                            &sentence.text,
                            None,
                        ));
                    }
                    *last_update = Instant::now();
                }
            }
        }

        let mut segments = 0;
        while vad.pop_segment().is_some() {
            segments += 1;
        }
        if segments > 0 {
            if let Some(mut stream) = offline_stream.take() {
                stream.decode()?;
                sentence.text = stream.text();
                sentence.current_time = *total_ms;

                let final_text = self.punctuate(&sentence.text);
                let speaker = self.identify_speaker(sentence_audio);
                debug_assert_eq!(*total_ms, *total_samples / (self.cfg.sample_rate as u64 / 1000));
                self.out.send(protocol::sentence_end(
                    session_id,
                    sentence.index,
                    *total_ms,
                    sentence.begin_time,
                    &final_text,
                    speaker.as_ref(),
                ));
                info!(conn = self.conn_id, idx = sentence.index, text = %final_text, "sentence finalized");
                sentence.active = false;
            }

            *speech_started = false;
            *streamed_offset = 0;
            *vad_offset = 0;
            audio.clear();
            sentence_audio.clear();
        }

        Ok(())
    }

    /// Online mode: the recognizer's endpointer segments the stream; staging
    /// buffers are not retained between arrivals.
    fn process_online(&self, inner: &mut SessionInner) -> zasr_recognizer::Result<()> {
        let SessionInner {
            decoder,
            online_stream,
            audio,
            total_ms,
            sentence,
            sentence_counter,
            sentence_audio,
            session_id,
            ..
        } = inner;
        let Some(SessionDecoder::Online { recognizer }) = decoder.as_mut() else {
            return Ok(());
        };

        if online_stream.is_none() {
            *online_stream = Some(recognizer.create_stream()?);
            *sentence_counter += 1;
            *sentence = SentenceState {
                index: *sentence_counter,
                begin_time: *total_ms,
                current_time: *total_ms,
                text: String::new(),
                active: true,
            };
            self.out
                .send(protocol::sentence_begin(session_id, *sentence_counter, *total_ms));
        }
        let Some(stream) = online_stream.as_mut() else {
            return Ok(());
        };

        let floats = to_floats(audio);
        stream.accept_waveform(self.cfg.sample_rate, &floats);
        sentence_audio.extend_from_slice(audio);

        while stream.is_ready() {
            stream.decode()?;
        }
        let text = stream.text();
        sentence.current_time = *total_ms;
        if text != sentence.text {
            sentence.text = text;
            self.out.send(protocol::result(
                session_id,
                sentence.index,
                *total_ms,
                &sentence.text,
                None,
            ));
        }

        if stream.is_endpoint() {
            stream.decode()?;
            sentence.text = stream.text();

            let final_text = self.punctuate(&sentence.text);
            let speaker = self.identify_speaker(sentence_audio);
            self.out.send(protocol::sentence_end(
                session_id,
                sentence.index,
                *total_ms,
                sentence.begin_time,
                &final_text,
                speaker.as_ref(),
            ));
            info!(conn = self.conn_id, idx = sentence.index, text = %final_text, "sentence finalized");

            stream.reset();
            sentence_audio.clear();

            *sentence_counter += 1;
            *sentence = SentenceState {
                index: *sentence_counter,
                begin_time: *total_ms,
                current_time: *total_ms,
                text: String::new(),
                active: true,
            };
            self.out
                .send(protocol::sentence_begin(session_id, *sentence_counter, *total_ms));
        }

        audio.clear();
        Ok(())
    }

    /// Drains pending audio and completes the session. Runs on the work
    /// executor, behind any queued binary frames.
    pub fn finish(&self) {
        let inner = &mut *self.inner.lock();
        match inner.state {
            SessionState::Closing | SessionState::Closed => {
                inner.state = SessionState::Closed;
                return;
            }
            SessionState::Connected => return,
            SessionState::Started | SessionState::Processing => {}
        }

        if inner.state == SessionState::Processing && !inner.audio.is_empty() {
            let kind = inner.decoder.as_ref().map(|d| d.kind());
            let result = match kind {
                Some(DecoderKind::OfflineVad) => self.process_offline(inner),
                Some(DecoderKind::Online) => self.process_online(inner),
                None => Ok(()),
            };
            if let Err(e) = result {
                self.pipeline_failure(inner, &e);
                return;
            }
        }

        self.finalize(inner, "Transcription completed");
    }

    /// Emits the final events of a started session, releases its resources,
    /// and closes the socket.
    fn finalize(&self, inner: &mut SessionInner, reason: &str) {
        inner.state = SessionState::Closing;

        if inner.sentence.active {
            if let Some(stream) = inner.offline_stream.as_mut() {
                if stream.decode().is_ok() {
                    inner.sentence.text = stream.text();
                }
            } else if let Some(stream) = inner.online_stream.as_mut() {
                if stream.decode().is_ok() {
                    inner.sentence.text = stream.text();
                }
            }

            let final_text = self.punctuate(&inner.sentence.text);
            let speaker = self.identify_speaker(&inner.sentence_audio);
            self.out.send(protocol::sentence_end(
                &inner.session_id,
                inner.sentence.index,
                inner.total_ms,
                inner.sentence.begin_time,
                &final_text,
                speaker.as_ref(),
            ));
            inner.sentence.active = false;
        }

        self.out.send(protocol::completed(&inner.session_id));
        self.release(inner);
        inner.state = SessionState::Closed;
        self.out.close(reason);
        info!(conn = self.conn_id, sid = %inner.session_id, "session completed");
    }

    /// Called at server shutdown: complete a started session, then close.
    pub fn shutdown_close(&self) {
        let inner = &mut *self.inner.lock();
        match inner.state {
            SessionState::Closing | SessionState::Closed => {
                inner.state = SessionState::Closed;
            }
            SessionState::Connected => {
                self.release(inner);
                inner.state = SessionState::Closed;
                self.out.close("Server shutdown");
            }
            SessionState::Started | SessionState::Processing => {
                self.finalize(inner, "Server shutdown");
            }
        }
    }

    /// Called by the reaper. Frees resources and closes the socket without
    /// emitting further events.
    pub fn close_timeout(&self) {
        {
            let inner = &mut *self.inner.lock();
            self.release(inner);
            inner.state = SessionState::Closed;
        }
        self.out.close("Connection timeout");
        warn!(conn = self.conn_id, "connection timed out");
    }

    /// Called when the transport drops. No events are emitted.
    pub fn close_silent(&self) {
        let inner = &mut *self.inner.lock();
        self.release(inner);
        inner.state = SessionState::Closed;
    }

    fn pipeline_failure(&self, inner: &mut SessionInner, err: &zasr_recognizer::RecognizerError) {
        error!(conn = self.conn_id, error = %err, "pipeline failure");
        self.emit_failed(
            inner,
            code::PIPELINE_ERROR,
            &format!("Error processing audio data: {err}"),
        );
        inner.state = SessionState::Closing;
        self.release(inner);
        self.out.close("Internal error");
    }

    fn release(&self, inner: &mut SessionInner) {
        inner.decoder = None;
        inner.offline_stream = None;
        inner.online_stream = None;
        inner.audio.clear();
        inner.sentence_audio.clear();
        inner.vad_offset = 0;
        inner.streamed_offset = 0;
        inner.speech_started = false;
    }

    fn punctuate(&self, text: &str) -> String {
        match &self.punctuator {
            Some(p) => match p.add_punctuation(text) {
                Ok(out) => out,
                Err(e) => {
                    warn!(conn = self.conn_id, error = %e, "punctuation failed");
                    text.to_string()
                }
            },
            None => text.to_string(),
        }
    }

    fn identify_speaker(&self, samples: &[i16]) -> Option<(String, String)> {
        let speaker = self.speaker.as_ref()?;
        // identification needs at least one second of audio
        if samples.len() < self.cfg.sample_rate as usize {
            return None;
        }
        let floats = to_floats(samples);
        let ident = speaker.identify_samples(self.cfg.sample_rate, &floats)?;
        if ident.speaker_id.is_empty() {
            return None;
        }
        Some((ident.speaker_id, ident.speaker_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use zasr_recognizer::sim::{SimEmbeddingExtractor, SimEngineFactory};
    use zasr_recognizer::{EndpointConfig, VadModelConfig};
    use zasr_voiceprint::IdentifierConfig;

    const RATE: u32 = 16000;

    #[derive(Default)]
    struct CollectSink {
        events: Mutex<Vec<String>>,
        closed: Mutex<Option<String>>,
    }

    impl Outbound for CollectSink {
        fn send(&self, text: String) {
            self.events.lock().push(text);
        }
        fn close(&self, reason: &str) {
            *self.closed.lock() = Some(reason.to_string());
        }
    }

    impl CollectSink {
        fn names(&self) -> Vec<String> {
            self.events
                .lock()
                .iter()
                .map(|e| {
                    let v: Value = serde_json::from_str(e).unwrap();
                    v["header"]["name"].as_str().unwrap().to_string()
                })
                .collect()
        }

        fn payloads(&self, name: &str) -> Vec<Value> {
            self.events
                .lock()
                .iter()
                .filter_map(|e| {
                    let v: Value = serde_json::from_str(e).unwrap();
                    (v["header"]["name"] == name).then(|| v["payload"].clone())
                })
                .collect()
        }

        fn statuses(&self) -> Vec<i64> {
            self.events
                .lock()
                .iter()
                .map(|e| {
                    let v: Value = serde_json::from_str(e).unwrap();
                    v["header"]["status"].as_i64().unwrap()
                })
                .collect()
        }
    }

    fn offline_session() -> (Arc<CollectSink>, Session) {
        let sink = Arc::new(CollectSink::default());
        let engines = Arc::new(
            SimEngineFactory::offline(VadModelConfig::default()).with_punctuation(),
        );
        let cfg = PipelineConfig {
            update_interval: Duration::ZERO,
            ..PipelineConfig::default()
        };
        let session = Session::new(1, sink.clone(), engines, None, cfg);
        (sink, session)
    }

    fn online_session() -> (Arc<CollectSink>, Session) {
        let sink = Arc::new(CollectSink::default());
        let engines = Arc::new(SimEngineFactory::online(EndpointConfig::default(), RATE));
        let cfg = PipelineConfig {
            update_interval: Duration::ZERO,
            ..PipelineConfig::default()
        };
        let session = Session::new(2, sink.clone(), engines, None, cfg);
        (sink, session)
    }

    fn begin(session: &Session) {
        let action =
            session.handle_text(r#"{"header":{"name":"Begin","mid":"1"},"payload":{}}"#);
        assert_eq!(action, TextAction::None);
    }

    fn pcm_tone(freq: f32, secs: f32) -> Vec<u8> {
        let n = (RATE as f32 * secs) as usize;
        let mut out = Vec::with_capacity(n * 2);
        for i in 0..n {
            let s = 0.3 * (2.0 * std::f32::consts::PI * freq * i as f32 / RATE as f32).sin();
            out.extend_from_slice(&((s * 32767.0) as i16).to_le_bytes());
        }
        out
    }

    fn pcm_silence(secs: f32) -> Vec<u8> {
        vec![0u8; (RATE as f32 * secs) as usize * 2]
    }

    fn feed_chunks(session: &Session, bytes: &[u8]) {
        // 100 ms frames, like a real client
        for chunk in bytes.chunks((RATE as usize / 10) * 2) {
            session.handle_binary(chunk);
        }
    }

    /// Checks `Started (SentenceBegin Result* SentenceEnd)* Completed?`.
    fn assert_event_grammar(names: &[String]) {
        let mut i = 0;
        assert_eq!(names[i], "Started");
        i += 1;
        while i < names.len() && names[i] != "Completed" {
            assert_eq!(names[i], "SentenceBegin", "at {i}: {names:?}");
            i += 1;
            while i < names.len() && names[i] == "Result" {
                i += 1;
            }
            // an open sentence may be cut off by Completed at session end
            if i < names.len() && names[i] == "SentenceEnd" {
                i += 1;
            }
        }
        if i < names.len() {
            assert_eq!(names[i], "Completed");
            assert_eq!(i, names.len() - 1, "nothing after Completed: {names:?}");
        }
    }

    #[test]
    fn begin_emits_started_with_sid() {
        let (sink, session) = offline_session();
        begin(&session);
        assert_eq!(session.state(), SessionState::Started);
        let started = sink.payloads("Started");
        assert_eq!(started.len(), 1);
        assert!(started[0]["sid"].as_str().is_some());
    }

    #[test]
    fn client_session_id_is_honoured() {
        let (sink, session) = offline_session();
        session.handle_text(
            r#"{"header":{"name":"Begin"},"payload":{"session_id":"my-session"}}"#,
        );
        assert_eq!(sink.payloads("Started")[0]["sid"], "my-session");
    }

    #[test]
    fn begin_twice_fails_with_1001() {
        let (sink, session) = offline_session();
        begin(&session);
        begin(&session);
        assert!(sink.statuses().contains(&(code::INVALID_STATE_FOR_BEGIN as i64)));
        assert_eq!(session.state(), SessionState::Started);
    }

    #[test]
    fn invalid_rate_then_end_yields_1003_and_1005() {
        let (sink, session) = offline_session();
        session.handle_text(r#"{"header":{"name":"Begin"},"payload":{"rate":8000}}"#);
        assert_eq!(session.state(), SessionState::Connected);
        let action = session.handle_text(r#"{"header":{"name":"End"},"payload":{}}"#);
        assert_eq!(action, TextAction::None);
        assert_eq!(
            sink.statuses(),
            vec![code::UNSUPPORTED_SAMPLE_RATE as i64, code::NOT_STARTED as i64]
        );
    }

    #[test]
    fn invalid_format_fails_with_1002() {
        let (sink, session) = offline_session();
        session.handle_text(r#"{"header":{"name":"Begin"},"payload":{"fmt":"opus"}}"#);
        assert_eq!(sink.statuses(), vec![code::UNSUPPORTED_AUDIO_FORMAT as i64]);
    }

    #[test]
    fn unknown_name_fails_with_2005() {
        let (sink, session) = offline_session();
        session.handle_text(r#"{"header":{"name":"Pause"},"payload":{}}"#);
        assert_eq!(sink.statuses(), vec![code::UNSUPPORTED_NAME as i64]);
    }

    #[test]
    fn bad_json_fails_with_2001() {
        let (sink, session) = offline_session();
        session.handle_text("{broken");
        assert_eq!(sink.statuses(), vec![code::INVALID_JSON as i64]);
    }

    #[test]
    fn binary_before_begin_fails_with_1006() {
        let (sink, session) = offline_session();
        session.handle_binary(&pcm_silence(0.1));
        assert_eq!(sink.statuses(), vec![code::BINARY_IN_WRONG_STATE as i64]);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn happy_path_one_sentence_offline() {
        let (sink, session) = offline_session();
        begin(&session);
        feed_chunks(&session, &pcm_tone(440.0, 2.0));
        feed_chunks(&session, &pcm_silence(0.5));
        assert_eq!(session.handle_text(r#"{"header":{"name":"End"}}"#), TextAction::Drain);
        session.finish();

        let names = sink.names();
        assert_event_grammar(&names);
        assert!(names.contains(&"SentenceBegin".to_string()));
        assert!(names.contains(&"Result".to_string()));
        assert_eq!(names.last().unwrap(), "Completed");

        let begins = sink.payloads("SentenceBegin");
        let ends = sink.payloads("SentenceEnd");
        assert_eq!(begins.len(), 1);
        assert_eq!(ends.len(), 1);
        assert_eq!(begins[0]["idx"], 1);
        assert_eq!(ends[0]["idx"], 1);
        assert_eq!(ends[0]["begin"], begins[0]["time"]);
        assert_eq!(ends[0]["text"], "hello world.");
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn pure_silence_yields_no_sentences() {
        let (sink, session) = offline_session();
        begin(&session);
        feed_chunks(&session, &pcm_silence(5.0));
        session.handle_text(r#"{"header":{"name":"End"}}"#);
        session.finish();

        assert_eq!(sink.names(), vec!["Started", "Completed"]);
    }

    #[test]
    fn silence_keeps_buffer_bounded() {
        let (_sink, session) = offline_session();
        begin(&session);
        feed_chunks(&session, &pcm_silence(5.0));

        let inner = session.inner.lock();
        assert!(inner.audio.len() <= 10 * session.cfg.vad_window_size + RATE as usize / 10);
        assert!(inner.vad_offset <= inner.audio.len());
        assert_eq!(inner.total_samples, 5 * RATE as u64);
    }

    #[test]
    fn odd_and_empty_frames_are_harmless() {
        let (_sink, session) = offline_session();
        begin(&session);

        session.handle_binary(&[]);
        assert_eq!(session.state(), SessionState::Started);

        session.handle_binary(&[0x42]);
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(session.inner.lock().total_samples, 0);

        // 3 bytes: one sample, odd byte dropped
        session.handle_binary(&[0x00, 0x00, 0x42]);
        assert_eq!(session.inner.lock().total_samples, 1);
        assert_eq!(session.state(), SessionState::Processing);
    }

    #[test]
    fn sample_counter_tracks_bytes() {
        let (_sink, session) = offline_session();
        begin(&session);
        feed_chunks(&session, &pcm_silence(1.0));
        let inner = session.inner.lock();
        assert_eq!(inner.total_samples, RATE as u64);
        assert_eq!(inner.total_ms, 1000);
    }

    #[test]
    fn end_twice_completes_once() {
        let (sink, session) = offline_session();
        begin(&session);
        assert_eq!(session.handle_text(r#"{"header":{"name":"End"}}"#), TextAction::Drain);
        assert_eq!(session.handle_text(r#"{"header":{"name":"End"}}"#), TextAction::Drain);
        session.finish();
        session.finish();

        let completed = sink.names().iter().filter(|n| *n == "Completed").count();
        assert_eq!(completed, 1);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn online_mode_two_utterances() {
        let (sink, session) = online_session();
        begin(&session);
        feed_chunks(&session, &pcm_tone(440.0, 1.0));
        feed_chunks(&session, &pcm_silence(1.0));
        feed_chunks(&session, &pcm_tone(440.0, 1.0));
        session.handle_text(r#"{"header":{"name":"End"}}"#);
        session.finish();

        let names = sink.names();
        assert_event_grammar(&names);

        let ends = sink.payloads("SentenceEnd");
        assert!(ends.len() >= 2, "expected two sentences: {names:?}");
        assert_eq!(ends[0]["idx"], 1);
        assert_eq!(ends[1]["idx"], 2);
        let begins = sink.payloads("SentenceBegin");
        assert_eq!(begins[0]["idx"], 1);
        assert_eq!(begins[1]["idx"], 2);
    }

    #[test]
    fn event_times_are_monotonic() {
        let (sink, session) = online_session();
        begin(&session);
        feed_chunks(&session, &pcm_tone(440.0, 1.0));
        feed_chunks(&session, &pcm_silence(1.0));
        session.handle_text(r#"{"header":{"name":"End"}}"#);
        session.finish();

        let mut last = 0i64;
        for event in sink.events.lock().iter() {
            let v: Value = serde_json::from_str(event).unwrap();
            if let Some(t) = v["payload"]["time"].as_i64() {
                assert!(t >= last, "time went backwards");
                last = t;
            }
        }
    }

    #[test]
    fn pipeline_error_emits_failed_and_closes() {
        struct BrokenStream;
        impl zasr_recognizer::OfflineStream for BrokenStream {
            fn accept_waveform(&mut self, _r: u32, _s: &[f32]) {}
            fn decode(&mut self) -> zasr_recognizer::Result<()> {
                Err(zasr_recognizer::RecognizerError::Decode("model exploded".into()))
            }
            fn text(&self) -> String {
                String::new()
            }
        }
        struct BrokenRecognizer;
        impl zasr_recognizer::OfflineRecognizer for BrokenRecognizer {
            fn create_stream(&self) -> zasr_recognizer::Result<Box<dyn zasr_recognizer::OfflineStream>> {
                Ok(Box::new(BrokenStream))
            }
        }
        struct BrokenFactory;
        impl EngineFactory for BrokenFactory {
            fn kind(&self) -> DecoderKind {
                DecoderKind::OfflineVad
            }
            fn create_decoder(
                &self,
                _opts: &SessionOptions,
            ) -> zasr_recognizer::Result<SessionDecoder> {
                Ok(SessionDecoder::OfflineVad {
                    vad: Box::new(zasr_recognizer::sim::EnergyVad::new(&VadModelConfig::default())),
                    recognizer: Box::new(BrokenRecognizer),
                })
            }
            fn punctuator(&self) -> Option<Arc<dyn Punctuator>> {
                None
            }
        }

        let sink = Arc::new(CollectSink::default());
        let cfg = PipelineConfig {
            update_interval: Duration::ZERO,
            ..PipelineConfig::default()
        };
        let session = Session::new(3, sink.clone(), Arc::new(BrokenFactory), None, cfg);
        begin(&session);
        feed_chunks(&session, &pcm_tone(440.0, 1.0));

        assert!(sink.statuses().contains(&(code::PIPELINE_ERROR as i64)));
        assert!(sink.closed.lock().is_some());
    }

    #[test]
    fn decoder_failure_at_begin_keeps_session_connected() {
        struct FailingFactory;
        impl EngineFactory for FailingFactory {
            fn kind(&self) -> DecoderKind {
                DecoderKind::OfflineVad
            }
            fn create_decoder(
                &self,
                _opts: &SessionOptions,
            ) -> zasr_recognizer::Result<SessionDecoder> {
                Err(zasr_recognizer::RecognizerError::ModelLoad("missing model".into()))
            }
            fn punctuator(&self) -> Option<Arc<dyn Punctuator>> {
                None
            }
        }

        let sink = Arc::new(CollectSink::default());
        let session = Session::new(
            4,
            sink.clone(),
            Arc::new(FailingFactory),
            None,
            PipelineConfig::default(),
        );
        session.handle_text(r#"{"header":{"name":"Begin"}}"#);
        assert_eq!(sink.statuses(), vec![code::BEGIN_FAILED as i64]);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn finalized_sentence_carries_speaker_tag() {
        let dir = tempfile::TempDir::new().unwrap();
        let extractor = Arc::new(SimEmbeddingExtractor::default());
        let identifier = Arc::new(SpeakerIdentifier::new(
            extractor,
            None,
            IdentifierConfig {
                db_path: dir.path().to_path_buf(),
                ..IdentifierConfig::default()
            },
        ));
        identifier.load().unwrap();

        // first contact registers the voice as unknown-1
        let probe: Vec<f32> = (0..RATE)
            .map(|i| 0.3 * (2.0 * std::f32::consts::PI * 440.0 * i as f32 / RATE as f32).sin())
            .collect();
        let first = identifier.identify_samples(RATE, &probe).unwrap();
        assert_eq!(first.speaker_id, "unknown-1");

        let sink = Arc::new(CollectSink::default());
        let engines = Arc::new(SimEngineFactory::offline(VadModelConfig::default()));
        let cfg = PipelineConfig {
            update_interval: Duration::ZERO,
            ..PipelineConfig::default()
        };
        let session = Session::new(5, sink.clone(), engines, Some(identifier), cfg);
        begin(&session);
        feed_chunks(&session, &pcm_tone(440.0, 2.0));
        feed_chunks(&session, &pcm_silence(0.5));
        session.handle_text(r#"{"header":{"name":"End"}}"#);
        session.finish();

        let ends = sink.payloads("SentenceEnd");
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0]["speaker_id"], "unknown-1");
        assert_eq!(ends[0]["speaker"], "Unknown Speaker");
    }

    #[test]
    fn online_endpoint_without_speech_emits_empty_sentence() {
        let (sink, session) = online_session();
        begin(&session);
        // rule 1: 1.2 s of leading silence endpoints with empty text
        feed_chunks(&session, &pcm_silence(1.5));

        let ends = sink.payloads("SentenceEnd");
        assert_eq!(ends.len(), 1);
        assert_eq!(ends[0]["idx"], 1);
        assert_eq!(ends[0]["text"], "");
        assert_eq!(sink.payloads("SentenceBegin").len(), 2);
    }

    #[test]
    fn shutdown_mid_sentence_emits_final_events() {
        let (sink, session) = offline_session();
        begin(&session);
        feed_chunks(&session, &pcm_tone(440.0, 1.0));
        session.shutdown_close();

        let names = sink.names();
        assert!(names.contains(&"SentenceEnd".to_string()));
        assert_eq!(names.last().unwrap(), "Completed");
        assert_eq!(sink.closed.lock().as_deref(), Some("Server shutdown"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn timeout_close_emits_nothing() {
        let (sink, session) = offline_session();
        begin(&session);
        feed_chunks(&session, &pcm_silence(0.5));
        let before = sink.events.lock().len();
        session.close_timeout();
        assert_eq!(sink.events.lock().len(), before);
        assert_eq!(sink.closed.lock().as_deref(), Some("Connection timeout"));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn messages_after_close_are_dropped() {
        let (sink, session) = offline_session();
        begin(&session);
        session.handle_text(r#"{"header":{"name":"End"}}"#);
        session.finish();

        let before = sink.events.lock().len();
        session.handle_binary(&pcm_silence(0.1));
        assert_eq!(session.handle_text(r#"{"header":{"name":"End"}}"#), TextAction::None);
        assert_eq!(sink.events.lock().len(), before);
    }
}
