//! zasr-server - WebSocket streaming speech-recognition server.
//!
//! Configuration merges, in order: built-in defaults, a YAML file
//! (`--config` or `ZASR_CONFIG`), then command-line flags. The log level
//! comes from `ZASR_SERVER_LOG_LEVEL` (error|warn|info|debug).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use zasr_recognizer::sim::SimEmbeddingExtractor;
use zasr_recognizer::RecognizerType;
use zasr_server::{build_factory, Executors, ServerConfig, ZasrServer};
use zasr_voiceprint::{IdentifierConfig, SpeakerIdentifier};

/// WebSocket streaming speech-recognition server.
#[derive(Parser, Debug)]
#[command(name = "zasr-server")]
#[command(about = "WebSocket streaming speech recognition server")]
#[command(version)]
struct Args {
    /// YAML config file (default: $ZASR_CONFIG when set)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address
    #[arg(long)]
    host: Option<String>,

    /// Listen port
    #[arg(long)]
    port: Option<u16>,

    /// Maximum concurrent connections
    #[arg(long)]
    max_connections: Option<usize>,

    /// Worker threads of the decode executor
    #[arg(long)]
    worker_threads: Option<usize>,

    /// Inbound sample rate (only 16000 is supported)
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Recognizer family: sense-voice, streaming-zipformer, streaming-paraformer
    #[arg(long)]
    recognizer_type: Option<String>,

    /// SenseVoice model path
    #[arg(long)]
    sense_voice_model: Option<PathBuf>,

    /// Streaming zipformer encoder model path
    #[arg(long)]
    zipformer_encoder: Option<PathBuf>,

    /// Streaming zipformer decoder model path
    #[arg(long)]
    zipformer_decoder: Option<PathBuf>,

    /// Streaming zipformer joiner model path
    #[arg(long)]
    zipformer_joiner: Option<PathBuf>,

    /// Streaming paraformer encoder model path
    #[arg(long)]
    paraformer_encoder: Option<PathBuf>,

    /// Streaming paraformer decoder model path
    #[arg(long)]
    paraformer_decoder: Option<PathBuf>,

    /// Token table path
    #[arg(long)]
    tokens: Option<PathBuf>,

    /// Silero VAD model path (required for sense-voice)
    #[arg(long)]
    silero_vad_model: Option<PathBuf>,

    /// VAD speech probability threshold
    #[arg(long)]
    vad_threshold: Option<f32>,

    /// VAD minimum silence duration, seconds
    #[arg(long)]
    min_silence_duration: Option<f32>,

    /// VAD minimum speech duration, seconds
    #[arg(long)]
    min_speech_duration: Option<f32>,

    /// VAD maximum speech duration, seconds
    #[arg(long)]
    max_speech_duration: Option<f32>,

    /// VAD analysis window, milliseconds
    #[arg(long)]
    vad_window_size_ms: Option<f32>,

    /// Minimum interval between partial results, milliseconds
    #[arg(long)]
    update_interval_ms: Option<u64>,

    /// Decode batching cap
    #[arg(long)]
    max_batch_size: Option<usize>,

    /// Enable the punctuation model
    #[arg(long)]
    enable_punctuation: bool,

    /// Punctuation model path
    #[arg(long)]
    punctuation_model: Option<PathBuf>,

    /// Apply inverse text normalization
    #[arg(long)]
    use_itn: Option<bool>,

    /// Intra-op threads of the model runtime
    #[arg(long)]
    num_threads: Option<usize>,

    /// Idle connection timeout, seconds
    #[arg(long)]
    connection_timeout: Option<u64>,

    /// Recognition timeout, seconds
    #[arg(long)]
    recognition_timeout: Option<u64>,

    /// Log file (stdout when unset)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Directory for saved audio and results
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Enable speaker identification on finalized sentences
    #[arg(long)]
    enable_speaker_id: bool,

    /// Speaker embedding model path
    #[arg(long)]
    speaker_model: Option<PathBuf>,

    /// Voice-print database root
    #[arg(long)]
    voice_print_db: Option<PathBuf>,

    /// Speaker similarity threshold
    #[arg(long)]
    speaker_threshold: Option<f32>,
}

fn build_config(args: &Args) -> Result<ServerConfig> {
    let mut config = ServerConfig::default();

    let yaml = args.config.clone().or_else(|| {
        std::env::var("ZASR_CONFIG")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from)
    });
    if let Some(path) = yaml {
        config
            .apply_yaml_file(&path)
            .with_context(|| format!("loading config file {}", path.display()))?;
    }

    macro_rules! merge {
        ($target:expr, $value:expr) => {
            if let Some(v) = $value.clone() {
                $target = v;
            }
        };
    }

    merge!(config.host, args.host);
    merge!(config.port, args.port);
    merge!(config.max_connections, args.max_connections);
    merge!(config.worker_threads, args.worker_threads);
    merge!(config.sample_rate, args.sample_rate);

    if let Some(kind) = &args.recognizer_type {
        config.recognizer_type = RecognizerType::parse(kind)
            .with_context(|| format!("invalid --recognizer-type '{kind}'"))?;
    }

    merge!(config.offline.model, args.sense_voice_model);
    merge!(config.online.encoder, args.zipformer_encoder);
    merge!(config.online.decoder, args.zipformer_decoder);
    if args.zipformer_joiner.is_some() {
        config.online.joiner = args.zipformer_joiner.clone();
    }
    merge!(config.online.encoder, args.paraformer_encoder);
    merge!(config.online.decoder, args.paraformer_decoder);
    if let Some(tokens) = &args.tokens {
        config.offline.tokens = tokens.clone();
        config.online.tokens = tokens.clone();
    }

    merge!(config.vad.model, args.silero_vad_model);
    merge!(config.vad.threshold, args.vad_threshold);
    merge!(config.vad.min_silence_duration, args.min_silence_duration);
    merge!(config.vad.min_speech_duration, args.min_speech_duration);
    merge!(config.vad.max_speech_duration, args.max_speech_duration);
    merge!(config.vad.window_size_ms, args.vad_window_size_ms);

    merge!(config.update_interval_ms, args.update_interval_ms);
    merge!(config.max_batch_size, args.max_batch_size);

    if args.enable_punctuation {
        config.punctuation.enabled = true;
    }
    merge!(config.punctuation.model, args.punctuation_model);
    merge!(config.offline.use_itn, args.use_itn);
    if let Some(n) = args.num_threads {
        config.offline.num_threads = n;
        config.online.num_threads = n;
    }

    if let Some(secs) = args.connection_timeout {
        config.connection_timeout = std::time::Duration::from_secs(secs);
    }
    if let Some(secs) = args.recognition_timeout {
        config.recognition_timeout = std::time::Duration::from_secs(secs);
    }

    if args.log_file.is_some() {
        config.log_file = args.log_file.clone();
    }
    if args.data_dir.is_some() {
        config.data_dir = args.data_dir.clone();
    }

    if args.enable_speaker_id {
        config.speaker.enabled = true;
    }
    merge!(config.speaker.model, args.speaker_model);
    merge!(config.speaker.db, args.voice_print_db);
    merge!(config.speaker.threshold, args.speaker_threshold);

    config.fill_model_defaults();
    Ok(config)
}

fn init_logging(config: &ServerConfig) -> Result<()> {
    let level = match std::env::var("ZASR_SERVER_LOG_LEVEL").as_deref() {
        Ok("error") => tracing::Level::ERROR,
        Ok("warn") => tracing::Level::WARN,
        Ok("debug") => tracing::Level::DEBUG,
        _ => tracing::Level::INFO,
    };

    match &config.log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_max_level(level)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_max_level(level).init();
        }
    }
    Ok(())
}

fn main() {
    let args = Args::parse();

    let config = match build_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
    if let Err(e) = init_logging(&config) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }

    if let Err(e) = serve(config) {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn serve(config: ServerConfig) -> Result<()> {
    let executors = Executors::new(config.worker_threads)?;

    let speaker = if config.speaker.enabled {
        let identifier = Arc::new(SpeakerIdentifier::new(
            Arc::new(SimEmbeddingExtractor::default()),
            None,
            IdentifierConfig {
                db_path: config.speaker.db.clone(),
                similarity_threshold: config.speaker.threshold,
                auto_track: config.speaker.auto_track,
            },
        ));
        identifier.load().context("loading voice-print database")?;
        Some(identifier)
    } else {
        None
    };

    let engines = build_factory(&config);
    let server = Arc::new(ZasrServer::new(
        Arc::new(config),
        engines,
        speaker,
        executors.work_handle(),
    ));

    let result = executors.block_on_control({
        let server = server.clone();
        async move {
            let signal_server = server.clone();
            tokio::spawn(async move {
                wait_for_shutdown_signal().await;
                info!("shutdown signal received");
                signal_server.stop();
            });
            server.run().await
        }
    });

    executors.shutdown();
    result.map_err(Into::into)
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => return std::future::pending::<()>().await,
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
