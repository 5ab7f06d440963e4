//! zasr-voiceprint - enrollment, identification and verification over the
//! voice-print store used by the server.
//!
//! Exit code 0 on success, 1 on failure; `verify` exits 0 iff the speaker
//! matched.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use zasr_recognizer::sim::SimEmbeddingExtractor;
use zasr_voiceprint::{IdentifierConfig, SpeakerIdentifier, VoicePrintMeta};

/// Voice-print management CLI.
#[derive(Parser)]
#[command(name = "zasr-voiceprint")]
#[command(about = "Voice-print enrollment and identification")]
#[command(version)]
struct Cli {
    /// Speaker embedding model path
    #[arg(long, global = true)]
    model: Option<PathBuf>,

    /// Voice-print database root (default: ~/.zasr/voice-prints)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Threads for embedding extraction
    #[arg(long, global = true, default_value_t = 2)]
    threads: usize,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List enrolled speakers
    List,
    /// Show one speaker's details
    Info {
        #[arg(long)]
        speaker: String,
    },
    /// Enroll a speaker from one or more WAV files
    Add {
        #[arg(long)]
        name: String,
        /// Audio files (repeatable)
        #[arg(long = "audio", required = true, num_args = 1..)]
        audio: Vec<PathBuf>,
        /// male/female/unknown
        #[arg(long, default_value = "unknown")]
        gender: String,
        /// e.g. zh-CN, en-US
        #[arg(long, default_value = "unknown")]
        language: String,
        #[arg(long, default_value = "")]
        notes: String,
        /// Skip the multi-speaker check
        #[arg(long)]
        force: bool,
    },
    /// Rename a speaker
    Rename {
        #[arg(long)]
        speaker: String,
        #[arg(long)]
        name: String,
    },
    /// Remove a speaker and its embedding
    Remove {
        #[arg(long)]
        speaker: String,
    },
    /// Identify the speaker of a WAV file
    Identify {
        #[arg(long)]
        audio: PathBuf,
    },
    /// Verify a WAV file against an enrolled speaker
    Verify {
        #[arg(long)]
        speaker: String,
        #[arg(long)]
        audio: PathBuf,
        /// Similarity threshold, 0-1 (default 0.75)
        #[arg(long)]
        threshold: Option<f32>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::WARN
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    if let Some(model) = &cli.model {
        tracing::debug!(
            model = %model.display(),
            threads = cli.threads,
            "embedding model configured; the simulated extractor ignores it"
        );
    }
    let identifier = SpeakerIdentifier::new(
        Arc::new(SimEmbeddingExtractor::default()),
        None,
        IdentifierConfig {
            db_path: cli.db.clone().unwrap_or_default(),
            ..IdentifierConfig::default()
        },
    );
    identifier.load().context("loading voice-print database")?;

    match &cli.command {
        Commands::List => {
            let speakers = identifier.list();
            if speakers.is_empty() {
                println!("No registered speakers");
                return Ok(ExitCode::SUCCESS);
            }

            println!("\nRegistered speakers ({}):", speakers.len());
            println!("{}", "-".repeat(80));
            println!(
                "{:<15}{:<20}{:<22}{:<10}{}",
                "ID", "Name", "Created At", "Samples", "Notes"
            );
            println!("{}", "-".repeat(80));
            for s in &speakers {
                println!(
                    "{:<15}{:<20}{:<22}{:<10}{}",
                    s.id, s.name, s.created_at, s.num_samples, s.metadata.notes
                );
            }
            println!("{}", "-".repeat(80));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Info { speaker } => {
            let Some(record) = identifier.info(speaker) else {
                eprintln!("Error: speaker not found: {speaker}");
                return Ok(ExitCode::FAILURE);
            };
            println!("\nSpeaker details:");
            println!("{}", "=".repeat(50));
            println!("ID:         {}", record.id);
            println!("Name:       {}", record.name);
            println!("Created:    {}", record.created_at);
            println!("Updated:    {}", record.updated_at);
            println!(
                "Embedding:  {} (dim: {})",
                record.embedding_file, record.embedding_dim
            );
            println!("Samples:    {}", record.num_samples);
            println!("Gender:     {}", record.metadata.gender);
            println!("Language:   {}", record.metadata.language);
            println!("Notes:      {}", record.metadata.notes);
            if !record.audio_samples.is_empty() {
                println!("\nAudio samples:");
                for sample in &record.audio_samples {
                    println!("  - {sample}");
                }
            }
            println!("{}", "=".repeat(50));
            Ok(ExitCode::SUCCESS)
        }

        Commands::Add {
            name,
            audio,
            gender,
            language,
            notes,
            force,
        } => {
            let metadata = VoicePrintMeta {
                gender: gender.clone(),
                language: language.clone(),
                notes: notes.clone(),
            };
            let id = identifier
                .add_speaker(name, audio, metadata, *force)
                .context("enrolling speaker")?;
            println!("Enrolled speaker:");
            println!("  ID:      {id}");
            println!("  Name:    {name}");
            println!("  Samples: {} files", audio.len());
            Ok(ExitCode::SUCCESS)
        }

        Commands::Rename { speaker, name } => {
            identifier
                .rename_speaker(speaker, name)
                .context("renaming speaker")?;
            println!("Renamed speaker: {speaker} -> {name}");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Remove { speaker } => {
            identifier
                .remove_speaker(speaker)
                .context("removing speaker")?;
            println!("Removed speaker: {speaker}");
            Ok(ExitCode::SUCCESS)
        }

        Commands::Identify { audio } => {
            match identifier.identify_wav(audio).context("identifying speaker")? {
                Some(found) => {
                    println!("Identified speaker:");
                    println!("  ID:         {}", found.speaker_id);
                    println!("  Name:       {}", found.speaker_name);
                    println!("  Confidence: {:.0}%", found.confidence * 100.0);
                }
                None => println!("No matching speaker found"),
            }
            Ok(ExitCode::SUCCESS)
        }

        Commands::Verify {
            speaker,
            audio,
            threshold,
        } => {
            let verified = identifier
                .verify_wav(speaker, audio, *threshold)
                .context("verifying speaker")?;
            let name = identifier
                .info(speaker)
                .map(|r| r.name)
                .unwrap_or_else(|| speaker.clone());
            println!("Verify speaker: {name}");
            println!("  Audio:     {}", audio.display());
            println!(
                "  Threshold: {:.2}",
                threshold.unwrap_or(IdentifierConfig::default().similarity_threshold)
            );
            println!("  Result:    {}", if verified { "PASS" } else { "FAILED" });
            Ok(if verified {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
