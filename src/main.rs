// audiopipe - command-line player
// Plays files back to back through one output session

use anyhow::{Context, Result};
use audiopipe::{PlaybackEngine, PlaybackSettings};
use clap::Parser;
use crossbeam_channel::{select, Receiver};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::PathBuf;
use std::thread;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for audiopipe
#[derive(Parser, Debug)]
#[command(name = "audiopipe")]
#[command(about = "Play audio files through the default output device")]
#[command(version)]
struct Args {
    /// Files to play, in order
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Bytes handed to the device per iteration (overrides settings)
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Directory containing settings.json
    #[arg(long)]
    settings: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Pause,
    Continue,
    Next,
    Quit,
}

fn parse_command(line: &str) -> Option<Command> {
    match line.trim() {
        "p" => Some(Command::Pause),
        "c" => Some(Command::Continue),
        "n" => Some(Command::Next),
        "q" => Some(Command::Quit),
        _ => None,
    }
}

fn spawn_stdin_reader() -> Result<Receiver<Command>> {
    let (tx, rx) = crossbeam_channel::unbounded();

    thread::Builder::new()
        .name("stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                match parse_command(&line) {
                    Some(cmd) => {
                        if tx.send(cmd).is_err() {
                            break;
                        }
                    }
                    None => warn!(
                        "Unknown command {:?} (p = pause, c = continue, n = next, q = quit)",
                        line.trim()
                    ),
                }
            }
        })
        .context("Failed to start stdin reader")?;

    Ok(rx)
}

fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audiopipe=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut settings = match &args.settings {
        Some(dir) => PlaybackSettings::load(dir).context("Failed to load settings")?,
        None => PlaybackSettings::default(),
    };
    if let Some(chunk_size) = args.chunk_size {
        settings.chunk_size = chunk_size;
    }

    let engine = PlaybackEngine::builder()
        .settings(&settings)
        .build()
        .context("Failed to create playback engine")?;

    let finished = engine.finished();
    let errors = engine.errors();
    let commands = spawn_stdin_reader()?;
    let no_commands = crossbeam_channel::never();
    let mut stdin_open = true;
    let mut quit = false;

    'tracks: for path in &args.files {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                error!("Failed to open {}: {}", path.display(), e);
                continue;
            }
        };

        if let Err(e) = engine.play(BufReader::new(file)) {
            error!("Cannot play {}: {}", path.display(), e);
            continue;
        }
        info!("Playing {}", path.display());

        loop {
            let pending = if stdin_open { &commands } else { &no_commands };
            select! {
                recv(finished) -> _ => break,
                recv(errors) -> err => {
                    if let Ok(e) = err {
                        error!("Playback of {} failed: {}", path.display(), e);
                    }
                    break;
                }
                recv(pending) -> cmd => match cmd {
                    Ok(Command::Pause) => engine.pause(),
                    Ok(Command::Continue) => engine.resume(),
                    // The next play() stops this track
                    Ok(Command::Next) => break,
                    Ok(Command::Quit) => {
                        quit = true;
                        break 'tracks;
                    }
                    Err(_) => stdin_open = false,
                },
            }
        }
    }

    // Let the tail of the last track play out before releasing the device
    if !quit {
        if let Err(e) = engine.flush() {
            warn!("Failed to drain audio output: {}", e);
        }
    }
    engine.stop();
    info!("Playback finished");
    Ok(())
}
