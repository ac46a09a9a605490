use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use timeline::{Block, BlockKind, Fps, Rational, Track};
use tracing::info;
use tracing_subscriber::EnvFilter;

mod render;

#[derive(Parser)]
#[command(name = "framecache-cli")]
#[command(about = "Framecache CLI - inspect tracks and render them into the disk frame cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the blocks of a track with their timing and transition links
    Inspect {
        /// Track JSON file
        #[arg(short, long)]
        track: PathBuf,
    },

    /// Render a track frame by frame into the disk cache
    Render {
        /// Track JSON file
        #[arg(short, long)]
        track: PathBuf,

        /// Renderer config JSON (defaults apply when missing)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Cache directory, overrides the config
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// First frame to render
        #[arg(long, default_value = "0")]
        start: i64,

        /// Frame to stop before (defaults to the end of the track)
        #[arg(long)]
        end: Option<i64>,

        /// Frame rate as N or N/D (e.g. 30000/1001)
        #[arg(long, default_value = "30", value_parser = parse_fps)]
        fps: Fps,
    },

    /// Write a sample track with two clips and a dissolve
    Demo {
        /// Output track JSON file
        #[arg(short, long)]
        out: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    match cli.command {
        Commands::Inspect { track } => inspect_command(track),
        Commands::Render {
            track,
            config,
            out,
            start,
            end,
            fps,
        } => render::render_command(render::RenderArgs {
            track,
            config,
            out,
            start,
            end,
            fps,
        }),
        Commands::Demo { out } => demo_command(out),
    }
}

fn parse_fps(value: &str) -> Result<Fps, String> {
    let (num, den) = match value.split_once('/') {
        Some((num, den)) => (num.trim(), den.trim()),
        None => (value.trim(), "1"),
    };
    let fps = Fps::new(
        num.parse().map_err(|e| format!("invalid numerator {num:?}: {e}"))?,
        den.parse().map_err(|e| format!("invalid denominator {den:?}: {e}"))?,
    );
    if !fps.is_valid() {
        return Err(format!("frame rate {value} must be non-zero"));
    }
    Ok(fps)
}

pub(crate) fn load_track(path: &Path) -> Result<Track> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading track {}", path.display()))?;
    let track: Track = serde_json::from_str(&content)
        .with_context(|| format!("parsing track {}", path.display()))?;
    Ok(track)
}

fn inspect_command(path: PathBuf) -> Result<()> {
    let track = load_track(&path)?;
    println!(
        "track {:?}: {} blocks, duration {} ({:.3}s)",
        track.name(),
        track.len(),
        track.duration(),
        track.duration().to_f64()
    );

    for (index, (id, block)) in track.iter().enumerate() {
        let start = track.block_start(id)?;
        print!(
            "{index:>3}  {id:<6} {:<12} start {start:<12} length {:<12}",
            block.display_name(),
            block.length()
        );
        match &block.kind {
            BlockKind::Clip(clip) => println!(" source {} in {}", clip.source, clip.media_in),
            BlockKind::Gap => println!(),
            BlockKind::Transition(t) => {
                let side = |link: Option<timeline::BlockId>| {
                    link.map_or_else(|| "-".to_string(), |id| id.to_string())
                };
                println!(
                    " out {} ({}) in {} ({})",
                    t.out_offset(),
                    side(t.connected_out_block()),
                    t.in_offset(),
                    side(t.connected_in_block())
                );
            }
        }
    }
    Ok(())
}

fn demo_command(out: PathBuf) -> Result<()> {
    let second = Rational::ONE;
    let half = Rational::new(1, 2);

    let mut track = Track::new("demo");
    let a = track.append_block(Block::clip("red.mov", Rational::ZERO, second * 2)?.with_label("Intro"))?;
    let b = track.append_block(Block::clip("blue.mov", Rational::ZERO, second * 2)?)?;
    track.add_transition(Some(a), Some(b), half, half)?;
    track.append_block(Block::gap(half)?)?;
    let c = track.append_block(Block::clip("green.mov", second, second)?)?;
    track.add_transition(Some(c), None, Rational::new(1, 4), Rational::ZERO)?;

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(&track)?;
    std::fs::write(&out, json).with_context(|| format!("writing {}", out.display()))?;
    info!(path = %out.display(), duration = %track.duration(), "wrote demo track");
    Ok(())
}
