use std::{
    path::{Path, PathBuf},
    sync::Arc,
    thread,
    time::Duration,
};

use cadence_core::{
    AnalysisHub, BufferSource, Clock, LedProcessor, MetricsFeed, PlaybackEngine, PlaybackEvent,
    PlayerConfig, RepeatMode, SettingsStore, SoftwareOutput, SpectrumProcessor, SystemClock,
    TrackStore,
};
use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 48_000;
const RENDER_INTERVAL: Duration = Duration::from_millis(10);

fn main() -> cadence_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Play {
            config,
            seconds,
            tones,
            track_seconds,
            shuffle,
            repeat,
        } => run_play(PlayOptions {
            config,
            seconds,
            tones,
            track_seconds,
            shuffle,
            repeat,
        }),
        Commands::Config { output } => run_config(output.as_deref()),
    }
}

struct PlayOptions {
    config: Option<PathBuf>,
    seconds: u64,
    tones: Vec<f32>,
    track_seconds: f32,
    shuffle: bool,
    repeat: Option<RepeatArg>,
}

fn load_config(path: Option<&Path>) -> cadence_core::Result<PlayerConfig> {
    match path {
        Some(path) => {
            tracing::info!(?path, "loading configuration");
            PlayerConfig::from_json_str(&std::fs::read_to_string(path)?)
        }
        None => Ok(PlayerConfig::default()),
    }
}

fn run_play(options: PlayOptions) -> cadence_core::Result<()> {
    let mut config = load_config(options.config.as_deref())?;
    if options.shuffle {
        config.playback.shuffle = true;
    }
    if let Some(repeat) = options.repeat {
        config.playback.repeat = repeat.into();
    }
    let settings = Arc::new(SettingsStore::new(config));

    let store = Arc::new(TrackStore::new());
    let mut tracks = Vec::with_capacity(options.tones.len());
    for frequency in &options.tones {
        let source = BufferSource::sine(*frequency, options.track_seconds, SAMPLE_RATE, 0.5)?;
        tracks.push(store.insert(format!("tone-{frequency}hz"), Arc::new(source)));
    }
    if tracks.is_empty() {
        return Err("at least one tone is required".into());
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let output = Arc::new(SoftwareOutput::new(Arc::clone(&clock)));
    let mut render = output.spawn_render_loop(RENDER_INTERVAL)?;

    let engine = PlaybackEngine::new(output.clone(), store.clone(), Arc::clone(&settings), clock);
    engine.subscribe(|event| match event {
        PlaybackEvent::PositionChanged { current_time, .. } => {
            tracing::trace!(current_time, "position");
        }
        other => tracing::info!(event = ?other, "playback"),
    });
    let mut position = engine.start_position_updates()?;

    let hub = Arc::new(AnalysisHub::new(
        settings.snapshot().analysis,
        Arc::new(engine.tap_point()),
    ));
    let bands = MetricsFeed::new(
        Arc::clone(&hub),
        SpectrumProcessor::with_settings(Arc::clone(&settings)),
    );
    let leds = MetricsFeed::new(
        Arc::clone(&hub),
        LedProcessor::with_settings(Arc::clone(&settings)),
    );
    bands.start()?;
    leds.start()?;

    tracing::info!(tracks = tracks.len(), seconds = options.seconds, "starting playback");
    engine.play_queue(tracks, 0)?;

    for _ in 0..options.seconds {
        thread::sleep(Duration::from_secs(1));
        let snapshot = engine.snapshot()?;
        let level = bands.latest().map_or(0.0, |metrics| metrics.level);
        let strip = leds
            .latest()
            .map(|metrics| render_strip(&metrics.segments))
            .unwrap_or_default();
        tracing::info!(
            track = ?snapshot.current_track_id,
            state = ?snapshot.state,
            current_time = format_args!("{:.2}", snapshot.current_time),
            level = format_args!("{level:.2}"),
            %strip,
            transforms = hub.transforms_computed(),
            "tick"
        );
    }

    engine.stop(true)?;
    leds.stop()?;
    bands.stop()?;
    position.cancel();
    render.cancel();
    tracing::info!(dropped_writes = hub.dropped_writes(), "playback finished");
    Ok(())
}

fn run_config(output: Option<&Path>) -> cadence_core::Result<()> {
    let encoded = PlayerConfig::default().to_json_string_pretty()?;
    match output {
        Some(path) => {
            std::fs::write(path, encoded)?;
            tracing::info!(?path, "wrote default configuration");
        }
        None => println!("{encoded}"),
    }
    Ok(())
}

fn render_strip(segments: &[f32]) -> String {
    segments
        .iter()
        .map(|brightness| match (brightness * 4.0).round() as u8 {
            0 => '.',
            1 => '-',
            2 => '=',
            3 => '+',
            _ => '#',
        })
        .collect()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Playback engine and spectrum analysis demo", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Play a queue of synthesized tones and log spectrum and LED output.
    Play {
        /// Optional JSON configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// How long to run before stopping.
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
        /// Tone frequencies in Hz, one track each.
        #[arg(long, value_delimiter = ',', default_values_t = [110.0, 440.0, 1760.0])]
        tones: Vec<f32>,
        /// Length of every tone track.
        #[arg(long, default_value_t = 4.0)]
        track_seconds: f32,
        /// Enable shuffle regardless of the configuration file.
        #[arg(long)]
        shuffle: bool,
        /// Override the repeat mode.
        #[arg(long, value_enum)]
        repeat: Option<RepeatArg>,
    },
    /// Print the default configuration, or write it to a file.
    Config {
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RepeatArg {
    Off,
    All,
    One,
}

impl From<RepeatArg> for RepeatMode {
    fn from(value: RepeatArg) -> Self {
        match value {
            RepeatArg::Off => RepeatMode::Off,
            RepeatArg::All => RepeatMode::All,
            RepeatArg::One => RepeatMode::One,
        }
    }
}
