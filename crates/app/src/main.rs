use std::{
    io::{BufRead, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use clap::{Args, Parser, Subcommand, ValueEnum};
use lightboard_core::{
    analyze_samples, read_wav_mono, AppConfig, AudioSource, DetectorConfig, EffectEngine, EffectMode,
    EffectSettings, EffectSnapshot, LightBoardError, SimulatedKeyboard, Sources, StepDevice,
    SysfsBacklight, TerminalKeySource, WavFileSource,
};
use tracing_subscriber::EnvFilter;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

fn main() -> lightboard_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_effects(args),
        Commands::Analyze {
            input,
            sensitivity,
            json,
        } => run_analyze(&input, sensitivity, json),
    }
}

fn run_effects(args: RunArgs) -> lightboard_core::Result<()> {
    let mode = EffectMode::from(args.mode);
    let config = AppConfig {
        mode,
        effect: EffectSettings::new(args.speed, args.intensity, args.sensitivity),
        ..Default::default()
    };
    tracing::info!(%mode, settings = ?config.effect, device = %args.device, "starting effects");

    let interrupt = Arc::new(AtomicBool::new(false));
    let keys = TerminalKeySource::with_interrupt(interrupt.clone());
    let sources = Sources::new(audio_source(args.wav), keys);
    let engine = EffectEngine::spawn(output_device(&args.device), sources, config)?;
    let updates = engine.subscribe()?;

    if let Err(err) = engine.start() {
        tracing::error!(%err, %mode, "effect did not start");
        engine.shutdown()?;
        return Err(err);
    }
    if mode != EffectMode::KeyPress {
        watch_stdin(interrupt.clone());
        tracing::info!("press Enter to stop");
    }

    // Key-press mode owns the terminal in raw mode, which needs explicit
    // carriage returns.
    let line_end = if mode == EffectMode::KeyPress { "\r\n" } else { "\n" };
    let deadline = args
        .duration
        .map(|seconds| Instant::now() + Duration::from_secs_f64(seconds.max(0.0)));

    while !interrupt.load(Ordering::SeqCst) && deadline.map_or(true, |d| Instant::now() < d) {
        match updates.recv_timeout(POLL_INTERVAL) {
            Ok(snapshot) => report(&snapshot, args.json, line_end)?,
            Err(err) if err.is_disconnected() => break,
            Err(_) => {}
        }
    }

    let last = engine.shutdown()?;
    tracing::info!(level = last.level, "effects stopped");
    Ok(())
}

fn run_analyze(input: &Path, sensitivity: f32, json: bool) -> lightboard_core::Result<()> {
    tracing::info!(?input, sensitivity, "running offline beat analysis");
    let (samples, sample_rate) = read_wav_mono(input)?;
    let summary = analyze_samples(&samples, sample_rate, DetectorConfig::default(), sensitivity)?;

    if json {
        let rendered = serde_json::to_string_pretty(&summary)
            .map_err(|err| LightBoardError::msg(err.to_string()))?;
        println!("{rendered}");
        return Ok(());
    }

    println!(
        "{} beats in {:.2}s at {} Hz",
        summary.beats.len(),
        summary.duration_seconds,
        summary.sample_rate
    );
    match summary.tempo_bpm {
        Some(bpm) => println!("estimated tempo: {bpm:.1} bpm"),
        None => println!("estimated tempo: n/a"),
    }
    for beat in &summary.beats {
        println!("{beat:>8.3}s");
    }
    Ok(())
}

fn report(snapshot: &EffectSnapshot, json: bool, line_end: &str) -> lightboard_core::Result<()> {
    if !json {
        tracing::debug!(
            level = snapshot.level,
            phase = snapshot.phase,
            beat = snapshot.beat_detected,
            volume = snapshot.current_volume,
            "effect update"
        );
        return Ok(());
    }
    let rendered =
        serde_json::to_string(snapshot).map_err(|err| LightBoardError::msg(err.to_string()))?;
    let mut stdout = std::io::stdout().lock();
    write!(stdout, "{rendered}{line_end}")?;
    stdout.flush()?;
    Ok(())
}

fn output_device(name: &str) -> Box<dyn StepDevice + Send> {
    if name == "simulated" {
        Box::new(SimulatedKeyboard::new())
    } else {
        Box::new(SysfsBacklight::new(name))
    }
}

fn audio_source(wav: Option<PathBuf>) -> Box<dyn AudioSource> {
    match wav {
        Some(path) => Box::new(WavFileSource::new(path)),
        None => live_source(),
    }
}

#[cfg(feature = "live-capture")]
fn live_source() -> Box<dyn AudioSource> {
    Box::new(lightboard_core::audio::MicrophoneSource::new())
}

#[cfg(not(feature = "live-capture"))]
fn live_source() -> Box<dyn AudioSource> {
    Box::new(NoMicrophone)
}

/// Stands in for the microphone when the binary is built without live capture.
#[cfg(not(feature = "live-capture"))]
struct NoMicrophone;

#[cfg(not(feature = "live-capture"))]
impl AudioSource for NoMicrophone {
    fn open(
        &mut self,
        _: usize,
        _: lightboard_core::audio::FrameCallback,
    ) -> lightboard_core::Result<Box<dyn lightboard_core::audio::CaptureStream>> {
        Err(LightBoardError::CaptureUnavailable(
            "built without live capture; pass --wav <file>".into(),
        ))
    }
}

/// Raises `interrupt` when a line (or end of input) arrives on stdin.
fn watch_stdin(interrupt: Arc<AtomicBool>) {
    let spawned = std::thread::Builder::new()
        .name("lightboard-stdin".into())
        .spawn(move || {
            let mut line = String::new();
            let _ = std::io::stdin().lock().read_line(&mut line);
            interrupt.store(true, Ordering::SeqCst);
        });
    if let Err(err) = spawned {
        tracing::warn!(%err, "stdin watcher unavailable; use --duration to stop");
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Stepped brightness effects for keyboard backlights", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive the backlight with an effect until interrupted.
    Run(RunArgs),
    /// Detect beats in an audio file and report them.
    Analyze {
        /// WAV file to analyse.
        input: PathBuf,
        /// Beat sensitivity, 0 (least) to 1 (most).
        #[arg(short, long, default_value_t = 0.5)]
        sensitivity: f32,
        /// Emit the summary as JSON.
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(short, long, value_enum, default_value_t = ModeArg::Continuous)]
    mode: ModeArg,
    /// Breathing cycle length in seconds (1-10).
    #[arg(long, default_value_t = 4.0)]
    speed: f64,
    /// Peak level for every effect (1-10).
    #[arg(short, long, default_value_t = 5)]
    intensity: i64,
    /// Beat sensitivity, 0 (least) to 1 (most).
    #[arg(short, long, default_value_t = 0.5)]
    sensitivity: f32,
    /// `simulated`, or a sysfs LED directory such as
    /// /sys/class/leds/platform::kbd_backlight.
    #[arg(short, long, default_value = "simulated")]
    device: String,
    /// Use a WAV file instead of the microphone for music sync.
    #[arg(long)]
    wav: Option<PathBuf>,
    /// Stop after this many seconds.
    #[arg(long)]
    duration: Option<f64>,
    /// Print every state change as a JSON line on stdout.
    #[arg(long)]
    json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum ModeArg {
    Continuous,
    KeyPress,
    MusicSync,
}

impl From<ModeArg> for EffectMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Continuous => EffectMode::Continuous,
            ModeArg::KeyPress => EffectMode::KeyPress,
            ModeArg::MusicSync => EffectMode::MusicSync,
        }
    }
}
