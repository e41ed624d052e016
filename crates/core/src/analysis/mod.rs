//! Low-frequency energy beat detection.
//!
//! Each frame's bass energy is the mean magnitude of the lowest spectrum bins.
//! A beat fires when that energy rises above an adaptive threshold derived
//! from roughly one second of history, subject to a refractory period.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU32, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};
use serde::{Deserialize, Serialize};

use crate::{
    audio::{AudioSource, CaptureStream},
    config::{clamp_sensitivity, DetectorConfig, EffectSettings},
    LightBoardError, Result,
};

mod history;

pub use history::EnergyHistory;

/// A detected onset. Carries nothing but its time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeatEvent {
    pub at: Instant,
}

pub type BeatCallback = Box<dyn FnMut(BeatEvent) + Send>;

/// Result of feeding one frame.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameReport {
    pub energy: f32,
    /// Root-mean-square amplitude of the frame.
    pub volume: f32,
    /// Threshold the frame was scored against; `None` while the history is
    /// still filling.
    pub threshold: Option<f32>,
    pub beat: Option<BeatEvent>,
}

/// Observable detector state shared between the capture thread and readers.
#[derive(Debug)]
pub struct DetectorMeter {
    epoch: Instant,
    hold: Duration,
    sensitivity: AtomicU32,
    volume: AtomicU32,
    beat_raised_us: AtomicU64,
}

const NO_BEAT: u64 = u64::MAX;

impl DetectorMeter {
    /// Creates a meter with no volume and no beat raised.
    pub fn new(hold: Duration, sensitivity: f32) -> Self {
        Self {
            epoch: Instant::now(),
            hold,
            sensitivity: AtomicU32::new(clamp_sensitivity(sensitivity).to_bits()),
            volume: AtomicU32::new(0.0_f32.to_bits()),
            beat_raised_us: AtomicU64::new(NO_BEAT),
        }
    }

    pub fn sensitivity(&self) -> f32 {
        f32::from_bits(self.sensitivity.load(Ordering::Relaxed))
    }

    pub fn set_sensitivity(&self, sensitivity: f32) -> f32 {
        let sensitivity = clamp_sensitivity(sensitivity);
        self.sensitivity
            .store(sensitivity.to_bits(), Ordering::Relaxed);
        sensitivity
    }

    /// RMS amplitude of the most recent frame.
    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn beat_detected(&self) -> bool {
        self.beat_detected_at(Instant::now())
    }

    /// True from the moment a beat fires until the indicator hold elapses.
    pub fn beat_detected_at(&self, now: Instant) -> bool {
        self.indicator_deadline().is_some_and(|deadline| now < deadline)
    }

    /// When the currently raised beat flag drops, if one is raised.
    pub fn indicator_deadline(&self) -> Option<Instant> {
        match self.beat_raised_us.load(Ordering::Acquire) {
            NO_BEAT => None,
            raised => Some(self.epoch + Duration::from_micros(raised) + self.hold),
        }
    }

    /// Drops volume and the beat flag. Sensitivity is kept.
    pub fn reset(&self) {
        self.volume.store(0.0_f32.to_bits(), Ordering::Relaxed);
        self.beat_raised_us.store(NO_BEAT, Ordering::Release);
    }

    fn set_volume(&self, volume: f32) {
        self.volume.store(volume.to_bits(), Ordering::Relaxed);
    }

    fn raise_beat(&self, now: Instant) {
        let since_epoch = now.saturating_duration_since(self.epoch).as_micros();
        let since_epoch = u64::try_from(since_epoch).unwrap_or(NO_BEAT - 1);
        self.beat_raised_us.store(since_epoch, Ordering::Release);
    }
}

/// Beat detector with its own capture lifecycle. Frames reach
/// [`BeatDetector::feed`] either from an opened [`AudioSource`] or directly.
pub struct BeatDetector {
    core: Arc<Mutex<DetectorCore>>,
    meter: Arc<DetectorMeter>,
    stream: Option<Box<dyn CaptureStream>>,
}

impl BeatDetector {
    /// Creates a detector with the default sensitivity.
    pub fn new(config: DetectorConfig) -> Self {
        Self::with_sensitivity(config, EffectSettings::default().sensitivity())
    }

    /// Creates a detector with a clamped starting sensitivity.
    pub fn with_sensitivity(config: DetectorConfig, sensitivity: f32) -> Self {
        let meter = Arc::new(DetectorMeter::new(config.indicator_hold, sensitivity));
        let core = DetectorCore::new(config, meter.clone());
        Self {
            core: Arc::new(Mutex::new(core)),
            meter,
            stream: None,
        }
    }

    /// Registers the callback invoked once per accepted beat. The callback
    /// runs on whichever thread feeds frames and must not block.
    pub fn on_beat<F>(&self, callback: F) -> Result<()>
    where
        F: FnMut(BeatEvent) + Send + 'static,
    {
        self.lock()?.on_beat = Some(Box::new(callback));
        Ok(())
    }

    /// Removes the beat callback.
    pub fn clear_on_beat(&self) -> Result<()> {
        self.lock()?.on_beat = None;
        Ok(())
    }

    /// Opens `source` and starts scoring its frames with an empty history.
    /// A no-op while already capturing.
    pub fn start(&mut self, source: &mut dyn AudioSource) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let frame_size = {
            let mut core = self.lock()?;
            core.reset();
            core.config.frame_len()
        };
        let core = self.core.clone();
        let stream = source.open(
            frame_size,
            Box::new(move |frame| match core.lock() {
                Ok(mut core) => {
                    if let Err(err) = core.feed(frame, Instant::now()) {
                        tracing::warn!(%err, "dropping audio frame");
                    }
                }
                Err(_) => tracing::warn!("beat detector has been poisoned"),
            }),
        )?;

        self.stream = Some(stream);
        tracing::info!("beat detector capturing");
        Ok(())
    }

    /// Closes the capture, if any, and discards the energy history and
    /// refractory anchor. Also applies to a detector fed directly.
    pub fn stop(&mut self) {
        let capturing = match self.stream.take() {
            Some(mut stream) => {
                stream.close();
                true
            }
            None => false,
        };
        match self.lock() {
            Ok(mut core) => core.reset(),
            Err(err) => tracing::warn!(%err, "could not clear detector history"),
        }
        self.meter.reset();
        if capturing {
            tracing::info!("beat detector stopped");
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Scores one frame at the current time.
    pub fn feed(&self, samples: &[f32]) -> Result<FrameReport> {
        self.feed_at(samples, Instant::now())
    }

    /// Scores one frame as if it arrived at `now`.
    pub fn feed_at(&self, samples: &[f32], now: Instant) -> Result<FrameReport> {
        self.lock()?.feed(samples, now)
    }

    /// Clamps into `[0, 1]`; applies from the next frame on.
    pub fn set_sensitivity(&self, sensitivity: f32) -> f32 {
        self.meter.set_sensitivity(sensitivity)
    }

    pub fn sensitivity(&self) -> f32 {
        self.meter.sensitivity()
    }

    /// Returns the shared observables (volume, beat flag, sensitivity).
    pub fn meter(&self) -> Arc<DetectorMeter> {
        self.meter.clone()
    }

    /// Returns the number of energies currently in the history.
    pub fn history_len(&self) -> Result<usize> {
        Ok(self.lock()?.history.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, DetectorCore>> {
        self.core
            .lock()
            .map_err(|_| LightBoardError::msg("beat detector has been poisoned"))
    }
}

impl Drop for BeatDetector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for BeatDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeatDetector")
            .field("capturing", &self.is_capturing())
            .field("meter", &self.meter)
            .finish()
    }
}

struct DetectorCore {
    config: DetectorConfig,
    meter: Arc<DetectorMeter>,
    history: EnergyHistory,
    last_beat: Option<Instant>,
    on_beat: Option<BeatCallback>,
    fft: FftResources,
}

impl DetectorCore {
    fn new(config: DetectorConfig, meter: Arc<DetectorMeter>) -> Self {
        let fft = FftResources::new(config.frame_len());
        Self {
            history: EnergyHistory::with_capacity(config.history_len),
            config,
            meter,
            last_beat: None,
            on_beat: None,
            fft,
        }
    }

    fn reset(&mut self) {
        self.history.clear();
        self.last_beat = None;
    }

    fn feed(&mut self, samples: &[f32], now: Instant) -> Result<FrameReport> {
        let volume = compute_rms(samples);
        self.meter.set_volume(volume);

        let frame_len = self.config.frame_len();
        let energy = if samples.len() < frame_len {
            0.0
        } else {
            self.low_frequency_energy(&samples[..frame_len])?
        };
        self.history.push(energy);

        let mut report = FrameReport {
            energy,
            volume,
            ..Default::default()
        };
        if !self.history.is_full() {
            return Ok(report);
        }

        let threshold = self.history.mean()
            + self.meter.sensitivity()
                * self.history.variance().sqrt()
                * self.config.threshold_multiplier;
        report.threshold = Some(threshold);

        let rested = self
            .last_beat
            .map(|last| now.saturating_duration_since(last) >= self.config.refractory)
            .unwrap_or(true);

        if energy > threshold && rested {
            let beat = BeatEvent { at: now };
            self.last_beat = Some(now);
            self.meter.raise_beat(now);
            tracing::debug!(energy, threshold, "beat");
            if let Some(callback) = self.on_beat.as_mut() {
                callback(beat);
            }
            report.beat = Some(beat);
        }

        Ok(report)
    }

    fn low_frequency_energy(&mut self, samples: &[f32]) -> Result<f32> {
        let fft = &mut self.fft;
        fft.input.copy_from_slice(samples);
        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let bins = self.config.bass_bins.clamp(1, fft.spectrum.len());
        let total: f32 = fft.spectrum[..bins].iter().map(|bin| bin.norm()).sum();
        Ok(total / bins as f32)
    }
}

/// Planned transform plus buffers, allocated once per detector and reused for
/// every frame.
struct FftResources {
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl FftResources {
    fn new(size: usize) -> Self {
        let plan = RealFftPlanner::<f32>::new().plan_fft_forward(size);
        Self {
            scratch: plan.make_scratch_vec(),
            spectrum: plan.make_output_vec(),
            input: plan.make_input_vec(),
            plan,
        }
    }
}

fn compute_rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f32 = samples.iter().map(|sample| sample * sample).sum();
    (sum / samples.len() as f32).sqrt()
}

/// Outcome of running the detector over a decoded recording.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AnalysisSummary {
    pub sample_rate: u32,
    pub duration_seconds: f32,
    /// Start time of every frame that fired a beat, in seconds.
    pub beats: Vec<f32>,
    pub tempo_bpm: Option<f32>,
}

/// Runs the detector over `samples` using stream time instead of wall time.
pub fn analyze_samples(
    samples: &[f32],
    sample_rate: u32,
    config: DetectorConfig,
    sensitivity: f32,
) -> Result<AnalysisSummary> {
    let config = DetectorConfig {
        sample_rate,
        ..config
    };
    let frame_len = config.frame_len();
    let frame_duration = config.frame_duration();
    let rate = f64::from(sample_rate.max(1));
    let detector = BeatDetector::with_sensitivity(config, sensitivity);

    let origin = Instant::now();
    let mut beats = Vec::new();
    for (index, frame) in samples.chunks(frame_len).enumerate() {
        let offset = frame_duration.mul_f64(index as f64);
        if detector.feed_at(frame, origin + offset)?.beat.is_some() {
            beats.push(offset.as_secs_f32());
        }
    }

    let tempo_bpm = estimate_tempo(&beats);
    tracing::debug!(beats = beats.len(), ?tempo_bpm, "offline analysis finished");
    Ok(AnalysisSummary {
        sample_rate,
        duration_seconds: (samples.len() as f64 / rate) as f32,
        beats,
        tempo_bpm,
    })
}

fn estimate_tempo(beats: &[f32]) -> Option<f32> {
    let intervals: Vec<f32> = beats
        .windows(2)
        .map(|pair| pair[1] - pair[0])
        .filter(|interval| *interval > f32::EPSILON)
        .collect();
    if intervals.is_empty() {
        return None;
    }
    let average = intervals.iter().sum::<f32>() / intervals.len() as f32;
    Some(60.0 / average)
}
