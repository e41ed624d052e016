use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::EffectMode;

pub const SPEED_MIN: f64 = 1.0;
pub const SPEED_MAX: f64 = 10.0;
pub const INTENSITY_MIN: u8 = 1;
pub const INTENSITY_MAX: u8 = 10;
pub const SENSITIVITY_MIN: f32 = 0.0;
pub const SENSITIVITY_MAX: f32 = 1.0;
/// Smallest frame the real FFT can transform.
pub const FRAME_SIZE_MIN: usize = 2;

/// Top-level configuration structure for the application.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub mode: EffectMode,
    pub effect: EffectSettings,
    pub detector: DetectorConfig,
    pub timing: TimingConfig,
}

/// User-tunable effect parameters. Every setter clamps into range; values
/// outside the range are never reported as errors.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectSettings {
    speed: f64,
    intensity: u8,
    sensitivity: f32,
}

impl Default for EffectSettings {
    fn default() -> Self {
        Self {
            speed: 4.0,
            intensity: 5,
            sensitivity: 0.5,
        }
    }
}

impl EffectSettings {
    /// Creates settings, clamping every value into range.
    pub fn new(speed: f64, intensity: i64, sensitivity: f32) -> Self {
        Self {
            speed: clamp_speed(speed),
            intensity: clamp_intensity(intensity),
            sensitivity: clamp_sensitivity(sensitivity),
        }
    }

    /// Re-applies the bounds, for values that arrived through deserialization.
    pub fn clamped(self) -> Self {
        Self::new(self.speed, i64::from(self.intensity), self.sensitivity)
    }

    /// Length of one breathing cycle in seconds.
    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// Peak level of every effect.
    pub fn intensity(&self) -> u8 {
        self.intensity
    }

    /// Returns the beat sensitivity in `[0, 1]`.
    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }

    /// Stores a clamped speed and returns it.
    pub fn set_speed(&mut self, speed: f64) -> f64 {
        self.speed = clamp_speed(speed);
        self.speed
    }

    /// Stores a clamped intensity and returns it.
    pub fn set_intensity(&mut self, intensity: i64) -> u8 {
        self.intensity = clamp_intensity(intensity);
        self.intensity
    }

    /// Stores a clamped sensitivity and returns it.
    pub fn set_sensitivity(&mut self, sensitivity: f32) -> f32 {
        self.sensitivity = clamp_sensitivity(sensitivity);
        self.sensitivity
    }
}

/// Clamps a breathing period into `SPEED_MIN..=SPEED_MAX`; NaN maps to the minimum.
pub fn clamp_speed(speed: f64) -> f64 {
    let clamped = if speed.is_nan() {
        SPEED_MIN
    } else {
        speed.clamp(SPEED_MIN, SPEED_MAX)
    };
    if clamped != speed {
        tracing::debug!(requested = speed, applied = clamped, "speed clamped");
    }
    clamped
}

/// Clamps a peak level into `INTENSITY_MIN..=INTENSITY_MAX`.
pub fn clamp_intensity(intensity: i64) -> u8 {
    let clamped = intensity.clamp(i64::from(INTENSITY_MIN), i64::from(INTENSITY_MAX));
    if clamped != intensity {
        tracing::debug!(requested = intensity, applied = clamped, "intensity clamped");
    }
    // In range by the clamp above.
    clamped as u8
}

/// Clamps into `[0, 1]`; NaN maps to 0.
pub fn clamp_sensitivity(sensitivity: f32) -> f32 {
    let clamped = if sensitivity.is_nan() {
        SENSITIVITY_MIN
    } else {
        sensitivity.clamp(SENSITIVITY_MIN, SENSITIVITY_MAX)
    };
    if clamped != sensitivity {
        tracing::debug!(
            requested = sensitivity,
            applied = clamped,
            "sensitivity clamped"
        );
    }
    clamped
}

/// Constants of the low-frequency energy beat detector.
///
/// The bass window and threshold multiplier are empirical; they are kept as
/// fields so deployments can tune them without touching the algorithm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Samples per analysed frame. Read through [`DetectorConfig::frame_len`].
    pub frame_size: usize,
    /// Lowest spectrum bins averaged into the bass energy.
    pub bass_bins: usize,
    /// Frames of energy kept for the adaptive baseline.
    pub history_len: usize,
    /// Standard deviations (scaled by sensitivity) above the mean a frame
    /// must reach to count as a beat.
    pub threshold_multiplier: f32,
    /// Minimum spacing between two accepted beats.
    pub refractory: Duration,
    /// How long the observable beat flag stays raised.
    pub indicator_hold: Duration,
    /// Rate of the analysed stream; turns frame indices into stream time.
    pub sample_rate: u32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            frame_size: 1024,
            bass_bins: 6,
            history_len: 43,
            threshold_multiplier: 2.0,
            refractory: Duration::from_millis(150),
            indicator_hold: Duration::from_millis(100),
            sample_rate: 44_100,
        }
    }
}

impl DetectorConfig {
    /// Frame size actually used for planning and slicing, never below
    /// [`FRAME_SIZE_MIN`].
    pub fn frame_len(&self) -> usize {
        self.frame_size.max(FRAME_SIZE_MIN)
    }

    /// Stream-time length of one frame at the configured sample rate.
    pub fn frame_duration(&self) -> Duration {
        Duration::from_secs_f64(self.frame_len() as f64 / f64::from(self.sample_rate.max(1)))
    }
}

/// Scheduling intervals of the effect scheduler and the actuator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingConfig {
    /// Period of the continuous breathing update.
    pub breathing_tick: Duration,
    /// Period of one fade step after a pulse.
    pub fade_tick: Duration,
    /// Minimum spacing the actuator keeps after every step command.
    pub step_spacing: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            breathing_tick: Duration::from_millis(100),
            fade_tick: Duration::from_millis(50),
            step_spacing: Duration::from_millis(50),
        }
    }
}
