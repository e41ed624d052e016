//! Lighting effects and the scheduler that turns them into actuator steps.

use std::{f64::consts::PI, fmt, str::FromStr, time::Instant};

use serde::{Deserialize, Serialize};

use crate::LightBoardError;

mod scheduler;

pub use scheduler::{EffectScheduler, Sources};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EffectMode {
    /// Sine-wave breathing driven by wall-clock time.
    #[default]
    Continuous,
    /// Pulse to full intensity on every key-down, then fade.
    KeyPress,
    /// Pulse on every detected beat, then fade.
    MusicSync,
}

impl EffectMode {
    pub const ALL: [EffectMode; 3] = [Self::Continuous, Self::KeyPress, Self::MusicSync];

    /// The mode after this one, wrapping around.
    pub fn next(self) -> Self {
        match self {
            Self::Continuous => Self::KeyPress,
            Self::KeyPress => Self::MusicSync,
            Self::MusicSync => Self::Continuous,
        }
    }

    /// Returns the kebab-case name used on the command line.
    pub fn label(self) -> &'static str {
        match self {
            Self::Continuous => "continuous",
            Self::KeyPress => "key-press",
            Self::MusicSync => "music-sync",
        }
    }
}

impl fmt::Display for EffectMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for EffectMode {
    type Err = LightBoardError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalised = value.trim().to_ascii_lowercase().replace(['_', ' '], "-");
        match normalised.as_str() {
            "continuous" | "breathing" => Ok(Self::Continuous),
            "key-press" | "keypress" | "keys" => Ok(Self::KeyPress),
            "music-sync" | "musicsync" | "music" => Ok(Self::MusicSync),
            _ => Err(LightBoardError::msg(format!("unknown effect mode `{value}`"))),
        }
    }
}

/// Breathing waveform in `[0, 1]` at `progress` through the cycle.
pub fn breathing_brightness(progress: f64) -> f64 {
    ((2.0 * PI * progress).sin() + 1.0) / 2.0
}

/// Level the breathing effect aims for, rounded to the nearest step.
pub fn breathing_target(progress: f64, intensity: u8) -> u8 {
    let target = (breathing_brightness(progress) * f64::from(intensity)).round();
    target.clamp(0.0, f64::from(intensity)) as u8
}

/// Event crossing from a capture or input thread into the scheduler. The
/// generation ties it to the activation that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    KeyDown { generation: u64 },
    Beat { generation: u64, at: Instant },
}

impl Signal {
    pub fn generation(&self) -> u64 {
        match self {
            Self::KeyDown { generation } | Self::Beat { generation, .. } => *generation,
        }
    }
}

/// Point-in-time view of everything observers may read.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EffectSnapshot {
    pub running: bool,
    pub mode: EffectMode,
    /// Believed actuator level.
    pub level: u8,
    pub phase: f64,
    /// Normalised brightness for visualisation.
    pub brightness: f64,
    pub speed: f64,
    pub intensity: u8,
    pub sensitivity: f32,
    pub beat_detected: bool,
    pub current_volume: f32,
}
