//! Core library for LightBoard, a driver for stepped brightness hardware.
//!
//! Brightness can only be moved one unit at a time, so every effect is a
//! sequence of up/down steps issued through [`actuator::BrightnessActuator`].
//! The [`effect::EffectScheduler`] runs one of three effects (breathing,
//! key-press pulse, music-sync pulse) and [`engine::EffectEngine`] hosts it on
//! a dedicated thread. Music sync is fed by the FFT beat detector in
//! [`analysis`].

pub mod actuator;
pub mod analysis;
pub mod audio;
pub mod config;
pub mod effect;
pub mod engine;
pub mod error;
pub mod input;
pub mod timeline;

pub use actuator::{
    BrightnessActuator, Direction, RecordingDevice, SimulatedKeyboard, StepDevice, SysfsBacklight,
    LEVEL_MAX,
};
pub use analysis::{analyze_samples, AnalysisSummary, BeatDetector, BeatEvent, DetectorMeter};
pub use audio::{read_wav_mono, AudioSource, PushSource, WavFileSource};
pub use config::{AppConfig, DetectorConfig, EffectSettings, TimingConfig};
pub use effect::{EffectMode, EffectScheduler, EffectSnapshot, Sources};
pub use engine::EffectEngine;
pub use error::{LightBoardError, Result};
pub use input::{KeySource, ManualKeySource, TerminalKeySource};
