//! Discrete brightness actuator.
//!
//! The hardware accepts exactly two primitive commands and offers no read-back,
//! so nothing here knows the current level. The effect scheduler is the only
//! party that tracks it.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Highest level the keyboard backlight supports.
pub const LEVEL_MAX: u8 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Up,
    Down,
}

/// The single external primitive: emit one brightness step. Best-effort;
/// implementations log failures and return.
pub trait StepDevice {
    fn emit(&mut self, direction: Direction);
}

impl<D: StepDevice + ?Sized> StepDevice for Box<D> {
    fn emit(&mut self, direction: Direction) {
        (**self).emit(direction);
    }
}

/// Rate-limited front for a [`StepDevice`]. Every step blocks for the
/// configured spacing after the command is issued.
#[derive(Debug)]
pub struct BrightnessActuator<D> {
    device: D,
    spacing: Duration,
    issued_up: u64,
    issued_down: u64,
}

impl<D: StepDevice> BrightnessActuator<D> {
    /// Creates an actuator that waits `spacing` after every command.
    pub fn new(device: D, spacing: Duration) -> Self {
        Self {
            device,
            spacing,
            issued_up: 0,
            issued_down: 0,
        }
    }

    /// Issues one brightness-up command.
    pub fn step_up(&mut self) {
        self.step(Direction::Up);
    }

    /// Issues one brightness-down command.
    pub fn step_down(&mut self) {
        self.step(Direction::Down);
    }

    /// Issues `steps` commands in one direction, one after another.
    pub fn step_by(&mut self, steps: u32, direction: Direction) {
        for _ in 0..steps {
            self.step(direction);
        }
    }

    /// Net commands issued since construction (ups minus downs).
    pub fn net_steps(&self) -> i64 {
        self.issued_up as i64 - self.issued_down as i64
    }

    /// Returns `(ups, downs)` issued so far.
    pub fn issued(&self) -> (u64, u64) {
        (self.issued_up, self.issued_down)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    fn step(&mut self, direction: Direction) {
        self.device.emit(direction);
        match direction {
            Direction::Up => self.issued_up += 1,
            Direction::Down => self.issued_down += 1,
        }
        if !self.spacing.is_zero() {
            std::thread::sleep(self.spacing);
        }
    }
}

/// Stand-in keyboard that only logs. It mirrors the hardware's saturation at
/// `0..=LEVEL_MAX` so log output shows what a real backlight would do.
#[derive(Debug, Default)]
pub struct SimulatedKeyboard {
    level: u8,
}

impl SimulatedKeyboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn level(&self) -> u8 {
        self.level
    }
}

impl StepDevice for SimulatedKeyboard {
    fn emit(&mut self, direction: Direction) {
        self.level = match direction {
            Direction::Up => (self.level + 1).min(LEVEL_MAX),
            Direction::Down => self.level.saturating_sub(1),
        };
        tracing::debug!(?direction, level = self.level, "simulated backlight step");
    }
}

/// In-memory command log. Clones share the same log, so one copy can be handed
/// to the scheduler while another is inspected.
#[derive(Debug, Clone, Default)]
pub struct RecordingDevice {
    commands: Arc<Mutex<Vec<Direction>>>,
}

impl RecordingDevice {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every command recorded so far, oldest first.
    pub fn commands(&self) -> Vec<Direction> {
        self.commands
            .lock()
            .map(|commands| commands.clone())
            .unwrap_or_default()
    }

    /// Ups minus downs over everything recorded so far.
    pub fn net(&self) -> i64 {
        self.commands()
            .iter()
            .map(|direction| match direction {
                Direction::Up => 1,
                Direction::Down => -1,
            })
            .sum()
    }

    pub fn clear(&self) {
        if let Ok(mut commands) = self.commands.lock() {
            commands.clear();
        }
    }
}

impl StepDevice for RecordingDevice {
    fn emit(&mut self, direction: Direction) {
        match self.commands.lock() {
            Ok(mut commands) => commands.push(direction),
            Err(_) => tracing::warn!("recording device log has been poisoned"),
        }
    }
}

/// Keyboard backlight exposed through the Linux LED class
/// (`/sys/class/leds/<name>::kbd_backlight`). Each step re-reads the current
/// value and writes one increment, clamped to `max_brightness`.
#[derive(Debug, Clone)]
pub struct SysfsBacklight {
    dir: PathBuf,
}

impl SysfsBacklight {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn read_value(&self, file: &str) -> std::io::Result<u32> {
        let raw = fs::read_to_string(self.dir.join(file))?;
        raw.trim()
            .parse()
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    fn apply(&self, direction: Direction) -> std::io::Result<u32> {
        let current = self.read_value("brightness")?;
        let max = self.read_value("max_brightness")?;
        let next = match direction {
            Direction::Up => (current + 1).min(max),
            Direction::Down => current.saturating_sub(1),
        };
        fs::write(self.dir.join("brightness"), next.to_string())?;
        Ok(next)
    }
}

impl StepDevice for SysfsBacklight {
    fn emit(&mut self, direction: Direction) {
        match self.apply(direction) {
            Ok(value) => tracing::debug!(?direction, value, "backlight step"),
            Err(err) => {
                tracing::warn!(?direction, dir = %self.dir.display(), %err, "backlight step failed")
            }
        }
    }
}
