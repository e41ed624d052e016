use std::{cmp::Ordering, fmt, time::Instant};

use crossbeam_channel::Sender;

use super::{breathing_brightness, breathing_target, EffectMode, EffectSnapshot, Signal};
use crate::{
    actuator::{BrightnessActuator, Direction, StepDevice, LEVEL_MAX},
    analysis::BeatDetector,
    audio::AudioSource,
    config::{AppConfig, EffectSettings, TimingConfig},
    input::{KeyListener, KeySource},
    timeline::{PeriodicTimer, PhaseClock},
    Result,
};

/// External capabilities the scheduler opens on demand.
pub struct Sources {
    pub audio: Box<dyn AudioSource>,
    pub keys: Box<dyn KeySource>,
}

impl Sources {
    /// Boxes the audio and key sources.
    pub fn new(audio: impl AudioSource + 'static, keys: impl KeySource + 'static) -> Self {
        Self {
            audio: Box::new(audio),
            keys: Box::new(keys),
        }
    }
}

/// What the running mode holds on to.
enum Activity {
    Idle,
    Continuous {
        clock: PhaseClock,
        ticker: PeriodicTimer,
    },
    Pulse {
        trigger: PulseTrigger,
        fade: Option<PeriodicTimer>,
    },
}

enum PulseTrigger {
    Keys(Box<dyn KeyListener>),
    Beats,
}

/// Three-mode effect state machine and sole owner of the believed actuator
/// level.
///
/// Nothing here reads the clock: every time-dependent call takes `now`, and
/// key-downs and beats arrive as [`Signal`]s through [`handle_signal`]. The
/// scheduler hands a clone of `signals` to each source it opens; whoever owns
/// the receiving end must feed them back in on the scheduler's thread.
///
/// [`handle_signal`]: EffectScheduler::handle_signal
pub struct EffectScheduler<D> {
    actuator: BrightnessActuator<D>,
    settings: EffectSettings,
    timing: TimingConfig,
    mode: EffectMode,
    level: u8,
    phase: f64,
    activity: Activity,
    generation: u64,
    detector: BeatDetector,
    sources: Sources,
    signals: Sender<Signal>,
}

impl<D: StepDevice> EffectScheduler<D> {
    /// Creates an idle scheduler at level 0. Settings are re-clamped.
    pub fn new(device: D, sources: Sources, config: AppConfig, signals: Sender<Signal>) -> Self {
        let settings = config.effect.clamped();
        Self {
            actuator: BrightnessActuator::new(device, config.timing.step_spacing),
            detector: BeatDetector::with_sensitivity(config.detector, settings.sensitivity()),
            settings,
            timing: config.timing,
            mode: config.mode,
            level: 0,
            phase: 0.0,
            activity: Activity::Idle,
            generation: 0,
            sources,
            signals,
        }
    }

    /// Returns true while a mode is active.
    pub fn is_running(&self) -> bool {
        !matches!(self.activity, Activity::Idle)
    }

    /// Returns the selected mode, running or not.
    pub fn mode(&self) -> EffectMode {
        self.mode
    }

    /// Returns the believed actuator level.
    pub fn level(&self) -> u8 {
        self.level
    }

    pub fn phase(&self) -> f64 {
        self.phase
    }

    pub fn settings(&self) -> EffectSettings {
        self.settings
    }

    pub fn actuator(&self) -> &BrightnessActuator<D> {
        &self.actuator
    }

    /// Activates the current mode. Already running is a no-op. When a source
    /// cannot be opened the error is returned and nothing changes.
    pub fn start(&mut self, now: Instant) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        debug_assert_eq!(self.level, 0, "idle scheduler must sit at level 0");

        let generation = self.generation;
        let activity = match self.mode {
            EffectMode::Continuous => Activity::Continuous {
                clock: PhaseClock::start(now),
                ticker: PeriodicTimer::starting_at(now, self.timing.breathing_tick),
            },
            EffectMode::KeyPress => {
                let signals = self.signals.clone();
                let listener = self
                    .sources
                    .keys
                    .listen(Box::new(move || {
                        let _ = signals.send(Signal::KeyDown { generation });
                    }))
                    .inspect_err(|err| tracing::warn!(%err, "key press mode refused to start"))?;
                Activity::Pulse {
                    trigger: PulseTrigger::Keys(listener),
                    fade: None,
                }
            }
            EffectMode::MusicSync => {
                let signals = self.signals.clone();
                self.detector.on_beat(move |beat| {
                    let _ = signals.send(Signal::Beat {
                        generation,
                        at: beat.at,
                    });
                })?;
                if let Err(err) = self.detector.start(self.sources.audio.as_mut()) {
                    tracing::warn!(%err, "music sync mode refused to start");
                    self.detector.clear_on_beat()?;
                    return Err(err);
                }
                Activity::Pulse {
                    trigger: PulseTrigger::Beats,
                    fade: None,
                }
            }
        };

        self.activity = activity;
        self.phase = 0.0;
        tracing::info!(mode = %self.mode, "effect started");
        Ok(())
    }

    /// Deactivates the running mode and steps the actuator back to 0. Once this
    /// returns, the previous mode's listener or capture is closed and any of
    /// its signals still queued will be discarded.
    pub fn stop(&mut self) {
        match std::mem::replace(&mut self.activity, Activity::Idle) {
            Activity::Idle => return,
            Activity::Continuous { .. } => {}
            Activity::Pulse {
                trigger: PulseTrigger::Keys(mut listener),
                ..
            } => listener.close(),
            Activity::Pulse {
                trigger: PulseTrigger::Beats,
                ..
            } => {
                self.detector.stop();
                if let Err(err) = self.detector.clear_on_beat() {
                    tracing::warn!(%err, "beat callback left registered");
                }
            }
        }

        self.generation += 1;
        self.drive_to(0);
        self.phase = 0.0;
        tracing::info!(mode = %self.mode, "effect stopped");
    }

    /// Starts when stopped, stops when running.
    pub fn toggle(&mut self, now: Instant) -> Result<()> {
        if self.is_running() {
            self.stop();
            Ok(())
        } else {
            self.start(now)
        }
    }

    /// Switches mode. While running, the old mode is fully stopped before the
    /// new one starts; if the new one cannot start the scheduler stays idle.
    pub fn set_mode(&mut self, mode: EffectMode, now: Instant) -> Result<()> {
        if mode == self.mode {
            return Ok(());
        }
        if !self.is_running() {
            self.mode = mode;
            return Ok(());
        }
        self.stop();
        self.mode = mode;
        self.start(now)
    }

    /// Switches to the next mode in order, with the same rules as `set_mode`.
    pub fn cycle_mode(&mut self, now: Instant) -> Result<()> {
        self.set_mode(self.mode.next(), now)
    }

    /// Clamps and stores the breathing period. A running breathing effect is
    /// re-anchored so the waveform restarts instead of jumping.
    pub fn set_speed(&mut self, speed: f64, now: Instant) -> f64 {
        let speed = self.settings.set_speed(speed);
        if let Activity::Continuous { clock, .. } = &mut self.activity {
            clock.reanchor(now);
        }
        speed
    }

    /// Clamps and stores the peak level; applies from the next update.
    pub fn set_intensity(&mut self, intensity: i64) -> u8 {
        self.settings.set_intensity(intensity)
    }

    /// Clamps and stores beat sensitivity, forwarding it to the detector.
    pub fn set_sensitivity(&mut self, sensitivity: f32) -> f32 {
        let sensitivity = self.settings.set_sensitivity(sensitivity);
        self.detector.set_sensitivity(sensitivity);
        sensitivity
    }

    /// Applies a key-down or beat if it belongs to the current activation and
    /// mode; anything else is dropped.
    pub fn handle_signal(&mut self, signal: Signal, now: Instant) {
        let current = signal.generation() == self.generation;
        let accepted = match (&self.activity, signal) {
            (
                Activity::Pulse {
                    trigger: PulseTrigger::Keys(_),
                    ..
                },
                Signal::KeyDown { .. },
            )
            | (
                Activity::Pulse {
                    trigger: PulseTrigger::Beats,
                    ..
                },
                Signal::Beat { .. },
            ) => current,
            _ => false,
        };

        if accepted {
            self.pulse(now);
        } else {
            tracing::debug!(?signal, generation = self.generation, "discarding stale signal");
        }
    }

    /// Runs whichever periodic work is due at `now`.
    pub fn tick(&mut self, now: Instant) {
        let speed = self.settings.speed();
        let mut breathing = None;
        let mut fade_due = false;

        match &mut self.activity {
            Activity::Continuous { clock, ticker } => {
                if ticker.fire(now) {
                    breathing = Some(clock.cycle_progress(now, speed));
                }
            }
            Activity::Pulse {
                fade: Some(timer), ..
            } => fade_due = timer.fire(now),
            _ => {}
        }

        if let Some(progress) = breathing {
            self.update_breathing(progress);
        }
        if fade_due {
            self.fade_step();
        }
    }

    /// Earliest instant after which [`tick`](Self::tick) has work, including
    /// the moment the beat indicator drops so observers can be refreshed.
    pub fn next_deadline(&self, now: Instant) -> Option<Instant> {
        match &self.activity {
            Activity::Idle => None,
            Activity::Continuous { ticker, .. } => Some(ticker.next_due()),
            Activity::Pulse { trigger, fade } => {
                let fade = fade.as_ref().map(PeriodicTimer::next_due);
                let indicator = match trigger {
                    PulseTrigger::Beats => self
                        .detector
                        .meter()
                        .indicator_deadline()
                        .filter(|deadline| *deadline > now),
                    PulseTrigger::Keys(_) => None,
                };
                match (fade, indicator) {
                    (Some(a), Some(b)) => Some(a.min(b)),
                    (a, b) => a.or(b),
                }
            }
        }
    }

    /// Returns the observable state; the beat flag is evaluated at `now`.
    pub fn snapshot(&self, now: Instant) -> EffectSnapshot {
        let meter = self.detector.meter();
        let intensity = self.settings.intensity();
        let brightness = match self.activity {
            Activity::Idle => 0.0,
            Activity::Continuous { .. } => breathing_brightness(self.phase),
            Activity::Pulse { .. } => f64::from(self.level) / f64::from(intensity.max(1)),
        };
        EffectSnapshot {
            running: self.is_running(),
            mode: self.mode,
            level: self.level,
            phase: self.phase,
            brightness: brightness.min(1.0),
            speed: self.settings.speed(),
            intensity,
            sensitivity: self.settings.sensitivity(),
            beat_detected: meter.beat_detected_at(now),
            current_volume: meter.volume(),
        }
    }

    fn update_breathing(&mut self, progress: f64) {
        self.phase = progress;
        let target = breathing_target(progress, self.settings.intensity());
        self.drive_to(target);
    }

    fn pulse(&mut self, now: Instant) {
        let steps = self.drive_to(self.settings.intensity());
        // The ramp blocks for the actuator spacing; fading starts after it.
        let fade_start = now + self.timing.step_spacing * steps;
        let fade_tick = self.timing.fade_tick;
        if let Activity::Pulse { fade, .. } = &mut self.activity {
            *fade = Some(PeriodicTimer::starting_at(fade_start, fade_tick));
        }
        tracing::debug!(level = self.level, "pulse");
    }

    fn fade_step(&mut self) {
        if self.level > 0 {
            self.drive_to(self.level - 1);
            self.phase = (f64::from(self.level) / f64::from(self.settings.intensity())).min(1.0);
        }
        if self.level == 0 {
            if let Activity::Pulse { fade, .. } = &mut self.activity {
                *fade = None;
            }
        }
    }

    /// Steps from the believed level to `target` in one direction and returns
    /// how many commands were issued.
    fn drive_to(&mut self, target: u8) -> u32 {
        let target = target.min(LEVEL_MAX);
        let (steps, direction) = match target.cmp(&self.level) {
            Ordering::Equal => return 0,
            Ordering::Greater => (target - self.level, Direction::Up),
            Ordering::Less => (self.level - target, Direction::Down),
        };
        self.actuator.step_by(u32::from(steps), direction);
        tracing::debug!(from = self.level, to = target, "level change");
        self.level = target;
        u32::from(steps)
    }
}

impl<D> fmt::Debug for EffectScheduler<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EffectScheduler")
            .field("mode", &self.mode)
            .field("running", &!matches!(self.activity, Activity::Idle))
            .field("level", &self.level)
            .field("phase", &self.phase)
            .field("settings", &self.settings)
            .field("generation", &self.generation)
            .finish()
    }
}

impl<D> Drop for EffectScheduler<D> {
    fn drop(&mut self) {
        if !matches!(self.activity, Activity::Idle) {
            tracing::warn!(
                level = self.level,
                "scheduler dropped while running; call stop() to return the actuator to 0"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::{unbounded, Receiver};
    use proptest::prelude::*;

    use super::*;
    use crate::{
        actuator::RecordingDevice,
        audio::{CaptureStream, FrameCallback, FramePusher, PushSource},
        input::{KeyCallback, KeyTrigger, ManualKeySource},
        LightBoardError,
    };

    struct Harness {
        scheduler: EffectScheduler<RecordingDevice>,
        device: RecordingDevice,
        signals: Receiver<Signal>,
        keys: KeyTrigger,
        audio: FramePusher,
        t0: Instant,
        now: Instant,
    }

    fn config(mode: EffectMode, intensity: i64, speed: f64) -> AppConfig {
        AppConfig {
            mode,
            effect: EffectSettings::new(speed, intensity, 0.5),
            timing: TimingConfig {
                step_spacing: Duration::ZERO,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn harness(mode: EffectMode, intensity: i64, speed: f64) -> Harness {
        let device = RecordingDevice::new();
        let (tx, rx) = unbounded();
        let (audio_source, audio) = PushSource::new();
        let (key_source, keys) = ManualKeySource::new();
        let scheduler = EffectScheduler::new(
            device.clone(),
            Sources::new(audio_source, key_source),
            config(mode, intensity, speed),
            tx,
        );
        let t0 = Instant::now();
        Harness {
            scheduler,
            device,
            signals: rx,
            keys,
            audio,
            t0,
            now: t0,
        }
    }

    impl Harness {
        fn at(&self, millis: u64) -> Instant {
            self.t0 + Duration::from_millis(millis)
        }

        fn start(&mut self) {
            self.scheduler.start(self.now).unwrap();
        }

        fn drain_signals(&mut self) {
            let pending: Vec<Signal> = self.signals.try_iter().collect();
            for signal in pending {
                self.scheduler.handle_signal(signal, self.now);
            }
        }

        /// Advances simulated time, ticking at every deadline on the way.
        fn run_until(&mut self, millis: u64) {
            let until = self.at(millis);
            while let Some(due) = self.scheduler.next_deadline(self.now) {
                if due > until {
                    break;
                }
                self.now = due.max(self.now);
                self.scheduler.tick(self.now);
            }
            self.now = until;
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.scheduler.stop();
        }
    }

    struct DeniedAudio;

    impl AudioSource for DeniedAudio {
        fn open(&mut self, _: usize, _: FrameCallback) -> Result<Box<dyn CaptureStream>> {
            Err(LightBoardError::PermissionDenied("microphone".into()))
        }
    }

    struct DeniedKeys;

    impl KeySource for DeniedKeys {
        fn listen(&mut self, _: KeyCallback) -> Result<Box<dyn KeyListener>> {
            Err(LightBoardError::PermissionDenied("input monitoring".into()))
        }
    }

    fn bass_frame(amplitude: f32) -> Vec<f32> {
        (0..1024)
            .map(|n| amplitude * (2.0 * std::f32::consts::PI * 2.0 * n as f32 / 1024.0).sin())
            .collect()
    }

    #[test]
    fn breathing_rises_to_intensity_then_descends() {
        let mut h = harness(EffectMode::Continuous, 5, 4.0);
        h.start();
        assert!(h.scheduler.is_running());
        assert_eq!(h.scheduler.level(), 0);

        h.run_until(100);
        assert_eq!(h.scheduler.level(), 3);
        assert_eq!(h.device.commands(), vec![Direction::Up; 3]);

        h.run_until(1_000);
        assert_eq!(h.scheduler.level(), 5);
        assert!((h.scheduler.phase() - 0.25).abs() < 1e-9);

        h.run_until(3_000);
        assert_eq!(h.scheduler.level(), 0);
        assert_eq!(h.device.net(), 0);
    }

    #[test]
    fn each_breathing_update_moves_in_one_direction() {
        let mut h = harness(EffectMode::Continuous, 10, 1.0);
        h.start();
        for step in 1..=40 {
            h.device.clear();
            h.run_until(step * 100);
            let commands = h.device.commands();
            assert!(
                commands.windows(2).all(|pair| pair[0] == pair[1]),
                "mixed directions in one update: {commands:?}"
            );
            assert!(h.scheduler.level() <= 10);
        }
    }

    #[test]
    fn starting_twice_is_the_same_as_once() {
        let mut h = harness(EffectMode::Continuous, 5, 4.0);
        h.start();
        h.run_until(500);
        let level = h.scheduler.level();
        let commands = h.device.commands();

        h.start();
        assert_eq!(h.scheduler.level(), level);
        assert_eq!(h.device.commands(), commands);

        h.run_until(1_000);
        assert_eq!(h.scheduler.level(), 5);
    }

    #[test]
    fn stop_drains_to_zero_and_is_idempotent() {
        let mut h = harness(EffectMode::Continuous, 5, 4.0);
        h.start();
        h.run_until(1_000);
        h.device.clear();

        h.scheduler.stop();
        assert_eq!(h.device.commands(), vec![Direction::Down; 5]);
        assert!(!h.scheduler.is_running());
        assert_eq!(h.scheduler.level(), 0);
        assert_eq!(h.scheduler.phase(), 0.0);
        assert_eq!(h.scheduler.next_deadline(h.now), None);

        h.scheduler.stop();
        assert_eq!(h.device.commands().len(), 5);
        assert_eq!(h.scheduler.actuator().net_steps(), 0);
    }

    #[test]
    fn speed_change_reanchors_the_waveform() {
        let mut h = harness(EffectMode::Continuous, 5, 4.0);
        h.start();
        h.run_until(1_000);
        assert_eq!(h.scheduler.level(), 5);

        assert_eq!(h.scheduler.set_speed(40.0, h.now), 10.0);
        h.run_until(1_100);
        assert!((h.scheduler.phase() - 0.01).abs() < 1e-9);
        assert_eq!(h.scheduler.level(), 3);
    }

    #[test]
    fn key_press_pulses_then_fades_one_step_per_tick() {
        let mut h = harness(EffectMode::KeyPress, 4, 4.0);
        h.start();
        assert_eq!(h.scheduler.next_deadline(h.now), None);

        assert!(h.keys.press());
        h.drain_signals();
        assert_eq!(h.scheduler.level(), 4);
        assert_eq!(h.scheduler.next_deadline(h.now), Some(h.at(50)));

        for (tick, expected) in [3, 2, 1, 0].into_iter().enumerate() {
            h.run_until(50 * (tick as u64 + 1));
            assert_eq!(h.scheduler.level(), expected);
        }
        assert!((h.scheduler.phase() - 0.0).abs() < 1e-12);
        assert_eq!(h.scheduler.next_deadline(h.now), None);

        let mut expected = vec![Direction::Up; 4];
        expected.extend([Direction::Down; 4]);
        assert_eq!(h.device.commands(), expected);
    }

    #[test]
    fn key_during_fade_restarts_from_peak() {
        let mut h = harness(EffectMode::KeyPress, 5, 4.0);
        h.start();
        h.keys.press();
        h.drain_signals();
        h.run_until(100);
        assert_eq!(h.scheduler.level(), 3);
        assert!((h.scheduler.phase() - 0.6).abs() < 1e-12);

        h.device.clear();
        h.keys.press();
        h.drain_signals();
        assert_eq!(h.scheduler.level(), 5);
        assert_eq!(h.device.commands(), vec![Direction::Up; 2]);
        assert_eq!(h.scheduler.next_deadline(h.now), Some(h.at(150)));
    }

    #[test]
    fn mode_switch_drains_before_the_new_mode_starts() {
        let mut h = harness(EffectMode::Continuous, 5, 4.0);
        h.start();
        h.run_until(100);
        assert_eq!(h.scheduler.level(), 3);
        h.device.clear();

        h.scheduler.set_mode(EffectMode::KeyPress, h.now).unwrap();
        assert_eq!(h.device.commands(), vec![Direction::Down; 3]);
        assert_eq!(h.scheduler.level(), 0);
        assert!(h.scheduler.is_running());
        assert_eq!(h.scheduler.mode(), EffectMode::KeyPress);
        assert!(h.keys.is_listening());
    }

    #[test]
    fn set_mode_while_stopped_only_records() {
        let mut h = harness(EffectMode::Continuous, 5, 4.0);
        h.scheduler.set_mode(EffectMode::MusicSync, h.now).unwrap();
        assert_eq!(h.scheduler.mode(), EffectMode::MusicSync);
        assert!(!h.scheduler.is_running());
        assert!(!h.audio.is_open());

        h.scheduler.cycle_mode(h.now).unwrap();
        assert_eq!(h.scheduler.mode(), EffectMode::Continuous);
    }

    #[test]
    fn signals_from_a_previous_activation_are_discarded() {
        let mut h = harness(EffectMode::KeyPress, 5, 4.0);
        h.start();
        h.keys.press();
        h.scheduler.stop();
        assert!(!h.keys.is_listening());

        h.start();
        h.drain_signals();
        assert_eq!(h.scheduler.level(), 0);
        assert!(h.device.commands().is_empty());
    }

    #[test]
    fn toggle_flips_running_state() {
        let mut h = harness(EffectMode::KeyPress, 5, 4.0);
        h.scheduler.toggle(h.now).unwrap();
        assert!(h.scheduler.is_running());
        h.keys.press();
        h.drain_signals();

        h.scheduler.toggle(h.now).unwrap();
        assert!(!h.scheduler.is_running());
        assert_eq!(h.device.net(), 0);
    }

    #[test]
    fn music_sync_pulses_on_detected_beats() {
        let mut h = harness(EffectMode::MusicSync, 6, 4.0);
        h.start();
        assert!(h.audio.is_open());

        for _ in 0..43 {
            h.audio.push(&bass_frame(0.1));
        }
        assert!(h.signals.is_empty());
        h.audio.push(&bass_frame(1.0));
        assert_eq!(h.signals.len(), 1);

        let signal = h.signals.try_recv().unwrap();
        let Signal::Beat { at, .. } = signal else {
            panic!("expected a beat, got {signal:?}");
        };
        h.scheduler.handle_signal(signal, h.now);
        assert_eq!(h.scheduler.level(), 6);
        let snapshot = h.scheduler.snapshot(at);
        assert!(snapshot.beat_detected);
        assert!(snapshot.current_volume > 0.5);

        h.scheduler.stop();
        assert!(!h.audio.is_open());
        assert_eq!(h.device.net(), 0);
        assert_eq!(h.scheduler.snapshot(Instant::now()).current_volume, 0.0);
    }

    #[test]
    fn sensitivity_persists_across_restarts() {
        let mut h = harness(EffectMode::MusicSync, 5, 4.0);
        assert_eq!(h.scheduler.set_sensitivity(-1.0), 0.0);
        h.start();
        h.scheduler.stop();
        h.start();
        assert_eq!(h.scheduler.snapshot(h.now).sensitivity, 0.0);
        assert_eq!(h.scheduler.settings().sensitivity(), 0.0);
    }

    #[test]
    fn unavailable_sources_keep_the_mode_stopped() {
        let device = RecordingDevice::new();
        let (tx, _rx) = unbounded();
        let mut scheduler = EffectScheduler::new(
            device.clone(),
            Sources::new(DeniedAudio, DeniedKeys),
            config(EffectMode::MusicSync, 5, 4.0),
            tx,
        );
        let now = Instant::now();

        let err = scheduler.start(now).unwrap_err();
        assert!(err.is_source_unavailable());
        assert!(!scheduler.is_running());

        let err = scheduler.set_mode(EffectMode::KeyPress, now).and_then(|_| scheduler.start(now));
        assert!(matches!(err, Err(LightBoardError::PermissionDenied(_))));
        assert!(!scheduler.is_running());

        scheduler.set_mode(EffectMode::Continuous, now).unwrap();
        scheduler.start(now).unwrap();
        assert!(scheduler.is_running());
        scheduler.stop();
        assert!(device.commands().is_empty());
    }

    #[test]
    fn snapshot_serialises_observables() {
        let mut h = harness(EffectMode::Continuous, 5, 4.0);
        h.start();
        h.run_until(1_000);
        let json = serde_json::to_value(h.scheduler.snapshot(h.now)).unwrap();
        assert_eq!(json["running"], true);
        assert_eq!(json["mode"], "continuous");
        assert_eq!(json["level"], 5);
        assert_eq!(json["beat_detected"], false);
        assert!((json["brightness"].as_f64().unwrap() - 1.0).abs() < 1e-9);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Stop,
        Toggle,
        SetMode(EffectMode),
        SetIntensity(i64),
        SetSpeed(f64),
        Key,
        Advance(u64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::Stop),
            Just(Op::Toggle),
            prop::sample::select(EffectMode::ALL.to_vec()).prop_map(Op::SetMode),
            (-3_i64..15).prop_map(Op::SetIntensity),
            (0.0_f64..12.0).prop_map(Op::SetSpeed),
            Just(Op::Key),
            (1_u64..700).prop_map(Op::Advance),
        ]
    }

    proptest! {
        #[test]
        fn breathing_level_stays_within_bounds(
            speed in 0.5_f64..12.0,
            intensity in -2_i64..14,
            millis in 1_u64..12_000,
        ) {
            let mut h = harness(EffectMode::Continuous, intensity, speed);
            let bound = h.scheduler.settings().intensity();
            h.start();
            let mut elapsed = 0;
            while elapsed < millis {
                elapsed = (elapsed + 100).min(millis);
                h.run_until(elapsed);
                prop_assert!(h.scheduler.level() <= bound);
                prop_assert_eq!(i64::from(h.scheduler.level()), h.device.net());
            }
        }

        #[test]
        fn every_stop_returns_to_baseline(ops in prop::collection::vec(op(), 1..40)) {
            let mut h = harness(EffectMode::Continuous, 5, 4.0);
            let mut elapsed = 0;
            for op in ops {
                match op {
                    Op::Start => { let _ = h.scheduler.start(h.now); }
                    Op::Stop => h.scheduler.stop(),
                    Op::Toggle => { let _ = h.scheduler.toggle(h.now); }
                    Op::SetMode(mode) => { let _ = h.scheduler.set_mode(mode, h.now); }
                    Op::SetIntensity(value) => { h.scheduler.set_intensity(value); }
                    Op::SetSpeed(value) => { h.scheduler.set_speed(value, h.now); }
                    Op::Key => {
                        h.keys.press();
                        h.drain_signals();
                    }
                    Op::Advance(millis) => {
                        elapsed += millis;
                        h.run_until(elapsed);
                    }
                }
                prop_assert_eq!(i64::from(h.scheduler.level()), h.device.net());
                if !h.scheduler.is_running() {
                    prop_assert_eq!(h.device.net(), 0);
                }
            }
            h.scheduler.stop();
            prop_assert_eq!(h.device.net(), 0);
        }
    }
}
