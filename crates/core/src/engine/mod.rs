//! Threaded runtime around [`EffectScheduler`].
//!
//! The scheduler lives on one dedicated thread, which is also where actuator
//! steps block. Commands, key-downs, beats and timer deadlines are all
//! multiplexed onto that thread, keeping the scheduler the single writer of
//! level and phase. Every command waits for the thread's reply, so a returned
//! `stop()` means the previous mode is fully torn down.

use std::{thread::JoinHandle, time::Instant};

use crossbeam_channel::{bounded, select, unbounded, Receiver, Sender, TrySendError};

use crate::{
    actuator::StepDevice,
    config::AppConfig,
    effect::{EffectMode, EffectScheduler, EffectSnapshot, Sources},
    LightBoardError, Result,
};

const SUBSCRIBER_BACKLOG: usize = 64;

enum Command {
    Start,
    Stop,
    Toggle,
    SetMode(EffectMode),
    CycleMode,
    SetSpeed(f64),
    SetIntensity(i64),
    SetSensitivity(f32),
    Snapshot,
    Subscribe(Sender<EffectSnapshot>),
    Shutdown,
}

struct Request {
    command: Command,
    reply: Sender<Result<EffectSnapshot>>,
}

/// Handle to the effect thread. Dropping it stops the running effect, returns
/// the actuator to 0 and joins the thread.
#[derive(Debug)]
pub struct EffectEngine {
    requests: Sender<Request>,
    thread: Option<JoinHandle<()>>,
}

impl EffectEngine {
    /// Spawns the effect thread. The scheduler is built on that thread and starts idle.
    pub fn spawn<D>(device: D, sources: Sources, config: AppConfig) -> Result<Self>
    where
        D: StepDevice + Send + 'static,
    {
        let (requests, inbox) = unbounded();
        let thread = std::thread::Builder::new()
            .name("lightboard-effects".into())
            .spawn(move || run(device, sources, config, inbox))?;

        Ok(Self {
            requests,
            thread: Some(thread),
        })
    }

    /// Starts the configured mode. Fails when its input source cannot be opened.
    pub fn start(&self) -> Result<EffectSnapshot> {
        self.request(Command::Start)
    }

    /// Stops the running mode; the returned snapshot is already back at level 0.
    pub fn stop(&self) -> Result<EffectSnapshot> {
        self.request(Command::Stop)
    }

    /// Starts when stopped, stops when running.
    pub fn toggle(&self) -> Result<EffectSnapshot> {
        self.request(Command::Toggle)
    }

    /// Switches mode, draining the old one first if running.
    pub fn set_mode(&self, mode: EffectMode) -> Result<EffectSnapshot> {
        self.request(Command::SetMode(mode))
    }

    /// Switches to the next mode in order.
    pub fn cycle_mode(&self) -> Result<EffectSnapshot> {
        self.request(Command::CycleMode)
    }

    /// Sets the breathing period; the snapshot carries the clamped value.
    pub fn set_speed(&self, speed: f64) -> Result<EffectSnapshot> {
        self.request(Command::SetSpeed(speed))
    }

    /// Sets the peak level; the snapshot carries the clamped value.
    pub fn set_intensity(&self, intensity: i64) -> Result<EffectSnapshot> {
        self.request(Command::SetIntensity(intensity))
    }

    /// Sets beat sensitivity; the snapshot carries the clamped value.
    pub fn set_sensitivity(&self, sensitivity: f32) -> Result<EffectSnapshot> {
        self.request(Command::SetSensitivity(sensitivity))
    }

    /// Returns the current observable state.
    pub fn snapshot(&self) -> Result<EffectSnapshot> {
        self.request(Command::Snapshot)
    }

    /// Receives a snapshot every time observable state changes. Slow
    /// subscribers miss intermediate updates rather than stalling the effect.
    pub fn subscribe(&self) -> Result<Receiver<EffectSnapshot>> {
        let (tx, rx) = bounded(SUBSCRIBER_BACKLOG);
        self.request(Command::Subscribe(tx))?;
        Ok(rx)
    }

    /// Stops the effect and waits for the thread to exit.
    pub fn shutdown(mut self) -> Result<EffectSnapshot> {
        let last = self.request(Command::Shutdown);
        self.join()?;
        last
    }

    fn request(&self, command: Command) -> Result<EffectSnapshot> {
        let (reply, response) = bounded(1);
        self.requests
            .send(Request { command, reply })
            .map_err(|_| engine_gone())?;
        response.recv().map_err(|_| engine_gone())?
    }

    fn join(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| LightBoardError::msg("effect thread panicked")),
            None => Ok(()),
        }
    }
}

impl Drop for EffectEngine {
    fn drop(&mut self) {
        if self.thread.is_none() {
            return;
        }
        let _ = self.request(Command::Shutdown);
        if let Err(err) = self.join() {
            tracing::warn!(%err, "effect thread did not shut down cleanly");
        }
    }
}

fn engine_gone() -> LightBoardError {
    LightBoardError::msg("effect engine has shut down")
}

fn run<D: StepDevice>(device: D, sources: Sources, config: AppConfig, inbox: Receiver<Request>) {
    let (signal_tx, signals) = unbounded();
    let mut scheduler = EffectScheduler::new(device, sources, config, signal_tx);
    let mut subscribers: Vec<Sender<EffectSnapshot>> = Vec::new();
    let mut published: Option<EffectSnapshot> = None;
    tracing::debug!("effect thread running");

    loop {
        let timer = scheduler
            .next_deadline(Instant::now())
            .map(crossbeam_channel::at)
            .unwrap_or_else(crossbeam_channel::never);

        select! {
            recv(inbox) -> request => match request {
                Ok(Request { command: Command::Shutdown, reply }) => {
                    scheduler.stop();
                    let _ = reply.send(Ok(scheduler.snapshot(Instant::now())));
                    break;
                }
                Ok(Request { command, reply }) => {
                    let outcome = apply(&mut scheduler, &mut subscribers, command);
                    let _ = reply.send(outcome.map(|()| scheduler.snapshot(Instant::now())));
                }
                Err(_) => {
                    scheduler.stop();
                    break;
                }
            },
            recv(signals) -> signal => {
                if let Ok(signal) = signal {
                    scheduler.handle_signal(signal, Instant::now());
                }
            },
            recv(timer) -> _ => scheduler.tick(Instant::now()),
        }

        publish(&scheduler, &mut subscribers, &mut published);
    }

    publish(&scheduler, &mut subscribers, &mut published);
    tracing::debug!("effect thread exiting");
}

fn apply<D: StepDevice>(
    scheduler: &mut EffectScheduler<D>,
    subscribers: &mut Vec<Sender<EffectSnapshot>>,
    command: Command,
) -> Result<()> {
    let now = Instant::now();
    match command {
        Command::Start => scheduler.start(now)?,
        Command::Stop => scheduler.stop(),
        Command::Toggle => scheduler.toggle(now)?,
        Command::SetMode(mode) => scheduler.set_mode(mode, now)?,
        Command::CycleMode => scheduler.cycle_mode(now)?,
        Command::SetSpeed(speed) => {
            scheduler.set_speed(speed, now);
        }
        Command::SetIntensity(intensity) => {
            scheduler.set_intensity(intensity);
        }
        Command::SetSensitivity(sensitivity) => {
            scheduler.set_sensitivity(sensitivity);
        }
        Command::Snapshot | Command::Shutdown => {}
        Command::Subscribe(tx) => {
            let _ = tx.try_send(scheduler.snapshot(now));
            subscribers.push(tx);
        }
    }
    Ok(())
}

fn publish<D: StepDevice>(
    scheduler: &EffectScheduler<D>,
    subscribers: &mut Vec<Sender<EffectSnapshot>>,
    published: &mut Option<EffectSnapshot>,
) {
    let snapshot = scheduler.snapshot(Instant::now());
    if published.as_ref() == Some(&snapshot) {
        return;
    }
    subscribers.retain(|tx| !matches!(tx.try_send(snapshot.clone()), Err(TrySendError::Disconnected(_))));
    *published = Some(snapshot);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        actuator::RecordingDevice,
        audio::{AudioSource, CaptureStream, FrameCallback, PushSource},
        config::{EffectSettings, TimingConfig},
        input::{KeyTrigger, ManualKeySource},
    };

    fn config(mode: EffectMode) -> AppConfig {
        AppConfig {
            mode,
            effect: EffectSettings::new(1.0, 4, 0.5),
            timing: TimingConfig {
                breathing_tick: Duration::from_millis(20),
                fade_tick: Duration::from_millis(20),
                step_spacing: Duration::ZERO,
            },
            ..Default::default()
        }
    }

    fn spawn(mode: EffectMode) -> (EffectEngine, RecordingDevice, KeyTrigger) {
        let device = RecordingDevice::new();
        let (audio, _pusher) = PushSource::new();
        let (keys, trigger) = ManualKeySource::new();
        let engine =
            EffectEngine::spawn(device.clone(), Sources::new(audio, keys), config(mode)).unwrap();
        (engine, device, trigger)
    }

    fn wait_for<F>(rx: &Receiver<EffectSnapshot>, mut predicate: F) -> EffectSnapshot
    where
        F: FnMut(&EffectSnapshot) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let snapshot = rx
                .recv_timeout(remaining)
                .expect("expected snapshot did not arrive");
            if predicate(&snapshot) {
                return snapshot;
            }
        }
    }

    #[test]
    fn key_press_pulse_runs_on_the_effect_thread() {
        let (engine, device, trigger) = spawn(EffectMode::KeyPress);
        let updates = engine.subscribe().unwrap();

        let started = engine.start().unwrap();
        assert!(started.running);
        assert!(trigger.press());

        wait_for(&updates, |s| s.level == 4);
        wait_for(&updates, |s| s.level == 0);
        assert_eq!(device.net(), 0);
        assert_eq!(device.commands().len(), 8);

        let stopped = engine.stop().unwrap();
        assert!(!stopped.running);
        assert!(!trigger.is_listening());
    }

    #[test]
    fn breathing_reaches_intensity_and_shutdown_drains() {
        let (engine, device, _trigger) = spawn(EffectMode::Continuous);
        let updates = engine.subscribe().unwrap();
        engine.start().unwrap();

        wait_for(&updates, |s| s.level == 4);
        let last = engine.shutdown().unwrap();
        assert!(!last.running);
        assert_eq!(last.level, 0);
        assert_eq!(device.net(), 0);
    }

    #[test]
    fn configuration_calls_clamp_and_report() {
        let (engine, _device, _trigger) = spawn(EffectMode::Continuous);
        assert_eq!(engine.set_speed(0.0).unwrap().speed, 1.0);
        assert_eq!(engine.set_intensity(99).unwrap().intensity, 10);
        assert_eq!(engine.set_sensitivity(2.0).unwrap().sensitivity, 1.0);

        let snapshot = engine.cycle_mode().unwrap();
        assert_eq!(snapshot.mode, EffectMode::KeyPress);
        assert!(!snapshot.running);
        assert!(engine.toggle().unwrap().running);
        assert!(!engine.toggle().unwrap().running);
    }

    #[test]
    fn mode_switch_through_the_engine_returns_to_zero_first() {
        let (engine, device, trigger) = spawn(EffectMode::Continuous);
        let updates = engine.subscribe().unwrap();
        engine.start().unwrap();
        wait_for(&updates, |s| s.level > 0);

        let switched = engine.set_mode(EffectMode::KeyPress).unwrap();
        assert!(switched.running);
        assert_eq!(switched.level, 0);
        assert_eq!(device.net(), 0);
        assert!(trigger.is_listening());
    }

    struct BusyMicrophone;

    impl AudioSource for BusyMicrophone {
        fn open(&mut self, _: usize, _: FrameCallback) -> Result<Box<dyn CaptureStream>> {
            Err(LightBoardError::CaptureUnavailable("device busy".into()))
        }
    }

    #[test]
    fn failed_start_surfaces_and_stays_stopped() {
        let (keys, _trigger) = ManualKeySource::new();
        let engine = EffectEngine::spawn(
            RecordingDevice::new(),
            Sources::new(BusyMicrophone, keys),
            config(EffectMode::MusicSync),
        )
        .unwrap();

        let err = engine.start().unwrap_err();
        assert!(matches!(err, LightBoardError::CaptureUnavailable(_)));
        assert!(!engine.snapshot().unwrap().running);
    }
}
