use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    terminal,
};

use crate::{timeline::Worker, LightBoardError, Result};

/// Invoked once per key-down.
pub type KeyCallback = Box<dyn FnMut() + Send>;

/// An active key subscription. Closing is synchronous: once `close` returns no
/// further key-downs are delivered.
pub trait KeyListener {
    fn close(&mut self);
}

/// The external "read one key-down event" capability.
pub trait KeySource: Send {
    fn listen(&mut self, on_key: KeyCallback) -> Result<Box<dyn KeyListener>>;
}

impl<S: KeySource + ?Sized> KeySource for Box<S> {
    fn listen(&mut self, on_key: KeyCallback) -> Result<Box<dyn KeyListener>> {
        (**self).listen(on_key)
    }
}

/// Key source driven by the embedding application through [`KeyTrigger`].
pub struct ManualKeySource {
    slot: Arc<Mutex<Option<KeyCallback>>>,
}

/// Handle that delivers key-downs to a [`ManualKeySource`].
#[derive(Clone)]
pub struct KeyTrigger {
    slot: Arc<Mutex<Option<KeyCallback>>>,
}

impl ManualKeySource {
    /// Creates the source and the trigger that presses keys on it.
    pub fn new() -> (Self, KeyTrigger) {
        let slot: Arc<Mutex<Option<KeyCallback>>> = Arc::new(Mutex::new(None));
        (Self { slot: slot.clone() }, KeyTrigger { slot })
    }
}

impl KeySource for ManualKeySource {
    fn listen(&mut self, on_key: KeyCallback) -> Result<Box<dyn KeyListener>> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| LightBoardError::msg("key source has been poisoned"))?;
        *slot = Some(on_key);
        Ok(Box::new(ManualListener {
            slot: self.slot.clone(),
        }))
    }
}

impl KeyTrigger {
    /// Delivers one key-down. Returns false when nobody is listening.
    pub fn press(&self) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        match slot.as_mut() {
            Some(on_key) => {
                on_key();
                true
            }
            None => false,
        }
    }

    /// Returns true while a listener is registered.
    pub fn is_listening(&self) -> bool {
        self.slot.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

impl std::fmt::Debug for ManualKeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManualKeySource").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for KeyTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyTrigger")
            .field("listening", &self.is_listening())
            .finish()
    }
}

struct ManualListener {
    slot: Arc<Mutex<Option<KeyCallback>>>,
}

impl KeyListener for ManualListener {
    fn close(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

impl Drop for ManualListener {
    fn drop(&mut self) {
        self.close();
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Key-downs from the controlling terminal, read in raw mode. Ctrl-C and Esc
/// are not forwarded; they raise the interrupt flag instead.
#[derive(Debug, Clone, Default)]
pub struct TerminalKeySource {
    interrupt: Arc<AtomicBool>,
}

impl TerminalKeySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `interrupt` as the flag raised on Ctrl-C or Esc.
    pub fn with_interrupt(interrupt: Arc<AtomicBool>) -> Self {
        Self { interrupt }
    }

    pub fn interrupt(&self) -> Arc<AtomicBool> {
        self.interrupt.clone()
    }
}

impl KeySource for TerminalKeySource {
    fn listen(&mut self, mut on_key: KeyCallback) -> Result<Box<dyn KeyListener>> {
        terminal::enable_raw_mode().map_err(|err| {
            LightBoardError::PermissionDenied(format!("terminal input unavailable: {err}"))
        })?;

        let interrupt = self.interrupt.clone();
        let worker = Worker::spawn("lightboard-keys", move |token| {
            while !token.is_cancelled() {
                match event::poll(POLL_INTERVAL) {
                    Ok(false) => continue,
                    Ok(true) => {}
                    Err(err) => {
                        tracing::warn!(%err, "terminal input failed");
                        return;
                    }
                }
                let key = match event::read() {
                    Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => key,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(%err, "terminal input failed");
                        return;
                    }
                };
                let ctrl_c = key.code == KeyCode::Char('c')
                    && key.modifiers.contains(KeyModifiers::CONTROL);
                if ctrl_c || key.code == KeyCode::Esc {
                    interrupt.store(true, Ordering::SeqCst);
                } else {
                    on_key();
                }
            }
        });

        match worker {
            Ok(worker) => {
                tracing::info!("key press monitoring started");
                Ok(Box::new(TerminalListener {
                    worker: Some(worker),
                }))
            }
            Err(err) => {
                restore_terminal();
                Err(err)
            }
        }
    }
}

struct TerminalListener {
    worker: Option<Worker>,
}

impl KeyListener for TerminalListener {
    fn close(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        if let Err(err) = worker.stop() {
            tracing::warn!(%err, "key listener did not stop cleanly");
        }
        restore_terminal();
        tracing::info!("key press monitoring stopped");
    }
}

impl Drop for TerminalListener {
    fn drop(&mut self) {
        self.close();
    }
}

fn restore_terminal() {
    if let Err(err) = terminal::disable_raw_mode() {
        tracing::warn!(%err, "could not leave raw mode");
    }
}
