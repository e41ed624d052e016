use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::{timeline::Worker, LightBoardError, Result};

#[cfg(feature = "cpal")]
mod live;

#[cfg(feature = "cpal")]
pub use live::MicrophoneSource;

/// Receives one mono frame of exactly the requested size per invocation.
pub type FrameCallback = Box<dyn FnMut(&[f32]) + Send>;

/// An open capture. Closing is synchronous: once `close` returns, the frame
/// callback will not run again.
pub trait CaptureStream {
    fn close(&mut self);
}

/// The external "stream one audio frame" capability.
pub trait AudioSource: Send {
    fn open(&mut self, frame_size: usize, on_frame: FrameCallback) -> Result<Box<dyn CaptureStream>>;
}

impl<S: AudioSource + ?Sized> AudioSource for Box<S> {
    fn open(&mut self, frame_size: usize, on_frame: FrameCallback) -> Result<Box<dyn CaptureStream>> {
        (**self).open(frame_size, on_frame)
    }
}

/// Downmixes interleaved input to mono and re-blocks it into fixed-size
/// frames. The internal buffer is allocated once and reused.
#[derive(Debug)]
pub struct FrameAssembler {
    frame_size: usize,
    channels: usize,
    buffer: Vec<f32>,
}

impl FrameAssembler {
    /// Creates an assembler for `channels`-wide interleaved input.
    pub fn new(frame_size: usize, channels: usize) -> Self {
        let frame_size = frame_size.max(1);
        Self {
            frame_size,
            channels: channels.max(1),
            buffer: Vec::with_capacity(frame_size),
        }
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    /// Samples waiting for the next full frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Drops any partial frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Appends interleaved samples, calling `emit` for every completed frame.
    pub fn push_interleaved<F>(&mut self, data: &[f32], mut emit: F)
    where
        F: FnMut(&[f32]),
    {
        for chunk in data.chunks(self.channels) {
            let mono = chunk.iter().sum::<f32>() / chunk.len() as f32;
            self.buffer.push(mono);
            if self.buffer.len() == self.frame_size {
                emit(&self.buffer);
                self.buffer.clear();
            }
        }
    }
}

struct PushSlot {
    assembler: FrameAssembler,
    on_frame: FrameCallback,
}

/// Source driven by the embedding application: whatever pushes into the
/// paired [`FramePusher`] reaches the open capture.
pub struct PushSource {
    slot: Arc<Mutex<Option<PushSlot>>>,
}

/// Handle for feeding mono samples into a [`PushSource`].
#[derive(Clone)]
pub struct FramePusher {
    slot: Arc<Mutex<Option<PushSlot>>>,
}

impl PushSource {
    /// Creates the source and the handle that feeds it.
    pub fn new() -> (Self, FramePusher) {
        let slot = Arc::new(Mutex::new(None));
        (
            Self { slot: slot.clone() },
            FramePusher { slot },
        )
    }
}

impl AudioSource for PushSource {
    fn open(&mut self, frame_size: usize, on_frame: FrameCallback) -> Result<Box<dyn CaptureStream>> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| LightBoardError::msg("push source has been poisoned"))?;
        *slot = Some(PushSlot {
            assembler: FrameAssembler::new(frame_size, 1),
            on_frame,
        });
        Ok(Box::new(PushStream {
            slot: self.slot.clone(),
        }))
    }
}

impl FramePusher {
    /// Feeds mono samples. Returns false when no capture is open and the
    /// samples were dropped.
    pub fn push(&self, samples: &[f32]) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        match slot.as_mut() {
            Some(PushSlot {
                assembler,
                on_frame,
            }) => {
                assembler.push_interleaved(samples, |frame| on_frame(frame));
                true
            }
            None => false,
        }
    }

    /// Returns true while a capture is open on the paired source.
    pub fn is_open(&self) -> bool {
        self.slot.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }
}

struct PushStream {
    slot: Arc<Mutex<Option<PushSlot>>>,
}

impl CaptureStream for PushStream {
    fn close(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = None;
        }
    }
}

impl Drop for PushStream {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PushSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushSource").finish()
    }
}

impl std::fmt::Debug for FramePusher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePusher")
            .field("open", &self.is_open())
            .finish()
    }
}

/// Plays a WAV file into the capture callback from a background thread,
/// paced to the file's sample rate unless `realtime` is off.
#[derive(Debug, Clone)]
pub struct WavFileSource {
    path: PathBuf,
    realtime: bool,
}

impl WavFileSource {
    /// Creates a real-time paced source for the WAV file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            realtime: true,
        }
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AudioSource for WavFileSource {
    fn open(&mut self, frame_size: usize, mut on_frame: FrameCallback) -> Result<Box<dyn CaptureStream>> {
        let reader = open_wav(&self.path)?;
        let spec = reader.spec();
        let realtime = self.realtime;
        let frame_period =
            Duration::from_secs_f64(frame_size as f64 / f64::from(spec.sample_rate.max(1)));
        tracing::info!(
            path = %self.path.display(),
            sample_rate = spec.sample_rate,
            channels = spec.channels,
            "streaming wav file"
        );

        let worker = Worker::spawn("lightboard-wav", move |token| {
            let mut assembler = FrameAssembler::new(frame_size, usize::from(spec.channels));
            let mut next_frame = Instant::now();
            let samples = match decode_samples(reader) {
                Ok(samples) => samples,
                Err(err) => {
                    tracing::warn!(%err, "wav decode failed");
                    return;
                }
            };

            for block in samples.chunks(frame_size * usize::from(spec.channels.max(1))) {
                if token.is_cancelled() {
                    return;
                }
                assembler.push_interleaved(block, |frame| on_frame(frame));
                if realtime {
                    next_frame += frame_period;
                    let wait = next_frame.saturating_duration_since(Instant::now());
                    if !wait.is_zero() {
                        std::thread::sleep(wait);
                    }
                }
            }
            tracing::info!("wav file finished");
        })?;

        Ok(Box::new(WavStream { worker }))
    }
}

struct WavStream {
    worker: Worker,
}

impl CaptureStream for WavStream {
    fn close(&mut self) {
        if let Err(err) = self.worker.stop() {
            tracing::warn!(%err, "wav stream did not stop cleanly");
        }
    }
}

/// Decodes a whole WAV file to mono `f32` samples, returning them with the
/// file's sample rate.
pub fn read_wav_mono(path: &Path) -> Result<(Vec<f32>, u32)> {
    let reader = open_wav(path)?;
    let spec = reader.spec();
    let interleaved = decode_samples(reader)?;
    let mut mono = Vec::with_capacity(interleaved.len() / usize::from(spec.channels.max(1)));
    let mut assembler = FrameAssembler::new(1, usize::from(spec.channels));
    assembler.push_interleaved(&interleaved, |frame| mono.extend_from_slice(frame));
    Ok((mono, spec.sample_rate))
}

fn open_wav(path: &Path) -> Result<hound::WavReader<BufReader<File>>> {
    hound::WavReader::open(path).map_err(|err| match err {
        hound::Error::IoError(io) if io.kind() == std::io::ErrorKind::PermissionDenied => {
            LightBoardError::PermissionDenied(format!("{}: {io}", path.display()))
        }
        other => LightBoardError::CaptureUnavailable(format!("{}: {other}", path.display())),
    })
}

fn decode_samples(reader: hound::WavReader<BufReader<File>>) -> Result<Vec<f32>> {
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>(),
        hound::SampleFormat::Int => {
            let scale = (1_i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|sample| sample.map(|value| value as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
        }
    };
    samples.map_err(|err| LightBoardError::CaptureUnavailable(format!("wav decode: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn assembler_downmixes_and_reblocks() {
        let mut assembler = FrameAssembler::new(3, 2);
        let mut frames = Vec::new();

        assembler.push_interleaved(&[1.0, 0.0, 0.5, 0.5], |frame| frames.push(frame.to_vec()));
        assert!(frames.is_empty());
        assert_eq!(assembler.pending(), 2);

        assembler.push_interleaved(&[0.0, -1.0, 1.0, 1.0], |frame| frames.push(frame.to_vec()));
        assert_eq!(frames, vec![vec![0.5, 0.5, -0.5]]);
        assert_eq!(assembler.pending(), 1);
    }

    #[test]
    fn push_source_delivers_only_while_open() {
        let (mut source, pusher) = PushSource::new();
        assert!(!pusher.push(&[0.0; 4]));

        let (tx, rx) = mpsc::channel();
        let mut stream = source
            .open(4, Box::new(move |frame| tx.send(frame.len()).unwrap()))
            .unwrap();
        assert!(pusher.push(&[0.1; 6]));
        assert!(pusher.push(&[0.1; 2]));
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![4, 4]);

        stream.close();
        assert!(!pusher.is_open());
        assert!(!pusher.push(&[0.1; 4]));
    }

    fn write_wav(path: &Path, channels: u16, frames: usize) {
        let spec = hound::WavSpec {
            channels,
            sample_rate: 44_100,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(path, spec).unwrap();
        for _ in 0..frames {
            for _ in 0..channels {
                writer.write_sample(i16::MAX / 2).unwrap();
            }
        }
        writer.finalize().unwrap();
    }

    #[test]
    fn reads_wav_as_normalised_mono() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stereo.wav");
        write_wav(&path, 2, 100);

        let (mono, rate) = read_wav_mono(&path).unwrap();
        assert_eq!(rate, 44_100);
        assert_eq!(mono.len(), 100);
        assert!((mono[0] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn wav_source_streams_whole_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mono.wav");
        write_wav(&path, 1, 1024 * 3 + 10);

        let (tx, rx) = mpsc::channel();
        let mut source = WavFileSource::new(&path).with_realtime(false);
        let _stream = source
            .open(1024, Box::new(move |frame| tx.send(frame.len()).unwrap()))
            .unwrap();

        let lengths: Vec<usize> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(lengths, vec![1024, 1024, 1024]);
    }

    #[test]
    fn missing_wav_is_capture_unavailable() {
        let mut source = WavFileSource::new("/definitely/not/here.wav");
        let err = source.open(1024, Box::new(|_| {})).err().unwrap();
        assert!(matches!(err, LightBoardError::CaptureUnavailable(_)));
    }
}
