use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::{AudioSource, CaptureStream, FrameAssembler, FrameCallback};
use crate::{LightBoardError, Result};

/// Default system input device through cpal. Only `f32` input streams are
/// supported.
#[derive(Debug, Default)]
pub struct MicrophoneSource;

impl MicrophoneSource {
    /// Creates a source bound to the host's default input device at open time.
    pub fn new() -> Self {
        Self
    }
}

impl AudioSource for MicrophoneSource {
    fn open(&mut self, frame_size: usize, mut on_frame: FrameCallback) -> Result<Box<dyn CaptureStream>> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| LightBoardError::CaptureUnavailable("no default input device".into()))?;
        let config = device
            .default_input_config()
            .map_err(|err| LightBoardError::CaptureUnavailable(format!("input config: {err}")))?;

        if config.sample_format() != cpal::SampleFormat::F32 {
            return Err(LightBoardError::CaptureUnavailable(format!(
                "unsupported sample format {:?}",
                config.sample_format()
            )));
        }

        tracing::info!(?config, "opening microphone");
        let channels = usize::from(config.channels());
        let active = Arc::new(AtomicBool::new(true));
        let callback_active = active.clone();
        let mut assembler = FrameAssembler::new(frame_size, channels);

        let stream = device
            .build_input_stream(
                &config.into(),
                move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                    if callback_active.load(Ordering::Acquire) {
                        assembler.push_interleaved(data, |frame| on_frame(frame));
                    }
                },
                |err| tracing::warn!(%err, "input stream error"),
                None,
            )
            .map_err(|err| match err {
                cpal::BuildStreamError::DeviceNotAvailable => {
                    LightBoardError::CaptureUnavailable("input device disappeared".into())
                }
                other => LightBoardError::PermissionDenied(format!("input stream: {other}")),
            })?;

        stream
            .play()
            .map_err(|err| LightBoardError::CaptureUnavailable(format!("input stream: {err}")))?;

        Ok(Box::new(MicrophoneStream {
            stream: Some(stream),
            active,
        }))
    }
}

struct MicrophoneStream {
    stream: Option<cpal::Stream>,
    active: Arc<AtomicBool>,
}

impl CaptureStream for MicrophoneStream {
    fn close(&mut self) {
        self.active.store(false, Ordering::Release);
        // Dropping the stream tears down the backend callback thread.
        drop(self.stream.take());
    }
}

impl Drop for MicrophoneStream {
    fn drop(&mut self) {
        self.close();
    }
}
