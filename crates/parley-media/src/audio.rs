use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;

use tracing::{debug, error, info};

use crate::error::MediaError;
use crate::media::LocalMedia;

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
        }
    }
}

/// Live microphone capture.
///
/// cpal streams are not `Send` on every platform, so the stream is built on
/// and owned by a dedicated thread that drops it when told to stop.
pub struct AudioCapture {
    active: Arc<AtomicBool>,
    peak: Arc<AtomicU32>,
    stop_tx: Option<mpsc::Sender<()>>,
}

impl AudioCapture {
    /// Open the default input device. Blocks until the stream is playing or
    /// has failed to start.
    pub fn start(config: &AudioConfig) -> Result<Self, MediaError> {
        let active = Arc::new(AtomicBool::new(true));
        let peak = Arc::new(AtomicU32::new(0));
        let (ready_tx, ready_rx) = mpsc::channel::<Result<(), MediaError>>();
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let stream_config = cpal::StreamConfig {
            channels: config.channels,
            sample_rate: cpal::SampleRate(config.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let thread_active = active.clone();
        let thread_peak = peak.clone();

        thread::Builder::new()
            .name("parley-capture".into())
            .spawn(move || match open_input(&stream_config, thread_active, thread_peak) {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    // Either an explicit stop or the capture handle being dropped.
                    let _ = stop_rx.recv();
                    drop(stream);
                    debug!("Audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| MediaError::Device(e.to_string()))?;

        ready_rx
            .recv()
            .map_err(|_| MediaError::Device("capture thread exited".into()))??;

        Ok(Self {
            active,
            peak,
            stop_tx: Some(stop_tx),
        })
    }

    /// Peak sample amplitude of the most recent buffer, 0.0 to 1.0.
    pub fn level(&self) -> f32 {
        f32::from_bits(self.peak.load(Ordering::Relaxed))
    }
}

impl LocalMedia for AudioCapture {
    fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
    }

    fn is_live(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_input(
    config: &cpal::StreamConfig,
    active: Arc<AtomicBool>,
    peak: Arc<AtomicU32>,
) -> Result<cpal::Stream, MediaError> {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaError::NoInputDevice)?;

    info!(device = ?device.name(), "Using input device");

    let stream = device
        .build_input_stream(
            config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                if !active.load(Ordering::Relaxed) {
                    return;
                }
                let level = data.iter().fold(0.0f32, |max, s| max.max(s.abs()));
                peak.store(level.to_bits(), Ordering::Relaxed);
            },
            move |err| {
                error!("Audio input error: {err}");
            },
            None,
        )
        .map_err(|e| MediaError::Stream(e.to_string()))?;

    stream
        .play()
        .map_err(|e| MediaError::Stream(e.to_string()))?;

    debug!("Audio capture started");
    Ok(stream)
}
