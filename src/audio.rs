//! Audio device layer
//!
//! Capture and playback sit behind two small traits so the pipeline can run
//! against PulseAudio (feature `pulse`) or headless stand-ins. Devices are
//! opened and closed on the worker thread that uses them.

use crate::audio_seg::{Segmenter, Utterance, FRAME_SAMPLES};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum AudioError {
    #[error("No audio device available")]
    NoDevice,

    #[error("Device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AudioError>;

/// Blocking source of 16 kHz mono PCM
pub trait AudioSource {
    /// Fill `frame` completely, blocking until enough audio is available.
    fn read_frame(&mut self, frame: &mut [i16]) -> Result<()>;
}

/// Output device. `is_playing` is polled from the playback thread and may
/// do a bounded amount of blocking work per call.
pub trait AudioSink {
    fn play(&mut self, pcm: &[i16], sample_rate: u32) -> Result<()>;

    fn is_playing(&mut self) -> bool;

    fn stop(&mut self);
}

/// Opens a capture device. Called on the capture thread, once per start.
pub type SourceFactory = Arc<dyn Fn() -> Result<Box<dyn AudioSource>> + Send + Sync>;

/// Opens the playback device. Called once, on the playback thread.
pub type SinkFactory = Box<dyn FnOnce() -> Result<Box<dyn AudioSink>> + Send>;

/// Sink that plays nothing but takes as long as the clip would.
#[derive(Debug, Default)]
pub struct NullSink {
    until: Option<Instant>,
}

impl AudioSink for NullSink {
    fn play(&mut self, pcm: &[i16], sample_rate: u32) -> Result<()> {
        let secs = pcm.len() as f64 / f64::from(sample_rate.max(1));
        self.until = Some(Instant::now() + Duration::from_secs_f64(secs));
        Ok(())
    }

    fn is_playing(&mut self) -> bool {
        self.until.is_some_and(|t| Instant::now() < t)
    }

    fn stop(&mut self) {
        self.until = None;
    }
}

/// Microphone reader thread feeding a [`Segmenter`].
pub struct CaptureWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl CaptureWorker {
    pub fn spawn(
        open: SourceFactory,
        segmenter: Arc<Segmenter>,
        tx: mpsc::UnboundedSender<Utterance>,
    ) -> Result<Self> {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = std::thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || run_capture(open, segmenter, tx, flag))?;
        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// Ask the thread to exit after its current read. Does not wait.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
            && self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for CaptureWorker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        // Thread will exit when it sees the flag; the device is released there
    }
}

fn run_capture(
    open: SourceFactory,
    segmenter: Arc<Segmenter>,
    tx: mpsc::UnboundedSender<Utterance>,
    running: Arc<AtomicBool>,
) {
    let mut source = match open() {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to open capture device: {}", e);
            running.store(false, Ordering::Relaxed);
            return;
        }
    };
    info!("Audio capture started");

    let mut frame = vec![0i16; FRAME_SAMPLES];
    while running.load(Ordering::Relaxed) {
        if let Err(e) = source.read_frame(&mut frame) {
            error!("Audio read error: {}", e);
            break;
        }
        if let Some(utterance) = segmenter.process(&frame) {
            debug!(
                ms = utterance.duration_ms(),
                reason = ?utterance.close_reason,
                "utterance committed"
            );
            if tx.send(utterance).is_err() {
                warn!("Utterance receiver dropped, stopping capture");
                break;
            }
        }
    }

    running.store(false, Ordering::Relaxed);
    drop(source);
    info!("Audio capture stopped, device released");
}

#[cfg(feature = "pulse")]
pub mod pulse {
    //! PulseAudio backend using the simple API. Audio is 16-bit little-endian
    //! mono PCM.

    use super::{AudioError, AudioSink, AudioSource, Result};
    use crate::audio_seg::{i16_slice_to_u8, u8_to_i16_slice, SAMPLE_RATE};
    use libpulse_binding::sample::{Format, Spec};
    use libpulse_binding::stream::Direction;
    use libpulse_simple_binding::Simple;
    use tracing::{info, warn};

    fn spec(rate: u32) -> Spec {
        Spec {
            format: Format::S16le,
            channels: 1,
            rate,
        }
    }

    pub struct PulseSource {
        simple: Simple,
        bytes: Vec<u8>,
    }

    impl PulseSource {
        /// Open `device`, falling back to the default input when it fails.
        pub fn open(app_name: &str, device: Option<&str>) -> Result<Self> {
            let open = |dev: Option<&str>| {
                Simple::new(
                    None,
                    app_name,
                    Direction::Record,
                    dev,
                    "record",
                    &spec(SAMPLE_RATE),
                    None,
                    None,
                )
            };
            let simple = match device {
                Some(name) => match open(Some(name)) {
                    Ok(s) => {
                        info!("Recording from device: {}", name);
                        s
                    }
                    Err(e) => {
                        warn!("Failed to open {}: {}. Trying default device", name, e);
                        open(None).map_err(|e| AudioError::Device(e.to_string()))?
                    }
                },
                None => open(None).map_err(|e| AudioError::Device(e.to_string()))?,
            };
            Ok(Self {
                simple,
                bytes: Vec::new(),
            })
        }
    }

    impl AudioSource for PulseSource {
        fn read_frame(&mut self, frame: &mut [i16]) -> Result<()> {
            self.bytes.resize(frame.len() * 2, 0);
            self.simple
                .read(&mut self.bytes)
                .map_err(|e| AudioError::Device(e.to_string()))?;
            frame.copy_from_slice(&u8_to_i16_slice(&self.bytes));
            Ok(())
        }
    }

    /// Playback writes one chunk per `is_playing` poll; the blocking write
    /// paces the loop once the server buffer is full.
    pub struct PulseSink {
        simple: Simple,
        rate: u32,
        pcm: Vec<i16>,
        pos: usize,
        draining: bool,
    }

    impl PulseSink {
        pub fn open(app_name: &str, rate: u32) -> Result<Self> {
            let simple = Simple::new(
                None,
                app_name,
                Direction::Playback,
                None,
                "playback",
                &spec(rate),
                None,
                None,
            )
            .map_err(|e| AudioError::Device(e.to_string()))?;
            Ok(Self {
                simple,
                rate,
                pcm: Vec::new(),
                pos: 0,
                draining: false,
            })
        }

        fn chunk_samples(&self) -> usize {
            (self.rate / 10).max(1) as usize
        }
    }

    impl AudioSink for PulseSink {
        fn play(&mut self, pcm: &[i16], sample_rate: u32) -> Result<()> {
            if sample_rate != self.rate {
                warn!(
                    "Clip rate {} differs from device rate {}",
                    sample_rate, self.rate
                );
            }
            self.pcm = pcm.to_vec();
            self.pos = 0;
            self.draining = true;
            Ok(())
        }

        fn is_playing(&mut self) -> bool {
            if self.pos < self.pcm.len() {
                let end = (self.pos + self.chunk_samples()).min(self.pcm.len());
                let bytes = i16_slice_to_u8(&self.pcm[self.pos..end]);
                if let Err(e) = self.simple.write(&bytes) {
                    warn!("Playback write failed: {}", e);
                    self.pos = self.pcm.len();
                    return false;
                }
                self.pos = end;
                return true;
            }
            if self.draining {
                self.draining = false;
                if let Err(e) = self.simple.drain() {
                    warn!("Playback drain failed: {}", e);
                }
            }
            false
        }

        fn stop(&mut self) {
            self.pos = self.pcm.len();
            self.draining = false;
            if let Err(e) = self.simple.flush() {
                warn!("Playback flush failed: {}", e);
            }
        }
    }
}
