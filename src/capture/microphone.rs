//! cpal microphone with an energy-threshold endpointer.
//!
//! Audio is downmixed and resampled to 16 kHz mono, cut into 30 ms frames,
//! and compared against a threshold set by ambient calibration. Recording
//! starts at the first loud frame (with a short pre-roll) and ends after a
//! pause or at the phrase limit; the result goes to the transcriber.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Stream, StreamConfig};
use tracing::{debug, error, info};

use super::transcribe::{WhisperTranscriber, SAMPLE_RATE};
use super::{CaptureError, Microphone, Transcript};
use crate::config::ConfigHandle;

/// 30 ms at 16 kHz.
const FRAME_SAMPLES: usize = 480;
const FRAME_DURATION: Duration = Duration::from_millis(30);
const POLL_INTERVAL: Duration = Duration::from_millis(30);
/// Silence that ends a phrase.
const PAUSE: Duration = Duration::from_millis(800);
/// Frames kept before speech onset so the first syllable is not clipped.
const PRE_ROLL_FRAMES: usize = 10;
const MIN_THRESHOLD: f32 = 0.005;
const DEFAULT_THRESHOLD: f32 = 0.015;
const AMBIENT_FACTOR: f32 = 2.5;

/// Mean absolute amplitude of a frame.
pub fn frame_energy(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    frame.iter().map(|s| s.abs()).sum::<f32>() / frame.len() as f32
}

/// List available input device names.
pub fn list_devices() -> Vec<String> {
    let host = cpal::default_host();
    let mut names = Vec::new();
    if let Ok(devices) = host.input_devices() {
        for dev in devices {
            if let Ok(name) = dev.name() {
                names.push(name);
            }
        }
    }
    names
}

fn resolve_device(device_name: Option<&str>) -> Result<(cpal::Device, StreamConfig), CaptureError> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .input_devices()
            .map_err(|e| CaptureError::Device(format!("Failed to enumerate input devices: {e}")))?
            .find(|d| d.name().map(|n| n == name).unwrap_or(false))
            .ok_or_else(|| CaptureError::Device(format!("Input device not found: {name}")))?,
        None => host
            .default_input_device()
            .ok_or_else(|| CaptureError::Device("No default input device available".into()))?,
    };

    let default_config = device
        .default_input_config()
        .map_err(|e| CaptureError::Device(format!("Failed to get default input config: {e}")))?;
    let stream_config = StreamConfig {
        channels: default_config.channels(),
        sample_rate: default_config.sample_rate(),
        buffer_size: cpal::BufferSize::Default,
    };
    Ok((device, stream_config))
}

/// Simple linear resampler on mono f32 samples.
fn resample_linear(input: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate {
        return input.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((input.len() as f64) / ratio).floor() as usize;
    let mut output = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 * ratio;
        let idx0 = src_idx.floor() as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = input.get(idx0).copied().unwrap_or(0.0);
        let s1 = input.get(idx0 + 1).copied().unwrap_or(s0);
        output.push(s0 + frac * (s1 - s0));
    }
    output
}

/// Down-mix interleaved audio to mono by averaging channels.
fn to_mono(samples: &[f32], channels: u16) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    let ch = channels as usize;
    samples
        .chunks_exact(ch)
        .map(|frame| frame.iter().sum::<f32>() / ch as f32)
        .collect()
}

/// Open the input stream; samples accumulate in the returned buffer.
fn open_input(device_name: Option<&str>) -> Result<(Stream, Arc<Mutex<Vec<f32>>>), CaptureError> {
    let (device, stream_config) = resolve_device(device_name)?;
    let native_rate = stream_config.sample_rate.0;
    let channels = stream_config.channels;
    let buffer = Arc::new(Mutex::new(Vec::new()));

    let sink = buffer.clone();
    let stream = device
        .build_input_stream(
            &stream_config,
            move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                let mono = to_mono(data, channels);
                let resampled = resample_linear(&mono, native_rate, SAMPLE_RATE);
                sink.lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&resampled);
            },
            move |err| error!("Audio input stream error: {}", err),
            None,
        )
        .map_err(|e| CaptureError::Device(format!("Failed to build input stream: {e}")))?;
    stream
        .play()
        .map_err(|e| CaptureError::Device(format!("Failed to start input stream: {e}")))?;
    Ok((stream, buffer))
}

fn drain(buffer: &Mutex<Vec<f32>>) -> Vec<f32> {
    std::mem::take(&mut *buffer.lock().unwrap_or_else(PoisonError::into_inner))
}

/// Endpointing state for one phrase.
struct Endpointer {
    threshold: f32,
    pre_roll: VecDeque<Vec<f32>>,
    recorded: Vec<f32>,
    onset: Option<Instant>,
    silence: Duration,
}

impl Endpointer {
    fn new(threshold: f32) -> Self {
        Self {
            threshold,
            pre_roll: VecDeque::with_capacity(PRE_ROLL_FRAMES),
            recorded: Vec::new(),
            onset: None,
            silence: Duration::ZERO,
        }
    }

    fn push_frame(&mut self, frame: Vec<f32>) {
        let loud = frame_energy(&frame) > self.threshold;
        if self.onset.is_none() {
            if loud {
                self.onset = Some(Instant::now());
                for earlier in self.pre_roll.drain(..) {
                    self.recorded.extend_from_slice(&earlier);
                }
                self.recorded.extend_from_slice(&frame);
            } else {
                if self.pre_roll.len() == PRE_ROLL_FRAMES {
                    self.pre_roll.pop_front();
                }
                self.pre_roll.push_back(frame);
            }
            return;
        }
        self.recorded.extend_from_slice(&frame);
        if loud {
            self.silence = Duration::ZERO;
        } else {
            self.silence += FRAME_DURATION;
        }
    }

    fn phrase_done(&self, phrase_limit: Duration) -> bool {
        match self.onset {
            Some(onset) => self.silence >= PAUSE || onset.elapsed() >= phrase_limit,
            None => false,
        }
    }
}

pub struct CpalMicrophone {
    config: ConfigHandle,
    transcriber: WhisperTranscriber,
    threshold: Mutex<f32>,
}

impl CpalMicrophone {
    pub fn new(config: ConfigHandle) -> Self {
        Self {
            transcriber: WhisperTranscriber::new(config.clone()),
            config,
            threshold: Mutex::new(DEFAULT_THRESHOLD),
        }
    }

    fn device_name(&self) -> Option<String> {
        self.config.snapshot().capture.input_device
    }

    fn threshold(&self) -> f32 {
        *self.threshold.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Microphone for CpalMicrophone {
    fn calibrate(&self, duration: Duration) -> Result<(), CaptureError> {
        if duration.is_zero() {
            return Ok(());
        }
        let (stream, buffer) = open_input(self.device_name().as_deref())?;
        std::thread::sleep(duration);
        drop(stream);

        let ambient = frame_energy(&drain(&buffer));
        let threshold = (ambient * AMBIENT_FACTOR).max(MIN_THRESHOLD);
        *self.threshold.lock().unwrap_or_else(PoisonError::into_inner) = threshold;
        debug!(ambient, threshold, "Calibrated for ambient noise");
        Ok(())
    }

    fn listen(&self, timeout: Duration, phrase_limit: Duration) -> Result<Vec<Transcript>, CaptureError> {
        let (stream, buffer) = open_input(self.device_name().as_deref())?;
        let started = Instant::now();
        let mut endpointer = Endpointer::new(self.threshold());
        let mut pending: Vec<f32> = Vec::new();

        info!("Listening...");
        loop {
            std::thread::sleep(POLL_INTERVAL);
            pending.extend(drain(&buffer));
            while pending.len() >= FRAME_SAMPLES {
                let frame: Vec<f32> = pending.drain(..FRAME_SAMPLES).collect();
                endpointer.push_frame(frame);
            }
            if endpointer.phrase_done(phrase_limit) {
                break;
            }
            if endpointer.onset.is_none() && started.elapsed() >= timeout {
                return Err(CaptureError::Timeout);
            }
        }
        drop(stream);

        debug!(
            samples = endpointer.recorded.len(),
            "Phrase recorded, transcribing"
        );
        self.transcriber.transcribe(&endpointer.recorded)
    }
}
