//! Microphone capture.
//!
//! cpal streams are not `Send`, so the stream lives on a dedicated thread
//! that converts whatever the device delivers into fixed 256-sample 16 kHz
//! mono frames and pushes them over a channel in capture order.

use crate::audio_toolkit::audio::device::find_input_device;
use crate::audio_toolkit::audio::resampler::FrameResampler;
use crate::audio_toolkit::{CAPTURE_FRAME_SAMPLES, CAPTURE_SAMPLE_RATE};
use anyhow::{anyhow, Result};
use cpal::traits::{DeviceTrait, StreamTrait};
use log::info;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Events emitted by the capture thread.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// One fixed-size frame of normalized mono samples.
    Frame(Vec<f32>),
    /// The stream failed; the current recording attempt is over.
    Error(String),
}

/// A running microphone capture. Dropping it stops the stream.
pub struct MicCapture {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl MicCapture {
    /// Open the requested input device (default device when `None`) and
    /// start emitting frames. Fails if no device can be opened; the caller
    /// turns that into a user-facing message.
    pub fn start(
        device_name: Option<String>,
        events: UnboundedSender<CaptureEvent>,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = stop.clone();
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<()>>();

        let thread = thread::spawn(move || {
            let stream = match build_stream(device_name.as_deref(), events) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(anyhow!("failed to start input stream: {e}")));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            while !thread_stop.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(50));
            }
            drop(stream);
        });

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop,
                thread: Some(thread),
            }),
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread.join();
                Err(anyhow!("capture thread exited before the stream started"))
            }
        }
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn build_stream(
    device_name: Option<&str>,
    events: UnboundedSender<CaptureEvent>,
) -> Result<cpal::Stream> {
    let device = find_input_device(device_name)?;
    info!(
        "Capturing from input device: {}",
        device.name().unwrap_or_else(|_| "<unknown>".to_string())
    );

    let supported = device.default_input_config()?;
    let channels = supported.channels() as usize;
    let in_rate = supported.sample_rate().0 as usize;
    let config: cpal::StreamConfig = supported.config();

    let mut resampler = FrameResampler::new(
        in_rate,
        CAPTURE_SAMPLE_RATE as usize,
        CAPTURE_FRAME_SAMPLES,
    );

    let err_events = events.clone();
    let err_fn = move |e: cpal::StreamError| {
        let _ = err_events.send(CaptureEvent::Error(format!("input stream error: {e}")));
    };

    let stream = match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let mono = mix_to_mono(data, channels);
                emit_frames(&mut resampler, &mono, &events);
            },
            err_fn,
            None,
        )?,
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> = data.iter().map(|&s| s as f32 / 32768.0).collect();
                let mono = mix_to_mono(&samples, channels);
                emit_frames(&mut resampler, &mono, &events);
            },
            err_fn,
            None,
        )?,
        cpal::SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let samples: Vec<f32> =
                    data.iter().map(|&s| (s as f32 - 32768.0) / 32768.0).collect();
                let mono = mix_to_mono(&samples, channels);
                emit_frames(&mut resampler, &mono, &events);
            },
            err_fn,
            None,
        )?,
        other => return Err(anyhow!("unsupported input sample format: {other:?}")),
    };

    Ok(stream)
}

fn emit_frames(
    resampler: &mut FrameResampler,
    mono: &[f32],
    events: &UnboundedSender<CaptureEvent>,
) {
    resampler.push(mono, |frame| {
        let _ = events.send(CaptureEvent::Frame(frame.to_vec()));
    });
}

fn mix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixes_stereo_down_to_mono() {
        let interleaved = [0.5, -0.5, 1.0, 0.0, -1.0, -1.0];
        assert_eq!(mix_to_mono(&interleaved, 2), vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn mono_input_passes_through() {
        let samples = [0.1, 0.2, 0.3];
        assert_eq!(mix_to_mono(&samples, 1), samples.to_vec());
    }
}
