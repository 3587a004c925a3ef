pub mod audio;

pub use audio::{list_input_devices, list_output_devices, CaptureEvent, FrameResampler, MicCapture};

/// Sample rate of frames sent to the remote service, mono.
pub const CAPTURE_SAMPLE_RATE: u32 = 16_000;

/// Samples per emitted capture frame (16 ms at 16 kHz).
pub const CAPTURE_FRAME_SAMPLES: usize = 256;

/// Sample rate of reply audio received from the remote service, mono.
pub const PLAYBACK_SAMPLE_RATE: u32 = 24_000;

pub fn get_cpal_host() -> cpal::Host {
    cpal::default_host()
}
