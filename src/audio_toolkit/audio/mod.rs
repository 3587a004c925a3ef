// Re-export all audio components
pub mod device;
pub mod recorder;
pub mod resampler;
pub mod utils;

pub use device::{list_input_devices, list_output_devices};
pub use recorder::{CaptureEvent, MicCapture};
pub use resampler::FrameResampler;
pub use utils::{f32_to_pcm16_bytes, pcm16_bytes_to_f32, save_wav_file};
