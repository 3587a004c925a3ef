use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone, Default)]
#[command(name = "chatterbox", about = "Chatterbox - realtime voice conversation")]
pub struct CliArgs {
    /// Path to the settings JSON file
    #[arg(long)]
    pub settings: Option<PathBuf>,

    /// List audio devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Input device name (overrides settings)
    #[arg(long)]
    pub input_device: Option<String>,

    /// Output device name (overrides settings)
    #[arg(long)]
    pub output_device: Option<String>,

    /// Model id to try, repeatable in fallback order (overrides settings)
    #[arg(long)]
    pub model: Vec<String>,

    /// Do not start recording automatically after connecting
    #[arg(long)]
    pub no_auto_record: bool,

    /// Write the captured microphone audio to a WAV file on exit
    #[arg(long)]
    pub dump_capture: Option<PathBuf>,

    /// Enable debug mode with verbose logging
    #[arg(long)]
    pub debug: bool,
}
