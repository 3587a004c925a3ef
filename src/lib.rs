pub mod app;
pub mod audio_toolkit;
pub mod cli;
pub mod connector;
pub mod playback;
pub mod realtime;
pub mod settings;
pub mod transcript;

pub use cli::CliArgs;

pub async fn run(args: CliArgs) -> anyhow::Result<()> {
    app::run(args).await
}
