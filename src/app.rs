//! Top-level session wiring.
//!
//! Every collaborator feeds one inbound queue: capture frames, channel
//! events, connector status, and user commands all arrive as `AppEvent`s,
//! and all state transitions happen on this single event loop. The audio
//! threads never touch session state directly.

use crate::audio_toolkit::audio::save_wav_file;
use crate::audio_toolkit::{
    list_input_devices, list_output_devices, CaptureEvent, MicCapture, CAPTURE_SAMPLE_RATE,
};
use crate::cli::CliArgs;
use crate::connector::{ConnectorConfig, ConnectorStatus, FailureClass, SessionConnector};
use crate::playback::{PlaybackOutput, PlaybackScheduler};
use crate::realtime::{self, ChannelEvent, LiveOptions, RealtimeChannel, Speaker};
use crate::settings::{collect_credentials, load_settings, validate_api_key, AppSettings};
use crate::transcript::{TranscriptEntry, TranscriptLog};
use anyhow::{anyhow, Result};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// Lifecycle of the logical conversation session. Exactly one is live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Open,
    Closed { reason: String },
    Failed,
}

/// Everything the event loop reacts to, merged onto one queue.
enum AppEvent {
    Command(UserCommand),
    Capture(CaptureEvent),
    Channel { generation: u64, event: ChannelEvent },
    Status(ConnectorStatus),
    StdinClosed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum UserCommand {
    Start,
    Stop,
    Reset,
    Retry,
    Quit,
    Help,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<UserCommand> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match trimmed.to_ascii_lowercase().as_str() {
        "start" => UserCommand::Start,
        "stop" => UserCommand::Stop,
        "reset" => UserCommand::Reset,
        "retry" => UserCommand::Retry,
        "quit" | "exit" | "q" => UserCommand::Quit,
        "help" | "?" => UserCommand::Help,
        _ => UserCommand::Unknown(trimmed.to_string()),
    })
}

/// What to do with a capture frame, given the session it would ride on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameAction {
    Send,
    DropSilently,
    DropWithNotice,
}

/// Gates frames on recording and channel state. Frames that arrive while
/// the channel is down are dropped, never buffered, with exactly one notice
/// per outage.
struct FrameGate {
    dropped: u64,
}

impl FrameGate {
    fn new() -> Self {
        Self { dropped: 0 }
    }

    fn admit(&mut self, recording: bool, channel_open: bool) -> FrameAction {
        if !recording {
            // Stray frame from a capture thread that is already stopping.
            return FrameAction::DropSilently;
        }
        if channel_open {
            return FrameAction::Send;
        }
        self.dropped += 1;
        if self.dropped == 1 {
            FrameAction::DropWithNotice
        } else {
            FrameAction::DropSilently
        }
    }

    fn reset(&mut self) {
        self.dropped = 0;
    }
}

struct VoiceApp {
    settings: AppSettings,
    connector: SessionConnector,
    scheduler: PlaybackScheduler,
    transcript: TranscriptLog,
    events: UnboundedSender<AppEvent>,
    state: SessionState,
    recording: bool,
    capture: Option<MicCapture>,
    channel: Option<RealtimeChannel>,
    /// Bumped on every successful connect; events from older channels are
    /// ignored so a reset cannot interleave stale audio into a new session.
    generation: u64,
    gate: FrameGate,
    auto_record: bool,
    dump_capture: Option<PathBuf>,
    captured: Vec<f32>,
}

pub async fn run(args: CliArgs) -> Result<()> {
    if args.list_devices {
        println!("Input devices:");
        for name in list_input_devices()? {
            println!("  {name}");
        }
        println!("Output devices:");
        for name in list_output_devices()? {
            println!("  {name}");
        }
        return Ok(());
    }

    let mut settings = load_settings(args.settings.as_deref())?;
    if let Some(device) = args.input_device {
        settings.selected_microphone = Some(device);
    }
    if let Some(device) = args.output_device {
        settings.selected_output_device = Some(device);
    }
    if !args.model.is_empty() {
        settings.models = args.model;
    }

    let credentials = collect_credentials();
    if credentials.is_empty() {
        return Err(anyhow!(
            "no credentials found: set GEMINI_API_KEY or GEMINI_API_KEY_1, GEMINI_API_KEY_2, ..."
        ));
    }
    info!("loaded {} credential(s)", credentials.len());
    for (index, key) in credentials.iter().enumerate() {
        if let Err(reason) = validate_api_key(key) {
            warn!("credential #{} looks suspicious: {}", index + 1, reason);
        }
    }

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    spawn_stdin_task(events_tx.clone());

    let (status_tx, mut status_rx) = mpsc::unbounded_channel();
    let status_forward = events_tx.clone();
    tokio::spawn(async move {
        while let Some(status) = status_rx.recv().await {
            if status_forward.send(AppEvent::Status(status)).is_err() {
                break;
            }
        }
    });

    let connector = SessionConnector::new(
        credentials,
        settings.models.clone(),
        ConnectorConfig {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            retry_delay: Duration::from_millis(settings.retry_delay_ms),
        },
    )?
    .with_status(status_tx);

    let output = PlaybackOutput::open(settings.selected_output_device.as_deref())?;
    let scheduler = PlaybackScheduler::new();
    output.attach(&scheduler)?;

    let transcript = TranscriptLog::new(settings.transcript_path.clone());

    let mut app = VoiceApp {
        settings,
        connector,
        scheduler,
        transcript,
        events: events_tx,
        state: SessionState::Idle,
        recording: false,
        capture: None,
        channel: None,
        generation: 0,
        gate: FrameGate::new(),
        auto_record: !args.no_auto_record,
        dump_capture: args.dump_capture,
        captured: Vec::new(),
    };

    app.connect_session().await;
    app.event_loop(events_rx).await;
    app.shutdown()
}

fn spawn_stdin_task(tx: UnboundedSender<AppEvent>) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(command) = parse_command(&line) {
                        if tx.send(AppEvent::Command(command)).is_err() {
                            break;
                        }
                    }
                }
                Ok(None) | Err(_) => {
                    let _ = tx.send(AppEvent::StdinClosed);
                    break;
                }
            }
        }
    });
}

impl VoiceApp {
    async fn event_loop(&mut self, mut rx: UnboundedReceiver<AppEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                AppEvent::Command(command) => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                AppEvent::Capture(event) => self.handle_capture(event),
                AppEvent::Channel { generation, event } => {
                    if generation == self.generation {
                        self.handle_channel(event);
                    } else {
                        debug!("ignoring event from a previous session");
                    }
                }
                AppEvent::Status(status) => self.handle_status(status),
                AppEvent::StdinClosed => break,
            }
        }
    }

    async fn connect_session(&mut self) {
        self.state = SessionState::Connecting;
        let options = LiveOptions {
            voice: self.settings.voice.clone(),
            system_instruction: self.settings.system_instruction.clone(),
            search_grounding: self.settings.search_grounding,
        };

        let result = self
            .connector
            .connect_with(|credential, model| {
                let options = options.clone();
                async move { realtime::connect(&credential, &model, &options).await }
            })
            .await;

        match result {
            Ok((channel, channel_rx)) => {
                self.generation += 1;
                self.forward_channel_events(channel_rx);
                self.channel = Some(channel);
                self.state = SessionState::Open;
                self.gate.reset();
                if self.auto_record && !self.recording {
                    self.start_recording();
                }
            }
            Err(e) => {
                self.state = SessionState::Failed;
                error!("session connect failed: {e:#}");
                self.status("Could not connect with any credential/model pair. Type 'retry' to try again.");
            }
        }
    }

    fn forward_channel_events(&self, mut channel_rx: UnboundedReceiver<ChannelEvent>) {
        let tx = self.events.clone();
        let generation = self.generation;
        tokio::spawn(async move {
            while let Some(event) = channel_rx.recv().await {
                if tx.send(AppEvent::Channel { generation, event }).is_err() {
                    break;
                }
            }
        });
    }

    async fn handle_command(&mut self, command: UserCommand) -> bool {
        match command {
            UserCommand::Start => self.start_recording(),
            UserCommand::Stop => self.stop_recording(),
            UserCommand::Reset => self.reset_session().await,
            UserCommand::Retry => {
                if self.state == SessionState::Failed {
                    self.connector.advance_for_retry();
                    self.connect_session().await;
                } else {
                    self.status("Nothing to retry; the session is not in a failed state.");
                }
            }
            UserCommand::Quit => return false,
            UserCommand::Help => {
                println!("Commands: start, stop, reset, retry, quit");
            }
            UserCommand::Unknown(input) => {
                println!("Unknown command '{input}'. Commands: start, stop, reset, retry, quit");
            }
        }
        true
    }

    fn start_recording(&mut self) {
        if self.recording {
            return;
        }
        self.status("Requesting microphone access...");

        let (capture_tx, mut capture_rx) = mpsc::unbounded_channel();
        let tx = self.events.clone();
        tokio::spawn(async move {
            while let Some(event) = capture_rx.recv().await {
                if tx.send(AppEvent::Capture(event)).is_err() {
                    break;
                }
            }
        });

        match MicCapture::start(self.settings.selected_microphone.clone(), capture_tx) {
            Ok(capture) => {
                self.capture = Some(capture);
                self.recording = true;
                self.status("Recording... capturing PCM frames.");
            }
            Err(e) => {
                error!("failed to start capture: {e:#}");
                self.status("Microphone unavailable. Recording not started.");
            }
        }
    }

    fn stop_recording(&mut self) {
        if !self.recording && self.capture.is_none() {
            return;
        }
        self.recording = false;
        // Dropping the capture stops the stream.
        self.capture = None;
        self.status("Recording stopped. Type 'start' to begin again.");
    }

    async fn reset_session(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.close();
        }
        self.scheduler.reset();
        for entry in self.transcript.finalize_turn() {
            self.print_entry(&entry);
        }
        self.state = SessionState::Idle;
        self.status("Session cleared.");
        self.connect_session().await;
    }

    fn handle_capture(&mut self, event: CaptureEvent) {
        match event {
            CaptureEvent::Frame(frame) => {
                if self.recording && self.dump_capture.is_some() {
                    self.captured.extend_from_slice(&frame);
                }
                let channel_open = matches!(self.state, SessionState::Open)
                    && self.channel.as_ref().map(|c| c.is_open()).unwrap_or(false);
                match self.gate.admit(self.recording, channel_open) {
                    FrameAction::Send => {
                        if let Some(channel) = &self.channel {
                            channel.send_frame(&frame);
                        }
                    }
                    FrameAction::DropWithNotice => {
                        self.status("Session is not open; microphone audio is being dropped.");
                    }
                    FrameAction::DropSilently => {}
                }
            }
            CaptureEvent::Error(detail) => {
                error!("capture error: {detail}");
                self.stop_recording();
                self.status("Microphone error. Recording stopped.");
            }
        }
    }

    fn handle_channel(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Opened => self.status("Opened"),
            ChannelEvent::AudioChunk(bytes) => {
                // One bad chunk never disturbs the cursor or later chunks.
                if let Err(e) = self.scheduler.enqueue(&bytes) {
                    warn!("dropping undecodable audio chunk: {e:#}");
                }
            }
            ChannelEvent::Transcript { speaker, text, .. } => {
                self.transcript.push_fragment(speaker, &text);
            }
            ChannelEvent::Interrupted => {
                self.scheduler.interrupt();
                // The reply was cut off; keep what was said so far.
                if let Some(entry) = self.transcript.finalize(Speaker::Model) {
                    self.print_entry(&entry);
                }
            }
            ChannelEvent::TurnComplete => {
                for entry in self.transcript.finalize_turn() {
                    self.print_entry(&entry);
                }
            }
            ChannelEvent::Closed { reason } => {
                self.channel = None;
                self.state = SessionState::Closed {
                    reason: reason.clone(),
                };
                self.status(&format!("Close: {reason}"));
            }
        }
    }

    fn handle_status(&mut self, status: ConnectorStatus) {
        match status {
            ConnectorStatus::Attempting {
                credential_index,
                model,
            } => {
                self.status(&format!(
                    "Connecting with key #{} / {model}...",
                    credential_index + 1
                ));
            }
            ConnectorStatus::AttemptFailed {
                credential_index,
                model,
                class,
                ..
            } => {
                // Raw error detail stays in the logs; the user gets the class.
                let hint = match class {
                    FailureClass::Credential => "credential exhausted",
                    FailureClass::Availability => "model unavailable",
                };
                self.status(&format!(
                    "Attempt with key #{} / {model} failed ({hint}).",
                    credential_index + 1
                ));
            }
            ConnectorStatus::Connected {
                credential_index,
                model,
            } => {
                self.status(&format!(
                    "Connected with key #{} / {model}.",
                    credential_index + 1
                ));
            }
            ConnectorStatus::Exhausted { attempts } => {
                self.status(&format!("All {attempts} connection attempts failed."));
            }
        }
    }

    fn status(&self, message: &str) {
        info!("{message}");
        println!("* {message}");
    }

    fn print_entry(&self, entry: &TranscriptEntry) {
        let label = match entry.speaker {
            Speaker::User => "you",
            Speaker::Model => "model",
        };
        println!("[{label}] {}", entry.text);
    }

    fn shutdown(self) -> Result<()> {
        if let Some(path) = &self.dump_capture {
            if self.captured.is_empty() {
                info!("no captured audio to dump");
            } else {
                save_wav_file(path, &self.captured, CAPTURE_SAMPLE_RATE)?;
                println!("* Saved captured audio to {}", path.display());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_commands() {
        assert_eq!(parse_command("start"), Some(UserCommand::Start));
        assert_eq!(parse_command("  STOP  "), Some(UserCommand::Stop));
        assert_eq!(parse_command("reset"), Some(UserCommand::Reset));
        assert_eq!(parse_command("retry"), Some(UserCommand::Retry));
        assert_eq!(parse_command("q"), Some(UserCommand::Quit));
        assert_eq!(parse_command("exit"), Some(UserCommand::Quit));
        assert_eq!(parse_command("?"), Some(UserCommand::Help));
    }

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse_command(""), None);
        assert_eq!(parse_command("   "), None);
    }

    #[test]
    fn unknown_input_is_preserved_for_the_hint() {
        assert_eq!(
            parse_command("frobnicate"),
            Some(UserCommand::Unknown("frobnicate".to_string()))
        );
    }

    #[test]
    fn frames_while_closed_are_dropped_with_one_notice() {
        let mut gate = FrameGate::new();

        let actions: Vec<FrameAction> =
            (0..10).map(|_| gate.admit(true, false)).collect();

        assert_eq!(actions[0], FrameAction::DropWithNotice);
        assert!(actions[1..]
            .iter()
            .all(|a| *a == FrameAction::DropSilently));
    }

    #[test]
    fn frames_flow_while_recording_on_an_open_channel() {
        let mut gate = FrameGate::new();
        assert_eq!(gate.admit(true, true), FrameAction::Send);
        assert_eq!(gate.admit(true, true), FrameAction::Send);
    }

    #[test]
    fn frames_after_stop_are_dropped_without_notice() {
        let mut gate = FrameGate::new();
        assert_eq!(gate.admit(false, true), FrameAction::DropSilently);
        assert_eq!(gate.admit(false, false), FrameAction::DropSilently);
    }

    #[test]
    fn gate_notices_again_after_a_reconnect() {
        let mut gate = FrameGate::new();
        assert_eq!(gate.admit(true, false), FrameAction::DropWithNotice);
        gate.reset();
        assert_eq!(gate.admit(true, false), FrameAction::DropWithNotice);
    }
}
