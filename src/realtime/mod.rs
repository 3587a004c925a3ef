//! Realtime channel to the remote audio service.
//!
//! A successful `connect` yields the channel handle plus a stream of typed
//! inbound events. Outbound frames are fire-and-forget; once the channel is
//! closed they become silent no-ops, so callers gate on their own recording
//! state rather than on the socket.

pub mod protocol;

use crate::audio_toolkit::audio::f32_to_pcm16_bytes;
use crate::audio_toolkit::CAPTURE_SAMPLE_RATE;
use anyhow::{anyhow, Result};
use base64::{engine::general_purpose, Engine as _};
use futures_util::{SinkExt, StreamExt};
use log::{debug, warn};
use protocol::{
    Content, GenerationConfig, MediaChunk, PrebuiltVoiceConfig, RealtimeInput,
    RealtimeInputMessage, ServerMessage, Setup, SetupMessage, SpeechConfig, Tool, VoiceConfig,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};

const LIVE_ENDPOINT: &str =
    "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Who said a transcript fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

/// Inbound events, one per discrete thing the server told us.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The session handshake finished and content may flow.
    Opened,
    /// One encoded reply-audio chunk (PCM16 at the playback rate).
    AudioChunk(Vec<u8>),
    /// A transcript fragment. The wire only carries fragments, so
    /// `is_final` is false here; turn boundaries finalize them downstream.
    Transcript {
        speaker: Speaker,
        text: String,
        is_final: bool,
    },
    /// The user started talking over the reply: drop queued playback.
    Interrupted,
    /// The model finished its turn.
    TurnComplete,
    /// The socket is gone. Playback already queued is unaffected.
    Closed { reason: String },
}

/// Session configuration sent with the setup message.
#[derive(Debug, Clone)]
pub struct LiveOptions {
    pub voice: String,
    pub system_instruction: String,
    pub search_grounding: bool,
}

/// Handle to an open channel. Cheap to use from the event loop; all socket
/// I/O happens on detached reader/writer tasks.
pub struct RealtimeChannel {
    outbound: UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl RealtimeChannel {
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Encode one capture frame and queue it for sending. Does nothing once
    /// the channel is closed.
    pub fn send_frame(&self, frame: &[f32]) {
        if !self.is_open() {
            return;
        }

        let message = RealtimeInputMessage {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    mime_type: format!("audio/pcm;rate={CAPTURE_SAMPLE_RATE}"),
                    data: general_purpose::STANDARD.encode(f32_to_pcm16_bytes(frame)),
                }],
            },
        };

        match serde_json::to_string(&message) {
            Ok(json) => {
                let _ = self.outbound.send(Message::Text(json));
            }
            Err(e) => warn!("failed to encode outbound frame: {e}"),
        }
    }

    /// Close the socket. Queued playback keeps playing; `send_frame` becomes
    /// a no-op immediately.
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.outbound.send(Message::Close(None));
    }
}

/// Open a channel with one credential and model. The caller wraps this in
/// its own attempt timeout; a close or error before the handshake finishes
/// surfaces as a connect failure here.
pub async fn connect(
    credential: &str,
    model: &str,
    options: &LiveOptions,
) -> Result<(RealtimeChannel, UnboundedReceiver<ChannelEvent>)> {
    let url = format!("{LIVE_ENDPOINT}?key={credential}");
    let (socket, _) = connect_async(url).await.map_err(describe_handshake_error)?;
    let (mut sink, mut stream) = socket.split();

    let setup = build_setup(model, options);
    sink.send(Message::Text(serde_json::to_string(&setup)?))
        .await
        .map_err(|e| anyhow!("failed to send setup: {e}"))?;

    loop {
        let message = stream
            .next()
            .await
            .ok_or_else(|| anyhow!("connection closed during setup handshake"))?
            .map_err(|e| anyhow!("handshake failed: {e}"))?;
        match message {
            Message::Text(text) => {
                if setup_is_complete(text.as_bytes()) {
                    break;
                }
            }
            Message::Binary(bytes) => {
                if setup_is_complete(&bytes) {
                    break;
                }
            }
            Message::Close(frame) => {
                let reason = frame
                    .map(|f| f.reason.to_string())
                    .unwrap_or_else(|| "no reason given".to_string());
                return Err(anyhow!("connection closed during setup handshake: {reason}"));
            }
            _ => {}
        }
    }
    debug!("setup acknowledged for {model}");

    let open = Arc::new(AtomicBool::new(true));
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    // Writer: drain the outbound queue into the socket.
    let writer_open = open.clone();
    tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if let Err(e) = sink.send(message).await {
                debug!("outbound send failed: {e}");
                writer_open.store(false, Ordering::SeqCst);
                break;
            }
            if closing {
                break;
            }
        }
    });

    // Reader: translate server messages into channel events.
    let reader_open = open.clone();
    let _ = event_tx.send(ChannelEvent::Opened);
    tokio::spawn(async move {
        let mut reason = String::from("connection closed");
        while let Some(item) = stream.next().await {
            match item {
                Ok(Message::Text(text)) => dispatch_payload(text.as_bytes(), &event_tx),
                Ok(Message::Binary(bytes)) => dispatch_payload(&bytes, &event_tx),
                Ok(Message::Close(frame)) => {
                    if let Some(frame) = frame {
                        if !frame.reason.is_empty() {
                            reason = frame.reason.to_string();
                        }
                    }
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    reason = format!("connection error: {e}");
                    break;
                }
            }
        }
        reader_open.store(false, Ordering::SeqCst);
        let _ = event_tx.send(ChannelEvent::Closed { reason });
    });

    Ok((
        RealtimeChannel {
            outbound: out_tx,
            open,
        },
        event_rx,
    ))
}

fn build_setup(model: &str, options: &LiveOptions) -> SetupMessage {
    let mut tools = Vec::new();
    if options.search_grounding {
        tools.push(Tool::google_search());
    }

    SetupMessage {
        setup: Setup {
            model: format!("models/{model}"),
            generation_config: GenerationConfig {
                response_modalities: vec!["AUDIO".to_string()],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfig {
                        prebuilt_voice_config: PrebuiltVoiceConfig {
                            voice_name: options.voice.clone(),
                        },
                    },
                },
            },
            system_instruction: if options.system_instruction.is_empty() {
                None
            } else {
                Some(Content::text(&options.system_instruction))
            },
            tools,
        },
    }
}

fn setup_is_complete(payload: &[u8]) -> bool {
    matches!(
        serde_json::from_slice::<ServerMessage>(payload),
        Ok(ServerMessage {
            setup_complete: Some(_),
            ..
        })
    )
}

/// Turn one server payload into zero or more events. A bad payload or a bad
/// audio part is dropped with a log line; it never tears the session down.
fn dispatch_payload(payload: &[u8], events: &UnboundedSender<ChannelEvent>) {
    let message: ServerMessage = match serde_json::from_slice(payload) {
        Ok(message) => message,
        Err(e) => {
            warn!("ignoring unparseable server message: {e}");
            return;
        }
    };

    let Some(content) = message.server_content else {
        return;
    };

    if let Some(turn) = content.model_turn {
        for part in turn.parts {
            if let Some(inline) = part.inline_data {
                match general_purpose::STANDARD.decode(inline.data.as_bytes()) {
                    Ok(bytes) => {
                        let _ = events.send(ChannelEvent::AudioChunk(bytes));
                    }
                    Err(e) => warn!("dropping audio part with invalid base64: {e}"),
                }
            }
        }
    }

    if let Some(transcription) = content.input_transcription {
        if !transcription.text.is_empty() {
            let _ = events.send(ChannelEvent::Transcript {
                speaker: Speaker::User,
                text: transcription.text,
                is_final: false,
            });
        }
    }
    if let Some(transcription) = content.output_transcription {
        if !transcription.text.is_empty() {
            let _ = events.send(ChannelEvent::Transcript {
                speaker: Speaker::Model,
                text: transcription.text,
                is_final: false,
            });
        }
    }

    if content.interrupted {
        let _ = events.send(ChannelEvent::Interrupted);
    }
    if content.turn_complete {
        let _ = events.send(ChannelEvent::TurnComplete);
    }
}

fn describe_handshake_error(error: tungstenite::Error) -> anyhow::Error {
    match error {
        tungstenite::Error::Http(response) => {
            anyhow!("handshake rejected: HTTP {}", response.status())
        }
        other => anyhow!("connection failed: {other}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(rx: &mut UnboundedReceiver<ChannelEvent>) -> Vec<ChannelEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn dispatches_audio_transcript_and_flags() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let payload = format!(
            r#"{{
                "serverContent": {{
                    "modelTurn": {{"parts": [{{"inlineData": {{"mimeType": "audio/pcm;rate=24000", "data": "{}"}}}}]}},
                    "outputTranscription": {{"text": "hi there"}},
                    "turnComplete": true
                }}
            }}"#,
            general_purpose::STANDARD.encode([0u8, 1, 2, 3])
        );

        dispatch_payload(payload.as_bytes(), &tx);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3);
        assert!(matches!(&events[0], ChannelEvent::AudioChunk(bytes) if bytes == &[0, 1, 2, 3]));
        assert!(matches!(
            &events[1],
            ChannelEvent::Transcript { speaker: Speaker::Model, text, is_final: false } if text == "hi there"
        ));
        assert!(matches!(events[2], ChannelEvent::TurnComplete));
    }

    #[test]
    fn interruption_flag_becomes_event() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_payload(br#"{"serverContent": {"interrupted": true}}"#, &tx);
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChannelEvent::Interrupted));
    }

    #[test]
    fn invalid_base64_audio_is_dropped_but_flags_still_dispatch() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let payload = br#"{
            "serverContent": {
                "modelTurn": {"parts": [{"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "!!not-base64!!"}}]},
                "turnComplete": true
            }
        }"#;

        dispatch_payload(payload, &tx);

        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], ChannelEvent::TurnComplete));
    }

    #[test]
    fn unparseable_payload_produces_no_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch_payload(b"not json", &tx);
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn setup_complete_is_detected() {
        assert!(setup_is_complete(br#"{"setupComplete": {}}"#));
        assert!(!setup_is_complete(br#"{"serverContent": {}}"#));
        assert!(!setup_is_complete(b"garbage"));
    }

    #[test]
    fn send_frame_is_a_no_op_when_closed() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let channel = RealtimeChannel {
            outbound: out_tx,
            open: Arc::new(AtomicBool::new(false)),
        };

        channel.send_frame(&[0.0; 256]);
        assert!(out_rx.try_recv().is_err());
    }

    #[test]
    fn send_frame_encodes_pcm16_base64_when_open() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let channel = RealtimeChannel {
            outbound: out_tx,
            open: Arc::new(AtomicBool::new(true)),
        };

        channel.send_frame(&[0.0, 0.5]);

        let Message::Text(json) = out_rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let chunk = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(chunk["mimeType"], "audio/pcm;rate=16000");
        let bytes = general_purpose::STANDARD
            .decode(chunk["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(bytes.len(), 4);
    }

    #[test]
    fn close_flips_open_and_queues_close_frame() {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let channel = RealtimeChannel {
            outbound: out_tx,
            open: Arc::new(AtomicBool::new(true)),
        };

        channel.close();
        assert!(!channel.is_open());
        assert!(matches!(out_rx.try_recv().unwrap(), Message::Close(None)));

        // Frames after close are dropped silently.
        channel.send_frame(&[0.1; 16]);
        assert!(out_rx.try_recv().is_err());
    }
}
