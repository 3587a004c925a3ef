//! Transcript accumulation and non-blocking persistence.
//!
//! The wire delivers transcription in fragments. This collaborator stitches
//! fragments into utterances, finalizes them on turn boundaries, and hands
//! finished `(speaker, text, timestamp)` triples to a detached writer task
//! so the event loop never waits on the filesystem.

use crate::realtime::Speaker;
use chrono::{DateTime, Utc};
use log::warn;
use serde::Serialize;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// One finalized utterance.
#[derive(Debug, Clone, Serialize)]
pub struct TranscriptEntry {
    pub speaker: Speaker,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

pub struct TranscriptLog {
    user_partial: String,
    model_partial: String,
    entries: Vec<TranscriptEntry>,
    sink: Option<UnboundedSender<TranscriptEntry>>,
}

impl TranscriptLog {
    /// A path enables the JSON-lines sink. Without one, entries are only
    /// kept in memory.
    pub fn new(path: Option<PathBuf>) -> Self {
        let sink = path.map(|path| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(append_entries(path, rx));
            tx
        });
        Self {
            user_partial: String::new(),
            model_partial: String::new(),
            entries: Vec::new(),
            sink,
        }
    }

    pub fn push_fragment(&mut self, speaker: Speaker, text: &str) {
        match speaker {
            Speaker::User => self.user_partial.push_str(text),
            Speaker::Model => self.model_partial.push_str(text),
        }
    }

    /// Close out the pending utterance for one speaker, if any.
    pub fn finalize(&mut self, speaker: Speaker) -> Option<TranscriptEntry> {
        let partial = match speaker {
            Speaker::User => &mut self.user_partial,
            Speaker::Model => &mut self.model_partial,
        };
        let text = std::mem::take(partial).trim().to_string();
        if text.is_empty() {
            return None;
        }

        let entry = TranscriptEntry {
            speaker,
            text,
            timestamp: Utc::now(),
        };
        if let Some(sink) = &self.sink {
            let _ = sink.send(entry.clone());
        }
        self.entries.push(entry.clone());
        Some(entry)
    }

    /// Finalize both speakers, user first so reply follows question.
    pub fn finalize_turn(&mut self) -> Vec<TranscriptEntry> {
        [Speaker::User, Speaker::Model]
            .into_iter()
            .filter_map(|speaker| self.finalize(speaker))
            .collect()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }
}

async fn append_entries(path: PathBuf, mut rx: UnboundedReceiver<TranscriptEntry>) {
    let file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await;
    let mut file = match file {
        Ok(file) => file,
        Err(e) => {
            warn!("transcript file {path:?} unavailable, entries will not be saved: {e}");
            return;
        }
    };

    while let Some(entry) = rx.recv().await {
        let mut line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!("failed to encode transcript entry: {e}");
                continue;
            }
        };
        line.push('\n');
        if let Err(e) = file.write_all(line.as_bytes()).await {
            warn!("failed to append transcript entry: {e}");
            break;
        }
    }
    let _ = file.flush().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fragments_accumulate_per_speaker() {
        let mut log = TranscriptLog::new(None);
        log.push_fragment(Speaker::User, "what is ");
        log.push_fragment(Speaker::Model, "a good ");
        log.push_fragment(Speaker::User, "the time?");
        log.push_fragment(Speaker::Model, "question!");

        let user = log.finalize(Speaker::User).unwrap();
        assert_eq!(user.text, "what is the time?");
        let model = log.finalize(Speaker::Model).unwrap();
        assert_eq!(model.text, "question!");
        assert_eq!(log.entries().len(), 2);
    }

    #[test]
    fn finalize_with_nothing_pending_yields_none() {
        let mut log = TranscriptLog::new(None);
        assert!(log.finalize(Speaker::User).is_none());
        assert!(log.finalize_turn().is_empty());
        assert!(log.entries().is_empty());
    }

    #[test]
    fn whitespace_only_fragments_are_dropped() {
        let mut log = TranscriptLog::new(None);
        log.push_fragment(Speaker::Model, "   ");
        assert!(log.finalize(Speaker::Model).is_none());
    }

    #[test]
    fn finalize_turn_orders_user_before_model() {
        let mut log = TranscriptLog::new(None);
        log.push_fragment(Speaker::Model, "the reply");
        log.push_fragment(Speaker::User, "the question");

        let entries = log.finalize_turn();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].speaker, Speaker::User);
        assert_eq!(entries[1].speaker, Speaker::Model);
    }

    #[tokio::test]
    async fn entries_are_appended_as_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transcript.jsonl");

        let mut log = TranscriptLog::new(Some(path.clone()));
        log.push_fragment(Speaker::User, "hello");
        log.finalize(Speaker::User).unwrap();
        log.push_fragment(Speaker::Model, "hi!");
        log.finalize(Speaker::Model).unwrap();
        drop(log);

        // The writer task drains the queue after the log is dropped.
        let mut contents = String::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            contents = tokio::fs::read_to_string(&path).await.unwrap_or_default();
            if contents.lines().count() == 2 {
                break;
            }
        }

        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["speaker"], "user");
        assert_eq!(first["text"], "hello");
        assert!(first["timestamp"].is_string());
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["speaker"], "model");
    }
}
