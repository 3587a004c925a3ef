use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_models() -> Vec<String> {
    vec![
        "gemini-2.5-flash-preview-native-audio-dialog".to_string(),
        "gemini-2.0-flash-live-001".to_string(),
    ]
}

fn default_voice() -> String {
    "Leda".to_string()
}

fn default_system_instruction() -> String {
    "You are a warm, attentive voice companion. Keep replies short and \
     conversational, and ask a follow-up question when it helps the \
     conversation along."
        .to_string()
}

fn default_search_grounding() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_retry_delay_ms() -> u64 {
    1000
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AppSettings {
    /// Model variants to try, in fallback order.
    #[serde(default = "default_models")]
    pub models: Vec<String>,
    #[serde(default = "default_voice")]
    pub voice: String,
    #[serde(default = "default_system_instruction")]
    pub system_instruction: String,
    /// Let the model ground replies with web search.
    #[serde(default = "default_search_grounding")]
    pub search_grounding: bool,
    #[serde(default)]
    pub selected_microphone: Option<String>,
    #[serde(default)]
    pub selected_output_device: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Append finalized utterances here as JSON lines.
    #[serde(default)]
    pub transcript_path: Option<PathBuf>,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            models: default_models(),
            voice: default_voice(),
            system_instruction: default_system_instruction(),
            search_grounding: default_search_grounding(),
            selected_microphone: None,
            selected_output_device: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            retry_delay_ms: default_retry_delay_ms(),
            transcript_path: None,
        }
    }
}

/// Load settings from a JSON file, or defaults when no path is given.
pub fn load_settings(path: Option<&Path>) -> Result<AppSettings> {
    match path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read settings file {path:?}"))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("failed to parse settings file {path:?}"))
        }
        None => Ok(AppSettings::default()),
    }
}

/// Collect credentials from the environment: numbered keys in order
/// (`GEMINI_API_KEY_1`, `GEMINI_API_KEY_2`, ...), falling back to the single
/// `GEMINI_API_KEY` when no numbered key is set.
pub fn collect_credentials() -> Vec<String> {
    collect_credentials_from(|name| std::env::var(name).ok())
}

fn collect_credentials_from(get: impl Fn(&str) -> Option<String>) -> Vec<String> {
    let mut keys = Vec::new();
    let mut index = 1;
    while let Some(key) = get(&format!("GEMINI_API_KEY_{index}")) {
        if !key.is_empty() {
            keys.push(key);
        }
        index += 1;
    }

    if keys.is_empty() {
        if let Some(key) = get("GEMINI_API_KEY") {
            if !key.is_empty() {
                keys.push(key);
            }
        }
    }

    keys
}

/// Sanity-check an API key before using it
pub fn validate_api_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("API key cannot be empty".to_string());
    }
    if key.len() < 20 {
        return Err("API key seems too short".to_string());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn empty_settings_file_yields_defaults() {
        let settings: AppSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.models, default_models());
        assert_eq!(settings.voice, "Leda");
        assert!(settings.search_grounding);
        assert_eq!(settings.connect_timeout_secs, 10);
        assert_eq!(settings.retry_delay_ms, 1000);
        assert!(settings.transcript_path.is_none());
    }

    #[test]
    fn partial_settings_file_overrides_only_named_fields() {
        let settings: AppSettings =
            serde_json::from_str(r#"{"voice": "Puck", "retry_delay_ms": 250}"#).unwrap();
        assert_eq!(settings.voice, "Puck");
        assert_eq!(settings.retry_delay_ms, 250);
        assert_eq!(settings.models, default_models());
    }

    #[test]
    fn load_settings_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"models": ["m-only"]}}"#).unwrap();

        let settings = load_settings(Some(file.path())).unwrap();
        assert_eq!(settings.models, vec!["m-only"]);
    }

    #[test]
    fn load_settings_rejects_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(load_settings(Some(file.path())).is_err());
    }

    #[test]
    fn numbered_keys_are_collected_in_order() {
        let env: HashMap<&str, &str> = [
            ("GEMINI_API_KEY_1", "first"),
            ("GEMINI_API_KEY_2", "second"),
            ("GEMINI_API_KEY", "ignored"),
        ]
        .into();
        let keys = collect_credentials_from(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(keys, vec!["first", "second"]);
    }

    #[test]
    fn single_key_is_the_fallback() {
        let env: HashMap<&str, &str> = [("GEMINI_API_KEY", "only")].into();
        let keys = collect_credentials_from(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(keys, vec!["only"]);
    }

    #[test]
    fn numbering_stops_at_the_first_gap() {
        let env: HashMap<&str, &str> =
            [("GEMINI_API_KEY_1", "first"), ("GEMINI_API_KEY_3", "orphan")].into();
        let keys = collect_credentials_from(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(keys, vec!["first"]);
    }

    #[test]
    fn no_keys_yields_empty_list() {
        let keys = collect_credentials_from(|_| None);
        assert!(keys.is_empty());
    }

    #[test]
    fn validates_api_keys() {
        assert!(validate_api_key("").is_err());
        assert!(validate_api_key("short").is_err());
        assert!(validate_api_key("a-plausible-api-key-value").is_ok());
    }
}
