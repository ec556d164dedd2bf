//! Process-wide settings: credential, model id and audio preferences.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Model used when none has been stored.
pub const DEFAULT_MODEL: &str = gemini::DEFAULT_MODEL;

const DEFAULT_RATE: f32 = 1.0;
const DEFAULT_VOLUME: f32 = 1.0;
const DEFAULT_VOICE_HINT: &str = "pt-BR";

/// Read-aloud preferences.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSettings {
    pub rate: f32,
    pub volume: f32,
    pub voice_hint: String,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            volume: DEFAULT_VOLUME,
            voice_hint: DEFAULT_VOICE_HINT.to_string(),
        }
    }
}

impl AudioSettings {
    /// Build settings from loosely-typed JSON.
    ///
    /// Each field is taken only if it has the right type; anything else
    /// (missing, wrong type, not an object at all) gets the default.
    pub fn from_value(value: &Value) -> Self {
        let defaults = Self::default();
        Self {
            rate: value
                .get("rate")
                .and_then(Value::as_f64)
                .map(|v| v as f32)
                .unwrap_or(defaults.rate),
            volume: value
                .get("volume")
                .and_then(Value::as_f64)
                .map(|v| v as f32)
                .unwrap_or(defaults.volume),
            voice_hint: value
                .get("voiceHint")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or(defaults.voice_hint),
        }
    }

    /// Parse stored text, never failing.
    pub fn from_json_lenient(raw: &str) -> Self {
        serde_json::from_str::<Value>(raw)
            .map(|v| Self::from_value(&v))
            .unwrap_or_default()
    }
}

/// Trimmed value, or `None` when blank (blank means "not configured").
pub fn non_blank(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_audio_defaults() {
        let audio = AudioSettings::default();
        assert_eq!(audio.rate, 1.0);
        assert_eq!(audio.volume, 1.0);
        assert_eq!(audio.voice_hint, "pt-BR");
    }

    #[test]
    fn test_audio_per_field_coercion() {
        let audio = AudioSettings::from_value(&json!({
            "rate": "fast",
            "volume": 0.4,
            "voiceHint": 7
        }));
        assert_eq!(audio.rate, 1.0);
        assert!((audio.volume - 0.4).abs() < f32::EPSILON);
        assert_eq!(audio.voice_hint, "pt-BR");
    }

    #[test]
    fn test_audio_lenient_parse() {
        assert_eq!(AudioSettings::from_json_lenient("not json"), AudioSettings::default());
        assert_eq!(AudioSettings::from_json_lenient("[1, 2]"), AudioSettings::default());

        let audio = AudioSettings::from_json_lenient(r#"{"rate": 1.5, "voiceHint": "en-US"}"#);
        assert_eq!(audio.rate, 1.5);
        assert_eq!(audio.voice_hint, "en-US");
    }

    #[test]
    fn test_non_blank() {
        assert_eq!(non_blank("  "), None);
        assert_eq!(non_blank(" abc \n"), Some("abc".to_string()));
    }
}
