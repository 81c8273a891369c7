use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RelayError, Result};

const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

/// Tags a subscriber understands. Anything else is skipped.
const KNOWN_TAGS: [&str; 4] = ["frame", "risk", "alert", "error"];

/// A message delivered from the relay to viewers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    /// Latest available frame.
    Frame(FramePayload),
    /// Current aggregate risk.
    Risk(RiskSignal),
    /// Discrete event to surface immediately.
    Alert(AlertPayload),
    /// Relay-side problem; the session continues.
    Error { message: String },
}

impl Envelope {
    /// Parse one text message.
    ///
    /// Returns `Ok(None)` for well-formed JSON with an unrecognised `type`,
    /// and [`RelayError::MalformedMessage`] for anything else that cannot be
    /// interpreted.
    pub fn parse(text: &str) -> Result<Option<Self>> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| RelayError::MalformedMessage(format!("invalid JSON: {e}")))?;

        let tag = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RelayError::MalformedMessage("missing type tag".to_string()))?;
        if !KNOWN_TAGS.contains(&tag) {
            return Ok(None);
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| RelayError::MalformedMessage(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Self::Frame(_) => "frame",
            Self::Risk(_) => "risk",
            Self::Alert(_) => "alert",
            Self::Error { .. } => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FramePayload {
    /// Self-contained image reference, normally a JPEG data URL.
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detections: Vec<Detection>,
    /// Risk computed for this frame, when the relay ran an analysis.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskSignal>,
}

impl FramePayload {
    pub fn new(image: String) -> Self {
        Self {
            image,
            detections: Vec::new(),
            risk: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    #[serde(default)]
    pub conf: f32,
    /// `[x1, y1, x2, y2]` in pixels.
    #[serde(default)]
    pub bbox: Option<[f32; 4]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub severity: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub risk: Option<RiskSignal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSignal {
    pub level: RiskLevel,
    #[serde(default)]
    pub score: f64,
}

impl RiskSignal {
    pub fn new(level: RiskLevel, score: f64) -> Self {
        Self { level, score }
    }
}

/// Ordinal risk category.
///
/// Analysis backends that report `Low`/`Medium`/`High`/`Critical` are
/// folded onto the three-colour scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    #[serde(alias = "Low", alias = "green", alias = "low")]
    Green,
    #[serde(alias = "Medium", alias = "yellow", alias = "medium")]
    Yellow,
    #[serde(alias = "High", alias = "Critical", alias = "red", alias = "high", alias = "critical")]
    Red,
}

impl RiskLevel {
    /// Badge text shown next to the indicator.
    pub fn label(self) -> &'static str {
        match self {
            Self::Green => "Normal",
            Self::Yellow => "Elevated",
            Self::Red => "High",
        }
    }

    /// Whether this level warrants an alert alongside the frame.
    pub fn is_alarming(self) -> bool {
        self == Self::Red
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Green => "Green",
            Self::Yellow => "Yellow",
            Self::Red => "Red",
        };
        f.write_str(name)
    }
}

/// Wrap JPEG bytes as a `data:image/jpeg;base64,` URL.
pub fn jpeg_data_url(jpeg: &[u8]) -> String {
    let mut url = String::with_capacity(DATA_URL_PREFIX.len() + jpeg.len().div_ceil(3) * 4);
    url.push_str(DATA_URL_PREFIX);
    STANDARD.encode_string(jpeg, &mut url);
    url
}

/// Extract JPEG bytes from a `data:image/jpeg;base64,` URL.
///
/// The prefix is matched case-insensitively.
pub fn decode_data_url(url: &str) -> Result<Vec<u8>> {
    let prefix_len = DATA_URL_PREFIX.len();
    let matches = url
        .get(..prefix_len)
        .is_some_and(|p| p.eq_ignore_ascii_case(DATA_URL_PREFIX));
    if !matches || url.len() == prefix_len {
        return Err(RelayError::MalformedMessage("invalid dataURL".to_string()));
    }
    STANDARD
        .decode(&url[prefix_len..])
        .map_err(|e| RelayError::MalformedMessage(format!("invalid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_frame() {
        let env = Envelope::parse(r#"{"type":"frame","image":"data:image/jpeg;base64,AA=="}"#)
            .unwrap()
            .unwrap();
        assert_eq!(
            env,
            Envelope::Frame(FramePayload::new("data:image/jpeg;base64,AA==".into()))
        );
    }

    #[test]
    fn parses_frame_with_embedded_risk_and_detections() {
        let text = r#"{"type":"frame","image":"x","risk":{"level":"High","score":0.9},
            "detections":[{"label":"NO-Hardhat","conf":0.8,"bbox":[1,2,3,4]}]}"#;
        let Envelope::Frame(frame) = Envelope::parse(text).unwrap().unwrap() else {
            panic!("not a frame");
        };
        assert_eq!(frame.risk, Some(RiskSignal::new(RiskLevel::Red, 0.9)));
        assert_eq!(frame.detections[0].bbox, Some([1.0, 2.0, 3.0, 4.0]));
    }

    #[test]
    fn parses_risk_alert_error() {
        assert_eq!(
            Envelope::parse(r#"{"type":"risk","level":"Green","score":10}"#).unwrap(),
            Some(Envelope::Risk(RiskSignal::new(RiskLevel::Green, 10.0)))
        );
        assert_eq!(
            Envelope::parse(r#"{"type":"alert","severity":"High","message":"x"}"#).unwrap(),
            Some(Envelope::Alert(AlertPayload {
                severity: "High".into(),
                message: "x".into(),
                risk: None,
            }))
        );
        assert_eq!(
            Envelope::parse(r#"{"type":"error","message":"cannot open stream"}"#).unwrap(),
            Some(Envelope::error("cannot open stream"))
        );
    }

    #[test]
    fn unknown_tag_is_skipped() {
        assert_eq!(Envelope::parse(r#"{"type":"telemetry","x":1}"#).unwrap(), None);
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(
            Envelope::parse("{not json"),
            Err(RelayError::MalformedMessage(_))
        ));
    }

    #[test]
    fn missing_tag_is_malformed() {
        assert!(matches!(
            Envelope::parse(r#"{"image":"x"}"#),
            Err(RelayError::MalformedMessage(_))
        ));
    }

    #[test]
    fn known_tag_missing_fields_is_malformed() {
        assert!(matches!(
            Envelope::parse(r#"{"type":"risk","score":3}"#),
            Err(RelayError::MalformedMessage(_))
        ));
    }

    #[test]
    fn serializes_with_type_tag() {
        let json = Envelope::Risk(RiskSignal::new(RiskLevel::Yellow, 2.5))
            .to_json()
            .unwrap();
        let value: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "risk");
        assert_eq!(value["level"], "Yellow");
    }

    #[test]
    fn backend_levels_fold_onto_colours() {
        let level: RiskLevel = serde_json::from_str(r#""Critical""#).unwrap();
        assert_eq!(level, RiskLevel::Red);
        let level: RiskLevel = serde_json::from_str(r#""Medium""#).unwrap();
        assert_eq!(level, RiskLevel::Yellow);
        assert_eq!(RiskLevel::Yellow.label(), "Elevated");
    }

    #[test]
    fn data_url_round_trip_and_rejects() {
        let url = jpeg_data_url(&[0xFF, 0xD8, 0xFF]);
        assert!(url.starts_with("data:image/jpeg;base64,"));
        assert_eq!(decode_data_url(&url).unwrap(), vec![0xFF, 0xD8, 0xFF]);
        assert_eq!(
            decode_data_url("DATA:IMAGE/JPEG;BASE64,/9j/").unwrap(),
            vec![0xFF, 0xD8, 0xFF]
        );
        assert!(decode_data_url("data:image/png;base64,AAAA").is_err());
        assert!(decode_data_url("data:image/jpeg;base64,").is_err());
        assert!(decode_data_url("").is_err());
    }
}
