use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use super::envelope::RiskSignal;
use crate::error::RelayError;

/// Which analyses the relay runs on pulled frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PullKind {
    Fire,
    Ppe,
    #[default]
    Both,
}

impl PullKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fire => "fire",
            Self::Ppe => "ppe",
            Self::Both => "both",
        }
    }
}

impl fmt::Display for PullKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PullKind {
    type Err = RelayError;

    /// Case-insensitive. `fire/smoke` is accepted as `fire`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fire" | "fire/smoke" => Ok(Self::Fire),
            "ppe" => Ok(Self::Ppe),
            "both" => Ok(Self::Both),
            other => Err(RelayError::InvalidSource(format!("unknown analysis kind '{other}'"))),
        }
    }
}

impl<'de> Deserialize<'de> for PullKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Body of `POST /stream/start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartBody {
    pub url: String,
    #[serde(default)]
    pub kind: PullKind,
}

/// Body of `POST /stream/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushBody {
    /// `data:image/jpeg;base64,...`
    pub image: String,
    #[serde(default)]
    pub kind: PullKind,
}

/// Response of `POST /stream/push`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushReply {
    pub ok: bool,
    #[serde(default)]
    pub risk: Option<RiskSignal>,
}

/// Response of `GET /stream/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullStatus {
    /// `stopped`, `starting` or `running`.
    pub state: String,
    pub url: Option<String>,
    pub kind: Option<PullKind>,
    pub watchers: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_parsing() {
        assert_eq!("FIRE".parse::<PullKind>().unwrap(), PullKind::Fire);
        assert_eq!("fire/smoke".parse::<PullKind>().unwrap(), PullKind::Fire);
        assert_eq!(" ppe ".parse::<PullKind>().unwrap(), PullKind::Ppe);
        assert!("smoke".parse::<PullKind>().is_err());
    }

    #[test]
    fn start_body_wire_format() {
        let body = StartBody {
            url: "http://cam/capture".into(),
            kind: PullKind::Ppe,
        };
        assert_eq!(
            serde_json::to_string(&body).unwrap(),
            r#"{"url":"http://cam/capture","kind":"ppe"}"#
        );
    }

    #[test]
    fn start_body_defaults_kind() {
        let body: StartBody = serde_json::from_str(r#"{"url":"rtsp://x"}"#).unwrap();
        assert_eq!(body.kind, PullKind::Both);
        let body: StartBody =
            serde_json::from_str(r#"{"url":"rtsp://x","kind":"Fire/Smoke"}"#).unwrap();
        assert_eq!(body.kind, PullKind::Fire);
    }
}
