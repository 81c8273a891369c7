use crate::protocol::{AlertPayload, Detection, Envelope, FramePayload, PullKind, RiskSignal, jpeg_data_url};

/// Result of analysing one frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Analysis {
    pub risk: Option<RiskSignal>,
    pub detections: Vec<Detection>,
}

/// Hook for scoring frames before they are fanned out.
///
/// Runs on the relay's request path, once per frame, so implementations
/// should be quick or hand work off elsewhere.
pub trait Analyzer: Send + Sync {
    fn analyze(&self, jpeg: &[u8], kind: PullKind) -> Analysis;
}

/// Passes frames through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoAnalysis;

impl Analyzer for NoAnalysis {
    fn analyze(&self, _jpeg: &[u8], _kind: PullKind) -> Analysis {
        Analysis::default()
    }
}

/// Envelopes to broadcast for one frame: the frame itself, then an alert
/// if its risk is alarming.
pub fn frame_envelopes(jpeg: &[u8], analysis: Analysis) -> Vec<Envelope> {
    let alert = analysis
        .risk
        .as_ref()
        .filter(|r| r.level.is_alarming())
        .map(|risk| {
            Envelope::Alert(AlertPayload {
                severity: risk.level.label().to_string(),
                message: format!("{} risk detected (score {:.0})", risk.level.label(), risk.score),
                risk: Some(risk.clone()),
            })
        });

    let frame = Envelope::Frame(FramePayload {
        image: jpeg_data_url(jpeg),
        detections: analysis.detections,
        risk: analysis.risk,
    });

    std::iter::once(frame).chain(alert).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RiskLevel;

    #[test]
    fn plain_frame_without_analysis() {
        let envs = frame_envelopes(&[0xFF, 0xD8], NoAnalysis.analyze(&[], PullKind::Both));
        assert_eq!(envs.len(), 1);
        let Envelope::Frame(frame) = &envs[0] else {
            panic!("expected frame");
        };
        assert!(frame.image.starts_with("data:image/jpeg;base64,"));
        assert!(frame.risk.is_none());
    }

    #[test]
    fn red_risk_adds_alert_after_frame() {
        let analysis = Analysis {
            risk: Some(RiskSignal::new(RiskLevel::Red, 87.0)),
            detections: Vec::new(),
        };
        let envs = frame_envelopes(&[1], analysis);
        assert_eq!(envs.iter().map(Envelope::tag).collect::<Vec<_>>(), ["frame", "alert"]);
        let Envelope::Alert(alert) = &envs[1] else {
            panic!("expected alert");
        };
        assert_eq!(alert.severity, "High");
    }

    #[test]
    fn yellow_risk_no_alert() {
        let analysis = Analysis {
            risk: Some(RiskSignal::new(RiskLevel::Yellow, 40.0)),
            detections: Vec::new(),
        };
        assert_eq!(frame_envelopes(&[1], analysis).len(), 1);
    }
}
