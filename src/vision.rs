/// Vision advisor: free-text coaching from the raw frame.
///
/// The call is slow and blocking (an HTTP round trip to a captioning model),
/// so it runs on the blocking pool behind a single-flight `Slot` with a hard
/// deadline. A late answer is thrown away, never shown on a later cycle.
///
/// Vision text is a hint, not a tactical reminder: its priority is capped
/// strictly below the lowest combat-gated rule and it never requires combat.
use crate::config::AppConfig;
use crate::error::AdvisorError;
use crate::slot::Slot;
use crate::snapshot::FrameRef;
use crate::suggestion::{Source, Suggestion, MAX_PRIORITY};
use std::sync::Arc;
use std::time::Duration;

pub const TEXT_PREFIX:    &str  = "Vision: ";
pub const MAX_TEXT_CHARS: usize = 120;
pub const SUGGESTION_ID:  &str  = "vision";

// ---------------------------------------------------------------------------
// Model seam
// ---------------------------------------------------------------------------

pub trait VisionModel: Send + Sync {
    /// Describe the frame in one short piece of advice. Blocking.
    fn describe(&self, frame: &[u8], timeout: Duration) -> Result<String, AdvisorError>;
}

/// Posts the encoded frame to a captioning endpoint.
pub struct HttpVisionModel {
    endpoint: String,
    token:    Option<String>,
    agent:    ureq::Agent,
}

impl HttpVisionModel {
    pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token:    token.filter(|t| !t.trim().is_empty()),
            agent:    ureq::AgentBuilder::new().build(),
        }
    }
}

impl VisionModel for HttpVisionModel {
    fn describe(&self, frame: &[u8], timeout: Duration) -> Result<String, AdvisorError> {
        let mut request = self
            .agent
            .post(&self.endpoint)
            .timeout(timeout)
            .set("Content-Type", "application/octet-stream");
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {}", token));
        }

        let body = request
            .send_bytes(frame)
            .map_err(|e| AdvisorError::Inference(e.to_string()))?
            .into_string()
            .map_err(|e| AdvisorError::MalformedResponse(e.to_string()))?;

        parse_response(&body)
    }
}

/// Accepts `[{"generated_text": ..}]`, `{"generated_text": ..}` or
/// `{"suggestion": ..}`.
pub fn parse_response(body: &str) -> Result<String, AdvisorError> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| AdvisorError::MalformedResponse(e.to_string()))?;

    let object = match &value {
        serde_json::Value::Array(items) => items.first(),
        other => Some(other),
    };

    object
        .and_then(|o| o.get("generated_text").or_else(|| o.get("suggestion")))
        .and_then(|t| t.as_str())
        .map(str::to_owned)
        .ok_or_else(|| AdvisorError::MalformedResponse(format!("no text in response: {:.80}", body)))
}

/// Collapse whitespace, cap length, prefix. Blank text yields `None`.
pub fn clean_text(raw: &str) -> Option<String> {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    let capped: String = collapsed.chars().take(MAX_TEXT_CHARS).collect();
    Some(format!("{}{}", TEXT_PREFIX, capped.trim_end()))
}

/// Highest priority a vision suggestion may carry given the lowest
/// combat-gated rule priority.
pub fn cap_priority(requested: u8, combat_floor: Option<u8>) -> u8 {
    let requested = requested.min(MAX_PRIORITY);
    match combat_floor {
        Some(floor) => requested.min(floor.saturating_sub(1)),
        None        => requested,
    }
}

// ---------------------------------------------------------------------------
// Advisor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct VisionAdvisor {
    model:    Option<Arc<dyn VisionModel>>,
    priority: u8,
    slot:     Slot,
}

impl VisionAdvisor {
    pub fn new(model: Arc<dyn VisionModel>, priority: u8, combat_floor: Option<u8>) -> Self {
        Self {
            model:    Some(model),
            priority: cap_priority(priority, combat_floor),
            slot:     Slot::new("vision"),
        }
    }

    pub fn disabled() -> Self {
        Self { model: None, priority: 0, slot: Slot::new("vision") }
    }

    pub fn from_config(cfg: &AppConfig, combat_floor: Option<u8>) -> Self {
        if cfg.vision_endpoint.trim().is_empty() {
            tracing::info!("No vision endpoint configured — vision advisor disabled");
            return Self::disabled();
        }
        let token = Some(cfg.vision_api_token.clone());
        let advisor = Self::new(
            Arc::new(HttpVisionModel::new(cfg.vision_endpoint.trim(), token)),
            cfg.vision_priority,
            combat_floor,
        );
        if advisor.priority < cfg.vision_priority {
            tracing::info!(
                "Vision priority capped {} → {} (below combat-gated rules)",
                cfg.vision_priority, advisor.priority
            );
        }
        tracing::info!("Vision advisor → {}", cfg.vision_endpoint);
        advisor
    }

    pub fn is_enabled(&self) -> bool {
        self.model.is_some()
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// Describe `frame` within `timeout`. Slow, busy, failing or empty
    /// calls all yield `None`; a result is never partial.
    pub async fn infer(
        &self,
        frame:          &FrameRef,
        timeout:        Duration,
        produced_at_ms: u64,
    ) -> Option<Suggestion> {
        let model    = Arc::clone(self.model.as_ref()?);
        let frame    = frame.clone();
        let priority = self.priority;

        self.slot
            .run(timeout, move || {
                let text = frame
                    .load()
                    .map_err(AdvisorError::from)
                    .and_then(|bytes| model.describe(&bytes, timeout));
                match text {
                    Ok(raw) => clean_text(&raw).map(|text| {
                        Suggestion::new(SUGGESTION_ID, text, priority, Source::Vision, false, produced_at_ms)
                    }),
                    Err(e) => {
                        tracing::warn!("Vision advisor: {}", e);
                        None
                    }
                }
            })
            .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    struct Canned {
        text:  &'static str,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl Canned {
        fn new(text: &'static str, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self { text, delay: Duration::from_millis(delay_ms), calls: AtomicUsize::new(0) })
        }
    }

    impl VisionModel for Canned {
        fn describe(&self, _frame: &[u8], _timeout: Duration) -> Result<String, AdvisorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(self.text.to_owned())
        }
    }

    fn frame() -> FrameRef {
        FrameRef::Inline(Arc::from(vec![0xffu8, 0xd8, 0xff]))
    }

    #[tokio::test]
    async fn produces_prefixed_non_combat_suggestion() {
        let advisor = VisionAdvisor::new(Canned::new("  smoke   the   choke  ", 0), 40, Some(80));
        let s = advisor.infer(&frame(), Duration::from_secs(1), 99).await.unwrap();
        assert_eq!(s.text, "Vision: smoke the choke");
        assert_eq!(s.priority, 40);
        assert_eq!(s.source, Source::Vision);
        assert!(!s.requires_combat);
        assert_eq!(s.produced_at_ms, 99);
    }

    #[tokio::test]
    async fn priority_is_capped_below_combat_rules() {
        let advisor = VisionAdvisor::new(Canned::new("push", 0), 95, Some(80));
        assert_eq!(advisor.priority(), 79);
        let s = advisor.infer(&frame(), Duration::from_secs(1), 0).await.unwrap();
        assert_eq!(s.priority, 79);
    }

    #[tokio::test]
    async fn slow_model_times_out_and_is_excluded() {
        let model = Canned::new("too late", 400);
        let advisor = VisionAdvisor::new(model.clone(), 40, None);

        let started = Instant::now();
        assert!(advisor.infer(&frame(), Duration::from_millis(50), 0).await.is_none());
        assert!(started.elapsed() < Duration::from_millis(300));

        // Second cycle while the abandoned call is still running: skipped.
        assert!(advisor.infer(&frame(), Duration::from_millis(50), 1).await.is_none());
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn blank_text_and_missing_frame_yield_nothing() {
        let advisor = VisionAdvisor::new(Canned::new("   ", 0), 40, None);
        assert!(advisor.infer(&frame(), Duration::from_secs(1), 0).await.is_none());

        let advisor = VisionAdvisor::new(Canned::new("x", 0), 40, None);
        let missing = FrameRef::Path("/definitely/not/here.jpg".into());
        assert!(advisor.infer(&missing, Duration::from_secs(1), 0).await.is_none());
    }

    #[tokio::test]
    async fn disabled_advisor_is_silent() {
        let advisor = VisionAdvisor::disabled();
        assert!(!advisor.is_enabled());
        assert!(advisor.infer(&frame(), Duration::from_secs(1), 0).await.is_none());
        assert!(!VisionAdvisor::from_config(&AppConfig::default(), None).is_enabled());
    }

    #[test]
    fn parses_response_shapes() {
        assert_eq!(parse_response(r#"[{"generated_text":"a"}]"#).unwrap(), "a");
        assert_eq!(parse_response(r#"{"generated_text":"b"}"#).unwrap(), "b");
        assert_eq!(parse_response(r#"{"suggestion":"c"}"#).unwrap(), "c");
        assert!(matches!(parse_response(r#"{"other":1}"#), Err(AdvisorError::MalformedResponse(_))));
        assert!(matches!(parse_response("<html>"), Err(AdvisorError::MalformedResponse(_))));
        assert!(parse_response("[]").is_err());
    }

    #[test]
    fn truncates_long_text() {
        let long = "a".repeat(500);
        let text = clean_text(&long).unwrap();
        assert_eq!(text.chars().count(), TEXT_PREFIX.len() + MAX_TEXT_CHARS);
        assert!(clean_text("\n\t ").is_none());
    }

    #[test]
    fn cap_priority_edges() {
        assert_eq!(cap_priority(40, Some(80)), 40);
        assert_eq!(cap_priority(80, Some(80)), 79);
        assert_eq!(cap_priority(10, Some(0)), 0);
        assert_eq!(cap_priority(200, None), 100);
    }
}
