/// Structured advisor: a small classifier over the snapshot's HUD readings.
///
/// The snapshot is flattened into a fixed 20-wide feature vector, a
/// `Classifier` picks one coaching class with a confidence, and the
/// configured `PriorityBuckets` turn that confidence into a priority (or into
/// nothing at all when the model is unsure).
///
/// Everything here is synchronous; the pipeline runs `infer` on a blocking
/// worker under its own timeout.
use crate::config::{AppConfig, PriorityBuckets};
use crate::error::AdvisorError;
use crate::snapshot::{CreditTier, RoundPhase, Snapshot, WeaponClass};
use crate::suggestion::{Source, Suggestion};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

pub const FEATURE_COUNT: usize = 20;

const VALORANT_MODEL: &str = include_str!("../data/models/valorant.json");

static EMBEDDED: &[(&str, &str)] = &[("valorant", VALORANT_MODEL)];

// ---------------------------------------------------------------------------
// Feature vector
// ---------------------------------------------------------------------------

/// Layout:
///
///   0      in_combat
///   1      flag.utility_available
///   2      flag.exposed
///   3..=5  credit tier one-hot (low, medium, high)
///   6..=9  round phase one-hot (buy, early, mid, late)
///   10     health / 100        (unknown → 1.0)
///   11     armor / 50          (unknown → 0.0)
///   12     ready abilities / reported abilities
///   13..=16 weapon class one-hot (sidearm+melee, smg+shotgun, rifle+mg, sniper)
///   17     flag.enemy_presence
///   18     flag.site_control
///   19     flag.spike_planted
///
/// Unknown readings contribute 0.0 unless noted.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector(pub [f32; FEATURE_COUNT]);

fn bit(value: Option<bool>) -> f32 {
    if value == Some(true) { 1.0 } else { 0.0 }
}

impl FeatureVector {
    pub fn from_snapshot(snap: &Snapshot) -> Self {
        let mut f = [0.0f32; FEATURE_COUNT];

        f[0] = bit(Some(snap.in_combat));
        f[1] = bit(snap.flag("utility_available"));
        f[2] = bit(snap.flag("exposed"));

        match snap.economy.credit_tier() {
            Some(CreditTier::Low)    => f[3] = 1.0,
            Some(CreditTier::Medium) => f[4] = 1.0,
            Some(CreditTier::High)   => f[5] = 1.0,
            None => {}
        }
        match snap.economy.round_phase {
            Some(RoundPhase::Buy)   => f[6] = 1.0,
            Some(RoundPhase::Early) => f[7] = 1.0,
            Some(RoundPhase::Mid)   => f[8] = 1.0,
            Some(RoundPhase::Late)  => f[9] = 1.0,
            None => {}
        }

        f[10] = snap.health.map_or(1.0, |h| (h as f32 / 100.0).min(1.0));
        f[11] = snap.armor.map_or(0.0, |a| (a as f32 / 50.0).min(1.0));

        if !snap.abilities.is_empty() {
            let ready = snap.abilities.values().filter(|r| **r).count();
            f[12] = ready as f32 / snap.abilities.len() as f32;
        }

        if let Some(weapon) = snap.equipped_weapon {
            let slot = match weapon.class() {
                WeaponClass::Melee | WeaponClass::Sidearm   => 13,
                WeaponClass::Smg | WeaponClass::Shotgun     => 14,
                WeaponClass::Rifle | WeaponClass::MachineGun => 15,
                WeaponClass::Sniper                         => 16,
            };
            f[slot] = 1.0;
        }

        f[17] = bit(snap.flag("enemy_presence"));
        f[18] = bit(snap.flag("site_control"));
        f[19] = bit(snap.flag("spike_planted"));

        Self(f)
    }
}

// ---------------------------------------------------------------------------
// Classifier seam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    /// Stable class id; may equal a rule id so the aggregator folds the two.
    pub id:              String,
    pub text:            String,
    pub requires_combat: bool,
    pub confidence:      f32,
}

pub trait Classifier: Send + Sync {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, AdvisorError>;
}

// ---------------------------------------------------------------------------
// Linear softmax model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct ClassSpec {
    pub id:              String,
    pub text:            String,
    #[serde(default)]
    pub requires_combat: bool,
    pub weights:         Vec<f32>,
    #[serde(default)]
    pub bias:            f32,
}

#[derive(Deserialize)]
struct ModelFile {
    classes: Vec<ClassSpec>,
}

/// One weight row per class; confidence is the softmax probability of the
/// winning class.
#[derive(Debug, Clone)]
pub struct LinearClassifier {
    classes: Vec<ClassSpec>,
}

impl LinearClassifier {
    pub fn from_json(raw: &str) -> Result<Self, AdvisorError> {
        let file: ModelFile = serde_json::from_str(raw)
            .map_err(|e| AdvisorError::ModelUnavailable(format!("model parse error: {}", e)))?;

        if file.classes.is_empty() {
            return Err(AdvisorError::ModelUnavailable("model has no classes".into()));
        }
        for class in &file.classes {
            if class.weights.len() != FEATURE_COUNT {
                return Err(AdvisorError::ModelUnavailable(format!(
                    "class '{}' has {} weights, expected {}",
                    class.id,
                    class.weights.len(),
                    FEATURE_COUNT
                )));
            }
            if class.id.trim().is_empty() || class.text.trim().is_empty() {
                return Err(AdvisorError::ModelUnavailable("class with empty id or text".into()));
            }
        }
        Ok(Self { classes: file.classes })
    }

    pub fn from_file(path: &Path) -> Result<Self, AdvisorError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AdvisorError::ModelUnavailable(format!("{}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    /// Embedded model for `game`, if one ships with the binary.
    pub fn embedded(game: &str) -> Option<Result<Self, AdvisorError>> {
        EMBEDDED
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(game.trim()))
            .map(|(_, raw)| Self::from_json(raw))
    }

    pub fn classes(&self) -> &[ClassSpec] {
        &self.classes
    }
}

impl Classifier for LinearClassifier {
    fn predict(&self, features: &FeatureVector) -> Result<Prediction, AdvisorError> {
        let logits: Vec<f32> = self
            .classes
            .iter()
            .map(|c| {
                c.weights
                    .iter()
                    .zip(features.0.iter())
                    .map(|(w, x)| w * x)
                    .sum::<f32>()
                    + c.bias
            })
            .collect();

        let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
        let total: f32 = exps.iter().sum();

        let (best, best_exp) = exps
            .iter()
            .copied()
            .enumerate()
            .fold((0usize, f32::NEG_INFINITY), |acc, (i, e)| if e > acc.1 { (i, e) } else { acc });

        let class = self
            .classes
            .get(best)
            .ok_or_else(|| AdvisorError::Inference("no class scored".into()))?;

        Ok(Prediction {
            id:              class.id.clone(),
            text:            class.text.clone(),
            requires_combat: class.requires_combat,
            confidence:      best_exp / total,
        })
    }
}

// ---------------------------------------------------------------------------
// Advisor
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StructuredAdvisor {
    classifier: Option<Arc<dyn Classifier>>,
    buckets:    PriorityBuckets,
}

impl StructuredAdvisor {
    pub fn new(classifier: Arc<dyn Classifier>, buckets: PriorityBuckets) -> Self {
        Self { classifier: Some(classifier), buckets: buckets.normalized() }
    }

    /// Advisor with no model: `infer` always yields `None`.
    pub fn unavailable(buckets: PriorityBuckets) -> Self {
        Self { classifier: None, buckets: buckets.normalized() }
    }

    /// Load the configured model (file path, else the embedded one for
    /// `game`). Any failure leaves the advisor unavailable, never fatal.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let buckets = cfg.priority_buckets;
        let loaded = if cfg.structured_model_path.as_os_str().is_empty() {
            match LinearClassifier::embedded(&cfg.game) {
                Some(result) => result,
                None => {
                    tracing::info!("No embedded structured model for '{}' — advisor disabled", cfg.game);
                    return Self::unavailable(buckets);
                }
            }
        } else {
            LinearClassifier::from_file(&cfg.structured_model_path)
        };

        match loaded {
            Ok(model) => {
                tracing::info!("Structured model loaded: {} classes", model.classes().len());
                Self::new(Arc::new(model), buckets)
            }
            Err(e) => {
                tracing::warn!("Structured advisor unavailable: {}", e);
                Self::unavailable(buckets)
            }
        }
    }

    pub fn is_available(&self) -> bool {
        self.classifier.is_some()
    }

    pub fn infer(&self, snap: &Snapshot) -> Option<Suggestion> {
        let classifier = self.classifier.as_ref()?;
        let features = FeatureVector::from_snapshot(snap);

        let prediction = match classifier.predict(&features) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Structured advisor: {}", e);
                return None;
            }
        };

        let Some(priority) = self.buckets.priority_for(prediction.confidence) else {
            tracing::debug!(
                "Structured '{}' below threshold (confidence {:.2})",
                prediction.id, prediction.confidence
            );
            return None;
        };

        Some(Suggestion::new(
            prediction.id,
            prediction.text,
            priority,
            Source::Structured,
            prediction.requires_combat,
            snap.timestamp_ms,
        ))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{Economy, Weapon};

    /// Returns a canned prediction regardless of input.
    struct Fixed(f32);

    impl Classifier for Fixed {
        fn predict(&self, _: &FeatureVector) -> Result<Prediction, AdvisorError> {
            Ok(Prediction {
                id:              "reload".into(),
                text:            "Reload now".into(),
                requires_combat: true,
                confidence:      self.0,
            })
        }
    }

    struct Broken;

    impl Classifier for Broken {
        fn predict(&self, _: &FeatureVector) -> Result<Prediction, AdvisorError> {
            Err(AdvisorError::Inference("tensor shape".into()))
        }
    }

    fn advisor(c: impl Classifier + 'static) -> StructuredAdvisor {
        StructuredAdvisor::new(Arc::new(c), PriorityBuckets::default())
    }

    fn row(hot: usize, weight: f32) -> Vec<f32> {
        let mut w = vec![0.0; FEATURE_COUNT];
        w[hot] = weight;
        w
    }

    #[test]
    fn confidence_maps_to_buckets() {
        let snap = Snapshot { timestamp_ms: 7, ..Default::default() };
        assert!(advisor(Fixed(0.3)).infer(&snap).is_none());

        let medium = advisor(Fixed(0.65)).infer(&snap).unwrap();
        assert_eq!(medium.priority, 60);
        assert_eq!(medium.source, Source::Structured);
        assert!(medium.requires_combat);
        assert_eq!(medium.produced_at_ms, 7);

        assert_eq!(advisor(Fixed(0.93)).infer(&snap).unwrap().priority, 75);
    }

    #[test]
    fn nan_confidence_yields_nothing() {
        assert!(advisor(Fixed(f32::NAN)).infer(&Snapshot::default()).is_none());
    }

    #[test]
    fn inference_error_yields_nothing() {
        assert!(advisor(Broken).infer(&Snapshot::default()).is_none());
    }

    #[test]
    fn unavailable_advisor_is_silent() {
        let a = StructuredAdvisor::unavailable(PriorityBuckets::default());
        assert!(!a.is_available());
        assert!(a.infer(&Snapshot { in_combat: true, ..Default::default() }).is_none());
    }

    #[test]
    fn builds_feature_vector() {
        let mut snap = Snapshot {
            in_combat:       true,
            equipped_weapon: Some(Weapon::Operator),
            economy:         Economy { credits: Some(4_500), round_phase: Some(RoundPhase::Early) },
            health:          Some(50),
            ..Default::default()
        };
        snap.abilities.insert("Q".into(), true);
        snap.abilities.insert("E".into(), false);
        snap.flags.insert("exposed".into(), true);
        snap.flags.insert("site_control".into(), false);

        let f = FeatureVector::from_snapshot(&snap).0;
        assert_eq!(f[0], 1.0);
        assert_eq!(f[1], 0.0);
        assert_eq!(f[2], 1.0);
        assert_eq!(&f[3..6], &[0.0, 0.0, 1.0]);
        assert_eq!(&f[6..10], &[0.0, 1.0, 0.0, 0.0]);
        assert_eq!(f[10], 0.5);
        assert_eq!(f[11], 0.0);
        assert_eq!(f[12], 0.5);
        assert_eq!(&f[13..17], &[0.0, 0.0, 0.0, 1.0]);
        assert_eq!(f[18], 0.0);
    }

    #[test]
    fn linear_model_picks_highest_logit() {
        let raw = serde_json::json!({
            "classes": [
                { "id": "push", "text": "Push", "weights": row(0, 4.0) },
                { "id": "hold", "text": "Hold", "weights": row(2, 4.0), "requires_combat": true },
            ]
        })
        .to_string();
        let model = LinearClassifier::from_json(&raw).unwrap();

        let mut snap = Snapshot::default();
        snap.flags.insert("exposed".into(), true);
        let p = model.predict(&FeatureVector::from_snapshot(&snap)).unwrap();
        assert_eq!(p.id, "hold");
        assert!(p.requires_combat);
        // logits 0 vs 4 → softmax ≈ 0.982
        assert!(p.confidence > 0.98 && p.confidence < 0.99);
    }

    #[test]
    fn shape_mismatch_is_model_unavailable() {
        let raw = r#"{ "classes": [ { "id": "x", "text": "x", "weights": [1.0, 2.0] } ] }"#;
        assert!(matches!(
            LinearClassifier::from_json(raw),
            Err(AdvisorError::ModelUnavailable(_))
        ));
        assert!(matches!(
            LinearClassifier::from_json(r#"{ "classes": [] }"#),
            Err(AdvisorError::ModelUnavailable(_))
        ));
        assert!(LinearClassifier::from_json("not json").is_err());
    }

    #[test]
    fn embedded_valorant_model_loads_and_favours_aim_in_combat() {
        let model = LinearClassifier::embedded("valorant").unwrap().unwrap();
        let snap = Snapshot {
            in_combat:       true,
            equipped_weapon: Some(Weapon::Vandal),
            ..Default::default()
        };
        let p = model.predict(&FeatureVector::from_snapshot(&snap)).unwrap();
        assert_eq!(p.id, "ml_aim");
        assert!(p.requires_combat);
        assert!(LinearClassifier::embedded("tetris").is_none());
    }

    #[test]
    fn missing_model_file_leaves_advisor_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = AppConfig {
            structured_model_path: dir.path().join("nope.json"),
            ..Default::default()
        };
        assert!(!StructuredAdvisor::from_config(&cfg).is_available());
        assert!(StructuredAdvisor::from_config(&AppConfig::default()).is_available());
    }
}
