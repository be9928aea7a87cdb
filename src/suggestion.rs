use serde::{Deserialize, Serialize};

/// Highest value on the common priority scale.
pub const MAX_PRIORITY: u8 = 100;

/// Which advisor produced a suggestion.
///
/// Declaration order is precedence order: on equal priority a rule beats the
/// structured model, which beats the vision model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    Rule,
    Structured,
    Vision,
}

impl Source {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rule       => "rule",
            Self::Structured => "structured",
            Self::Vision     => "vision",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suggestion {
    /// Stable key used for dedup (rule id or model class id).
    pub id:              String,
    pub text:            String,
    /// 0..=100, higher = more urgent.
    pub priority:        u8,
    pub source:          Source,
    pub requires_combat: bool,
    pub produced_at_ms:  u64,
}

impl Suggestion {
    /// Convenience constructor; clamps `priority` onto the 0..=100 scale.
    pub fn new(
        id:              impl Into<String>,
        text:            impl Into<String>,
        priority:        u8,
        source:          Source,
        requires_combat: bool,
        produced_at_ms:  u64,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            priority: priority.min(MAX_PRIORITY),
            source,
            requires_combat,
            produced_at_ms,
        }
    }

    /// Normalised text used for dedup. Vision's display prefix is not part
    /// of the advice, so it is left out of the key.
    pub fn dedup_key(&self) -> String {
        let body = match self.source {
            Source::Vision => self.text.strip_prefix(crate::vision::TEXT_PREFIX).unwrap_or(self.text.as_str()),
            _ => self.text.as_str(),
        };
        normalize_text(body)
    }
}

/// Lower-case, keep alphanumerics, collapse everything else to single spaces.
/// "Reload NOW!!" and "reload now" share a key.
pub fn normalize_text(text: &str) -> String {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}
