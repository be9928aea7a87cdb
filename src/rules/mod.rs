pub mod predicate;
pub mod registry;

pub use registry::{RuleDefinition, RuleRegistry};

use crate::{
    snapshot::Snapshot,
    suggestion::{Source, Suggestion},
};
use predicate::Field;
use std::sync::Arc;

/// Evaluates every registered rule against a snapshot.
///
/// Pure and cheap: no I/O, no model calls. Output follows registry order and
/// carries each rule's own priority. This is the one source that always runs,
/// even when both model advisors are degraded.
#[derive(Debug, Clone)]
pub struct RuleEngine {
    registry: Arc<RuleRegistry>,
}

impl RuleEngine {
    pub fn new(registry: RuleRegistry) -> Self {
        Self { registry: Arc::new(registry) }
    }

    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    pub fn evaluate(&self, snap: &Snapshot) -> Vec<Suggestion> {
        self.registry
            .rules()
            .iter()
            .filter(|rule| rule.predicate.holds(snap))
            .map(|rule| fire(rule, snap))
            .collect()
    }
}

fn fire(rule: &RuleDefinition, snap: &Snapshot) -> Suggestion {
    Suggestion::new(
        rule.id.as_str(),
        render_template(&rule.text, snap),
        rule.priority,
        Source::Rule,
        rule.requires_combat,
        snap.timestamp_ms,
    )
}

// ---------------------------------------------------------------------------
// Text templates
// ---------------------------------------------------------------------------

/// Substitute `{field.path}` placeholders with snapshot values.
/// Unknown paths and unreported fields render as "unknown"; an unclosed
/// brace is copied through verbatim.
pub fn render_template(template: &str, snap: &Snapshot) -> String {
    let mut out  = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let Some(close) = after.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        let value = Field::parse(&after[..close])
            .and_then(|field| field.resolve(snap))
            .map(|lit| lit.to_string())
            .unwrap_or_else(|| "unknown".to_owned());
        out.push_str(&value);
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
