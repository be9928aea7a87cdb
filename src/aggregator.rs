/// Aggregator: merges the three advisory sources into one ranked list.
///
/// Per cycle:
///   1. concatenate rule, structured and vision output
///   2. gate: drop combat-only suggestions outside combat, drop blank text
///   3. dedup: keep the strongest instance of each semantic key
///   4. rank: priority desc → source precedence → earliest produced_at →
///      shown last cycle → concatenation order
///   5. truncate to top K
///
/// `merge` is a pure function; the previous result it uses for tie-breaking
/// is an explicit argument. `Aggregator` owns that one piece of cross-cycle
/// state and is driven by a single task.
use crate::config::{AppConfig, DedupPolicy};
use crate::snapshot::Snapshot;
use crate::suggestion::{Suggestion, MAX_PRIORITY};
use serde::Serialize;
use std::cmp::Reverse;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RankedResult {
    /// Timestamp of the snapshot this result was computed for.
    pub timestamp_ms: u64,
    pub entries:      Vec<Suggestion>,
}

impl RankedResult {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Same suggestions in the same order, ignoring production timestamps.
    pub fn same_entries(&self, other: &RankedResult) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().zip(&other.entries).all(|(a, b)| {
                a.id == b.id && a.text == b.text && a.priority == b.priority && a.source == b.source
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeSettings {
    pub top_k: usize,
    pub dedup: DedupPolicy,
}

// ---------------------------------------------------------------------------
// Merge
// ---------------------------------------------------------------------------

struct Candidate {
    order: usize,
    key:   String,
    item:  Suggestion,
}

fn same_key(policy: DedupPolicy, a_id: &str, a_key: &str, b_id: &str, b_key: &str) -> bool {
    match policy {
        DedupPolicy::Id       => a_id == b_id,
        DedupPolicy::Text     => a_key == b_key,
        DedupPolicy::IdOrText => a_id == b_id || a_key == b_key,
    }
}

pub fn merge(
    snapshot:   &Snapshot,
    rules:      Vec<Suggestion>,
    structured: Option<Suggestion>,
    vision:     Option<Suggestion>,
    previous:   Option<&RankedResult>,
    settings:   MergeSettings,
) -> RankedResult {
    // 1 + 2. Concatenate and gate.
    let mut candidates: Vec<Candidate> = rules
        .into_iter()
        .chain(structured)
        .chain(vision)
        .enumerate()
        .filter_map(|(order, mut item)| {
            if item.requires_combat && !snapshot.in_combat {
                tracing::warn!(
                    "Dropped combat-only suggestion '{}' from {} outside combat",
                    item.id, item.source.as_str()
                );
                return None;
            }
            let key = item.dedup_key();
            if key.is_empty() {
                tracing::warn!("Dropped blank suggestion '{}' from {}", item.id, item.source.as_str());
                return None;
            }
            if item.priority > MAX_PRIORITY {
                tracing::warn!("Suggestion '{}' priority {} clamped", item.id, item.priority);
                item.priority = MAX_PRIORITY;
            }
            Some(Candidate { order, key, item })
        })
        .collect();

    // 3. Dedup: strongest first, then keep whatever no kept entry covers.
    candidates.sort_by_key(|c| (Reverse(c.item.priority), c.item.source, c.item.produced_at_ms, c.order));
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for c in candidates {
        let covered = kept
            .iter()
            .any(|k| same_key(settings.dedup, &k.item.id, &k.key, &c.item.id, &c.key));
        if !covered {
            kept.push(c);
        }
    }

    // 4. Rank.
    let previous_keys: Vec<(&str, String)> = previous
        .map(|p| p.entries.iter().map(|s| (s.id.as_str(), s.dedup_key())).collect())
        .unwrap_or_default();
    let was_shown = |c: &Candidate| {
        previous_keys
            .iter()
            .any(|(id, key)| same_key(settings.dedup, id, key, &c.item.id, &c.key))
    };
    kept.sort_by_cached_key(|c| {
        (Reverse(c.item.priority), c.item.source, c.item.produced_at_ms, !was_shown(c), c.order)
    });

    // 5. Truncate.
    kept.truncate(settings.top_k);

    RankedResult {
        timestamp_ms: snapshot.timestamp_ms,
        entries:      kept.into_iter().map(|c| c.item).collect(),
    }
}

// ---------------------------------------------------------------------------
// Stateful wrapper
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct Aggregator {
    settings:  MergeSettings,
    /// Use the previous result as a tie-breaker.
    stabilize: bool,
    previous:  Option<RankedResult>,
}

impl Aggregator {
    pub fn new(settings: MergeSettings, stabilize: bool) -> Self {
        Self { settings, stabilize, previous: None }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            MergeSettings { top_k: cfg.top_k, dedup: cfg.dedup_policy },
            cfg.flicker_suppression,
        )
    }

    pub fn previous(&self) -> Option<&RankedResult> {
        self.previous.as_ref()
    }

    /// Merge one cycle's inputs and remember the result for the next cycle.
    pub fn cycle(
        &mut self,
        snapshot:   &Snapshot,
        rules:      Vec<Suggestion>,
        structured: Option<Suggestion>,
        vision:     Option<Suggestion>,
    ) -> RankedResult {
        let previous = if self.stabilize { self.previous.as_ref() } else { None };
        let result = merge(snapshot, rules, structured, vision, previous, self.settings);
        self.previous = Some(result.clone());
        result
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{RuleEngine, RuleRegistry};
    use crate::suggestion::Source;

    fn s(id: &str, text: &str, priority: u8, source: Source, requires_combat: bool) -> Suggestion {
        Suggestion::new(id, text, priority, source, requires_combat, 1_000)
    }

    fn snap(in_combat: bool) -> Snapshot {
        Snapshot { timestamp_ms: 1_000, in_combat, ..Default::default() }
    }

    fn k(top_k: usize) -> MergeSettings {
        MergeSettings { top_k, dedup: DedupPolicy::IdOrText }
    }

    fn ids(r: &RankedResult) -> Vec<&str> {
        r.entries.iter().map(|e| e.id.as_str()).collect()
    }

    /// A wide, deterministic spread of inputs.
    fn mixed_inputs() -> (Vec<Suggestion>, Option<Suggestion>, Option<Suggestion>) {
        let rules = (0..12u32)
            .map(|i| {
                s(
                    &format!("r{}", i),
                    &format!("rule tip {}", i),
                    ((i * 37) % 101) as u8,
                    Source::Rule,
                    i % 3 == 0,
                )
            })
            .collect();
        let structured = Some(s("r4", "model says r4", 90, Source::Structured, true));
        let vision = Some(s("vision", "Vision: rule tip 7", 50, Source::Vision, false));
        (rules, structured, vision)
    }

    #[test]
    fn combat_only_suggestions_never_leak_outside_combat() {
        let (rules, structured, vision) = mixed_inputs();
        let mistagged = Some(s("vision", "Vision: peek now", 30, Source::Vision, true));
        for (st, vi) in [(structured.clone(), vision.clone()), (structured, mistagged)] {
            let out = merge(&snap(false), rules.clone(), st, vi, None, k(50));
            assert!(!out.is_empty());
            assert!(out.entries.iter().all(|e| !e.requires_combat), "{:?}", out);
        }
    }

    #[test]
    fn output_is_bounded_and_ordered() {
        for top_k in 0..8 {
            for in_combat in [true, false] {
                let (rules, structured, vision) = mixed_inputs();
                let out = merge(&snap(in_combat), rules, structured, vision, None, k(top_k));
                assert!(out.len() <= top_k);
                assert!(out.entries.windows(2).all(|w| w[0].priority >= w[1].priority));
            }
        }
    }

    #[test]
    fn merge_is_deterministic() {
        let (rules, structured, vision) = mixed_inputs();
        let prev = RankedResult { timestamp_ms: 0, entries: vec![s("r1", "rule tip 1", 37, Source::Rule, false)] };
        let a = merge(&snap(true), rules.clone(), structured.clone(), vision.clone(), Some(&prev), k(5));
        let b = merge(&snap(true), rules, structured, vision, Some(&prev), k(5));
        assert_eq!(a, b);
    }

    #[test]
    fn rule_only_output_matches_rule_engine_ranking() {
        let engine = RuleEngine::new(RuleRegistry::embedded("valorant").unwrap());
        let mut snapshot = snap(true);
        snapshot.abilities.insert("Q".into(), true);
        snapshot.abilities.insert("E".into(), true);
        snapshot.flags.insert("exposed".into(), true);

        let fired = engine.evaluate(&snapshot);
        let out = merge(&snapshot, fired.clone(), None, None, None, k(3));

        let mut expected = fired;
        expected.sort_by_key(|e| Reverse(e.priority));
        expected.truncate(3);
        assert_eq!(out.entries, expected);
    }

    #[test]
    fn q_ability_scenario() {
        let engine = RuleEngine::new(RuleRegistry::embedded("valorant").unwrap());
        let mut in_fight = snap(true);
        in_fight.abilities.insert("Q".into(), true);
        let out = merge(&in_fight, engine.evaluate(&in_fight), None, None, None, k(3));
        assert_eq!(out.entries[0].id, "use_ability_q");
        assert_eq!(out.entries[0].priority, 80);

        let mut calm = snap(false);
        calm.abilities.insert("Q".into(), true);
        let out = merge(&calm, engine.evaluate(&calm), None, None, None, k(3));
        assert!(!ids(&out).contains(&"use_ability_q"));
    }

    #[test]
    fn rule_and_structured_duplicate_keeps_one() {
        let rule = s("exposed_warning", "You are exposed! Find cover quickly", 60, Source::Rule, false);

        // Equal priority: rule wins on source precedence.
        let model = s("exposed_warning", "Reposition to better cover", 60, Source::Structured, false);
        let out = merge(&snap(true), vec![rule.clone()], Some(model), None, None, k(3));
        assert_eq!(out.len(), 1);
        assert_eq!(out.entries[0].source, Source::Rule);

        // Higher priority instance wins regardless of source.
        let model = s("exposed_warning", "Reposition to better cover", 75, Source::Structured, false);
        let out = merge(&snap(true), vec![rule], Some(model), None, None, k(3));
        assert_eq!(out.len(), 1);
        assert_eq!(out.entries[0].source, Source::Structured);
        assert_eq!(out.entries[0].priority, 75);
    }

    #[test]
    fn dedup_policy_controls_text_matching() {
        let rules = vec![s("a", "Reload NOW!!", 50, Source::Rule, false)];
        let model = Some(s("b", "reload now", 50, Source::Structured, false));

        let out = merge(&snap(true), rules.clone(), model.clone(), None, None, k(3));
        assert_eq!(ids(&out), vec!["a"]);

        let by_id = MergeSettings { top_k: 3, dedup: DedupPolicy::Id };
        let out = merge(&snap(true), rules, model, None, None, by_id);
        assert_eq!(ids(&out), vec!["a", "b"]);
    }

    #[test]
    fn vision_text_folds_into_matching_rule() {
        let rules = vec![s("exposed_warning", "Reposition to better cover", 60, Source::Rule, false)];
        let vision = Some(s("vision", "Vision: reposition to better cover.", 40, Source::Vision, false));

        let text = MergeSettings { top_k: 3, dedup: DedupPolicy::Text };
        let out = merge(&snap(false), rules.clone(), None, vision.clone(), None, text);
        assert_eq!(ids(&out), vec!["exposed_warning"]);

        let out = merge(&snap(false), rules, None, vision, None, k(3));
        assert_eq!(ids(&out), vec!["exposed_warning"]);
    }

    #[test]
    fn ties_break_by_source_then_time_then_previous() {
        let mut late = s("late", "late tip", 50, Source::Rule, false);
        late.produced_at_ms = 2_000;
        let early = s("early", "early tip", 50, Source::Rule, false);
        let model = s("model", "model tip", 50, Source::Structured, false);

        let out = merge(&snap(true), vec![late.clone(), early.clone()], Some(model), None, None, k(5));
        assert_eq!(ids(&out), vec!["early", "late", "model"]);

        let x = s("x", "tip x", 40, Source::Rule, false);
        let y = s("y", "tip y", 40, Source::Rule, false);
        let prev = RankedResult { timestamp_ms: 0, entries: vec![y.clone()] };
        let out = merge(&snap(true), vec![x.clone(), y.clone()], None, None, Some(&prev), k(1));
        assert_eq!(ids(&out), vec!["y"]);
        let out = merge(&snap(true), vec![x, y], None, None, None, k(1));
        assert_eq!(ids(&out), vec!["x"]);
    }

    #[test]
    fn blank_text_is_dropped() {
        let out = merge(&snap(true), vec![s("a", " !! ", 90, Source::Rule, false)], None, None, None, k(3));
        assert!(out.is_empty());
    }

    #[test]
    fn aggregator_remembers_previous_result() {
        let mut agg = Aggregator::new(k(1), true);
        let x = s("x", "tip x", 40, Source::Rule, false);
        let y = s("y", "tip y", 40, Source::Rule, false);

        let first = agg.cycle(&snap(true), vec![y.clone()], None, None);
        assert_eq!(ids(&first), vec!["y"]);
        // Tie with a newcomer: the incumbent stays on screen.
        let second = agg.cycle(&snap(true), vec![x.clone(), y.clone()], None, None);
        assert_eq!(ids(&second), vec!["y"]);
        assert!(agg.previous().unwrap().same_entries(&second));

        let mut plain = Aggregator::new(k(1), false);
        plain.cycle(&snap(true), vec![y.clone()], None, None);
        let out = plain.cycle(&snap(true), vec![x, y], None, None);
        assert_eq!(ids(&out), vec!["x"]);
    }
}
