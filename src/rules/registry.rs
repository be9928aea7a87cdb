/// Rule registry: static configuration loaded once at startup.
///
/// Per-game registries are embedded at compile time from `data/rules/*.toml`;
/// a user file (`AppConfig.rule_registry_path`) replaces the embedded one.
///
/// File shape:
///
///   [[rule]]
///   id       = "use_ability_q"
///   text     = "Use your Q ability for tactical advantage"
///   priority = 80
///   when     = { all = [ { field = "in_combat", value = true },
///                        { field = "ability.Q", value = true } ] }
///
/// Leaves are `{ field, op, value }` with `op` defaulting to `eq`; nodes are
/// `{ all = [..] }`, `{ any = [..] }` and `{ not = .. }`. A rule without
/// `when` always fires. `requires_combat` may be set explicitly; otherwise it
/// is inferred from the predicate.
use super::predicate::{CmpOp, Condition, Field, Literal, Predicate};
use crate::config::AppConfig;
use crate::error::RuleError;
use crate::suggestion::MAX_PRIORITY;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

// ---------------------------------------------------------------------------
// Embedded TOML data
// ---------------------------------------------------------------------------

const VALORANT: &str = include_str!("../../data/rules/valorant.toml");
const CSGO:     &str = include_str!("../../data/rules/csgo.toml");
const DOTA2:    &str = include_str!("../../data/rules/dota2.toml");

static EMBEDDED: &[(&str, &str)] = &[
    ("valorant", VALORANT),
    ("csgo",     CSGO),
    ("dota2",    DOTA2),
];

// ---------------------------------------------------------------------------
// TOML deserialization structs (private)
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegistryFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RawRule>,
}

#[derive(Deserialize)]
struct RawRule {
    id:              String,
    text:            String,
    priority:        u32,
    #[serde(default)]
    requires_combat: Option<bool>,
    #[serde(default)]
    when:            Option<RawPredicate>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPredicate {
    All { all: Vec<RawPredicate> },
    Any { any: Vec<RawPredicate> },
    Not { not: Box<RawPredicate> },
    Leaf {
        field: String,
        #[serde(default)]
        op:    CmpOp,
        value: Literal,
    },
}

fn compile(raw: RawPredicate, rule_id: &str) -> Result<Predicate, RuleError> {
    let compile_all = |children: Vec<RawPredicate>| {
        children
            .into_iter()
            .map(|c| compile(c, rule_id))
            .collect::<Result<Vec<_>, _>>()
    };
    Ok(match raw {
        RawPredicate::All { all } => Predicate::All(compile_all(all)?),
        RawPredicate::Any { any } => Predicate::Any(compile_all(any)?),
        RawPredicate::Not { not } => Predicate::Not(Box::new(compile(*not, rule_id)?)),
        RawPredicate::Leaf { field, op, value } => {
            let parsed = Field::parse(&field).ok_or_else(|| RuleError::UnknownField {
                id:   rule_id.to_owned(),
                path: field.clone(),
            })?;
            Predicate::Leaf(Condition::new(parsed, op, value))
        }
    })
}

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RuleDefinition {
    pub id:              String,
    /// Text template; `{field.path}` placeholders are filled per snapshot.
    pub text:            String,
    pub priority:        u8,
    pub requires_combat: bool,
    pub predicate:       Predicate,
}

/// Ordered, validated set of rules. Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<RuleDefinition>,
}

impl RuleRegistry {
    /// Parse and validate a registry file body.
    pub fn from_toml(raw: &str) -> Result<Self, RuleError> {
        let file: RegistryFile = toml::from_str(raw)?;
        let mut seen = HashSet::new();
        let mut rules = Vec::with_capacity(file.rules.len());

        for (index, rule) in file.rules.into_iter().enumerate() {
            let id = rule.id.trim().to_owned();
            if id.is_empty() {
                return Err(RuleError::EmptyId { index });
            }
            if !seen.insert(id.clone()) {
                return Err(RuleError::DuplicateId(id));
            }
            if rule.priority > u32::from(MAX_PRIORITY) {
                return Err(RuleError::PriorityOutOfRange { id, priority: rule.priority });
            }
            if rule.text.trim().is_empty() {
                return Err(RuleError::EmptyText(id));
            }

            let predicate = match rule.when {
                Some(raw) => compile(raw, &id)?,
                None      => Predicate::always(),
            };
            let requires_combat = rule
                .requires_combat
                .unwrap_or_else(|| predicate.implies_combat());

            rules.push(RuleDefinition {
                id,
                text: rule.text,
                priority: rule.priority as u8,
                requires_combat,
                predicate,
            });
        }
        Ok(Self { rules })
    }

    pub fn from_file(path: &Path) -> Result<Self, RuleError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    /// Embedded registry for `game` (case-insensitive).
    pub fn embedded(game: &str) -> Result<Self, RuleError> {
        let (_, raw) = EMBEDDED
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(game.trim()))
            .ok_or_else(|| RuleError::UnknownGame(game.to_owned()))?;
        Self::from_toml(raw)
    }

    /// User file if configured and valid, else the embedded registry for
    /// the configured game, else an empty registry. Never fails.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let path = &cfg.rule_registry_path;
        if !path.as_os_str().is_empty() {
            match Self::from_file(path) {
                Ok(reg) => {
                    tracing::info!("Loaded {} rules from {:?}", reg.len(), path);
                    return reg;
                }
                Err(e) => tracing::error!(
                    "Rule registry {:?} rejected: {} — falling back to embedded '{}' rules",
                    path, e, cfg.game
                ),
            }
        }
        match Self::embedded(&cfg.game) {
            Ok(reg) => {
                tracing::info!("Loaded {} embedded '{}' rules", reg.len(), cfg.game);
                reg
            }
            Err(e) => {
                tracing::error!("{} (available: {}) — running without rules", e, Self::games().join(", "));
                Self::default()
            }
        }
    }

    /// Games with an embedded registry.
    pub fn games() -> Vec<&'static str> {
        EMBEDDED.iter().map(|(name, _)| *name).collect()
    }

    pub fn rules(&self) -> &[RuleDefinition] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Lowest priority among combat-gated rules, if any exist.
    pub fn combat_gated_floor(&self) -> Option<u8> {
        self.rules
            .iter()
            .filter(|r| r.requires_combat)
            .map(|r| r.priority)
            .min()
    }
}
