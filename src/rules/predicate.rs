/// Predicate trees evaluated against a snapshot.
///
/// Evaluation is three-valued. A leaf whose field is missing or malformed in
/// the snapshot is *unknown*, and unknown propagates:
///   not(unknown)                 = unknown
///   all(..) with a false child   = false, else unknown if any child is unknown
///   any(..) with a true child    = true,  else unknown if any child is unknown
/// A rule only fires on a definite `true`, so a bad HUD reading can never
/// turn a rule on through a negation.
use crate::snapshot::Snapshot;
use serde::Deserialize;
use std::fmt;

// ---------------------------------------------------------------------------
// Field paths
// ---------------------------------------------------------------------------

/// A snapshot field addressable from a rule file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    InCombat,
    Ability(String),
    Weapon,
    Credits,
    RoundPhase,
    Health,
    Armor,
    Flag(String),
    Game,
}

impl Field {
    /// Parse a dotted path: `in_combat`, `ability.Q`, `weapon`,
    /// `economy.credits`, `economy.round_phase`, `health`, `armor`,
    /// `flag.<name>`, `game`.
    pub fn parse(path: &str) -> Option<Self> {
        match path.trim() {
            "in_combat"                          => Some(Self::InCombat),
            "weapon" | "equipped_weapon"         => Some(Self::Weapon),
            "economy.credits" | "credits"        => Some(Self::Credits),
            "economy.round_phase" | "round_phase" => Some(Self::RoundPhase),
            "health"                             => Some(Self::Health),
            "armor"                              => Some(Self::Armor),
            "game"                               => Some(Self::Game),
            other => {
                let (head, tail) = other.split_once('.')?;
                let tail = tail.trim();
                if tail.is_empty() {
                    return None;
                }
                match head {
                    "ability" => Some(Self::Ability(tail.to_ascii_uppercase())),
                    "flag"    => Some(Self::Flag(tail.to_owned())),
                    _         => None,
                }
            }
        }
    }

    /// Current value of this field, or `None` when the HUD did not report it.
    pub fn resolve(&self, snap: &Snapshot) -> Option<Literal> {
        match self {
            Self::InCombat    => Some(Literal::Bool(snap.in_combat)),
            Self::Ability(id) => snap.ability_ready(id).map(Literal::Bool),
            Self::Weapon      => snap.equipped_weapon.map(|w| Literal::Text(w.name().to_owned())),
            Self::Credits     => snap.economy.credits.map(|c| Literal::Number(f64::from(c))),
            Self::RoundPhase  => snap.economy.round_phase.map(|p| Literal::Text(p.name().to_owned())),
            Self::Health      => snap.health.map(|h| Literal::Number(f64::from(h))),
            Self::Armor       => snap.armor.map(|a| Literal::Number(f64::from(a))),
            Self::Flag(name)  => snap.flag(name).map(Literal::Bool),
            Self::Game if snap.game.is_empty() => None,
            Self::Game        => Some(Literal::Text(snap.game.clone())),
        }
    }
}

// ---------------------------------------------------------------------------
// Literals and comparisons
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Literal {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{}", b),
            Self::Number(n) if n.fract() == 0.0 && n.abs() < 1e15 => write!(f, "{}", *n as i64),
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s)   => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CmpOp {
    #[default]
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

/// Compare two literals. Mismatched kinds, ordering on non-numbers, and
/// non-finite numbers are all unknown.
fn compare(actual: &Literal, op: CmpOp, expected: &Literal) -> Option<bool> {
    match (actual, expected) {
        (Literal::Bool(a), Literal::Bool(b)) => match op {
            CmpOp::Eq => Some(a == b),
            CmpOp::Ne => Some(a != b),
            _         => None,
        },
        (Literal::Text(a), Literal::Text(b)) => match op {
            CmpOp::Eq => Some(a.eq_ignore_ascii_case(b)),
            CmpOp::Ne => Some(!a.eq_ignore_ascii_case(b)),
            _         => None,
        },
        (Literal::Number(a), Literal::Number(b)) => {
            if !a.is_finite() || !b.is_finite() {
                return None;
            }
            Some(match op {
                CmpOp::Eq => a == b,
                CmpOp::Ne => a != b,
                CmpOp::Lt => a < b,
                CmpOp::Le => a <= b,
                CmpOp::Gt => a > b,
                CmpOp::Ge => a >= b,
            })
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Predicate tree
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: Field,
    pub op:    CmpOp,
    pub value: Literal,
}

impl Condition {
    pub fn new(field: Field, op: CmpOp, value: Literal) -> Self {
        Self { field, op, value }
    }

    pub fn eval(&self, snap: &Snapshot) -> Option<bool> {
        let actual = self.field.resolve(snap)?;
        compare(&actual, self.op, &self.value)
    }

    /// True when this condition holding means `in_combat == want`.
    fn pins_combat(&self, want: bool) -> bool {
        if self.field != Field::InCombat {
            return false;
        }
        match (self.op, &self.value) {
            (CmpOp::Eq, Literal::Bool(b)) => *b == want,
            (CmpOp::Ne, Literal::Bool(b)) => *b != want,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    All(Vec<Predicate>),
    Any(Vec<Predicate>),
    Not(Box<Predicate>),
    Leaf(Condition),
}

impl Predicate {
    /// Always-true predicate (empty conjunction).
    pub fn always() -> Self {
        Self::All(Vec::new())
    }

    pub fn leaf(field: Field, op: CmpOp, value: Literal) -> Self {
        Self::Leaf(Condition::new(field, op, value))
    }

    pub fn eval(&self, snap: &Snapshot) -> Option<bool> {
        match self {
            Self::Leaf(cond)  => cond.eval(snap),
            Self::Not(inner)  => inner.eval(snap).map(|b| !b),
            Self::All(children) => {
                let mut unknown = false;
                for child in children {
                    match child.eval(snap) {
                        Some(false) => return Some(false),
                        Some(true)  => {}
                        None        => unknown = true,
                    }
                }
                if unknown { None } else { Some(true) }
            }
            Self::Any(children) => {
                let mut unknown = false;
                for child in children {
                    match child.eval(snap) {
                        Some(true)  => return Some(true),
                        Some(false) => {}
                        None        => unknown = true,
                    }
                }
                if unknown { None } else { Some(false) }
            }
        }
    }

    /// Fires only on a definite `true`.
    pub fn holds(&self, snap: &Snapshot) -> bool {
        self.eval(snap) == Some(true)
    }

    /// Whether this predicate can only be satisfied while in combat.
    /// Conservative: `false` means "not provably combat-only".
    pub fn implies_combat(&self) -> bool {
        match self {
            Self::Leaf(cond)    => cond.pins_combat(true),
            Self::All(children) => children.iter().any(Predicate::implies_combat),
            Self::Any(children) => !children.is_empty() && children.iter().all(Predicate::implies_combat),
            Self::Not(inner)    => matches!(inner.as_ref(), Self::Leaf(cond) if cond.pins_combat(false)),
        }
    }
}
