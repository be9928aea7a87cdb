/// Immutable game-state snapshot, as produced by the capture process.
///
/// The capture process writes one JSON object per line:
///
///   {"timestamp":1712,"game":"valorant","in_combat":true,
///    "abilities":{"Q":true,"E":false},"equipped_weapon":"vandal",
///    "economy":{"credits":2400,"round_phase":"mid"},
///    "health":72,"armor":25,"flags":{"exposed":true},
///    "frame_path":"C:\\capture\\frame_001712.jpg"}
///
/// Parsing is lenient per field: a wrong type or unknown enum name turns that
/// one field into "unknown" instead of rejecting the snapshot. Only a line
/// that is not an object, or has no numeric `timestamp`, is dropped.
use anyhow::Result;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::{Receiver, Sender};

// ---------------------------------------------------------------------------
// HUD value types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Weapon {
    Knife,
    Classic,
    Shorty,
    Frenzy,
    Ghost,
    Sheriff,
    Stinger,
    Spectre,
    Bucky,
    Judge,
    Bulldog,
    Guardian,
    Phantom,
    Vandal,
    Marshal,
    Outlaw,
    Operator,
    Ares,
    Odin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeaponClass {
    Melee,
    Sidearm,
    Smg,
    Shotgun,
    Rifle,
    Sniper,
    MachineGun,
}

const ALL_WEAPONS: &[Weapon] = &[
    Weapon::Knife,   Weapon::Classic,  Weapon::Shorty,  Weapon::Frenzy,
    Weapon::Ghost,   Weapon::Sheriff,  Weapon::Stinger, Weapon::Spectre,
    Weapon::Bucky,   Weapon::Judge,    Weapon::Bulldog, Weapon::Guardian,
    Weapon::Phantom, Weapon::Vandal,   Weapon::Marshal, Weapon::Outlaw,
    Weapon::Operator, Weapon::Ares,    Weapon::Odin,
];

impl Weapon {
    pub fn name(self) -> &'static str {
        match self {
            Self::Knife    => "knife",
            Self::Classic  => "classic",
            Self::Shorty   => "shorty",
            Self::Frenzy   => "frenzy",
            Self::Ghost    => "ghost",
            Self::Sheriff  => "sheriff",
            Self::Stinger  => "stinger",
            Self::Spectre  => "spectre",
            Self::Bucky    => "bucky",
            Self::Judge    => "judge",
            Self::Bulldog  => "bulldog",
            Self::Guardian => "guardian",
            Self::Phantom  => "phantom",
            Self::Vandal   => "vandal",
            Self::Marshal  => "marshal",
            Self::Outlaw   => "outlaw",
            Self::Operator => "operator",
            Self::Ares     => "ares",
            Self::Odin     => "odin",
        }
    }

    /// Case-insensitive lookup by HUD name.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        ALL_WEAPONS.iter().copied().find(|w| w.name().eq_ignore_ascii_case(name))
    }

    pub fn class(self) -> WeaponClass {
        match self {
            Self::Knife => WeaponClass::Melee,
            Self::Classic | Self::Shorty | Self::Frenzy | Self::Ghost | Self::Sheriff => {
                WeaponClass::Sidearm
            }
            Self::Stinger | Self::Spectre  => WeaponClass::Smg,
            Self::Bucky   | Self::Judge    => WeaponClass::Shotgun,
            Self::Bulldog | Self::Guardian | Self::Phantom | Self::Vandal => WeaponClass::Rifle,
            Self::Marshal | Self::Outlaw   | Self::Operator => WeaponClass::Sniper,
            Self::Ares    | Self::Odin     => WeaponClass::MachineGun,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    Buy,
    Early,
    Mid,
    Late,
}

impl RoundPhase {
    pub fn name(self) -> &'static str {
        match self {
            Self::Buy   => "buy",
            Self::Early => "early",
            Self::Mid   => "mid",
            Self::Late  => "late",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "buy" | "barrier" => Some(Self::Buy),
            "early"           => Some(Self::Early),
            "mid"             => Some(Self::Mid),
            "late"            => Some(Self::Late),
            _                 => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Economy {
    pub credits:     Option<u32>,
    pub round_phase: Option<RoundPhase>,
}

/// Coarse money bands (the "low / medium / high" team-money HUD reading).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditTier {
    Low,
    Medium,
    High,
}

impl Economy {
    pub fn credit_tier(&self) -> Option<CreditTier> {
        self.credits.map(|c| match c {
            0..=1_999     => CreditTier::Low,
            2_000..=3_899 => CreditTier::Medium,
            _             => CreditTier::High,
        })
    }
}

// ---------------------------------------------------------------------------
// Frame handle
// ---------------------------------------------------------------------------

/// Opaque handle to the raw frame a snapshot was read from.
///
/// Only the vision advisor loads the bytes, and only on its blocking worker.
#[derive(Clone)]
pub enum FrameRef {
    /// Image file written by the capture process.
    Path(PathBuf),
    /// Encoded image already in memory.
    Inline(Arc<[u8]>),
}

impl FrameRef {
    pub fn load(&self) -> std::io::Result<Arc<[u8]>> {
        match self {
            Self::Path(path)   => Ok(Arc::from(std::fs::read(path)?)),
            Self::Inline(data) => Ok(Arc::clone(data)),
        }
    }
}

impl std::fmt::Debug for FrameRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Path(path)   => write!(f, "FrameRef::Path({})", path.display()),
            Self::Inline(data) => write!(f, "FrameRef::Inline({} bytes)", data.len()),
        }
    }
}

// Session log stores a reference to the frame, never the pixels.
impl Serialize for FrameRef {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Path(path)   => s.serialize_str(&path.to_string_lossy()),
            Self::Inline(data) => s.serialize_str(&format!("inline:{}B", data.len())),
        }
    }
}

// ---------------------------------------------------------------------------
// Snapshot
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize)]
pub struct Snapshot {
    pub timestamp_ms:    u64,
    /// Title the capture process is attached to ("valorant", "csgo", ...).
    pub game:            String,
    pub in_combat:       bool,
    /// Ability key (upper-cased, e.g. "Q") -> ready.
    pub abilities:       BTreeMap<String, bool>,
    pub equipped_weapon: Option<Weapon>,
    pub economy:         Economy,
    pub health:          Option<u32>,
    pub armor:           Option<u32>,
    /// Free-form boolean HUD readings: exposed, enemy_presence, site_control, ...
    pub flags:           BTreeMap<String, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame:           Option<FrameRef>,
}

impl Snapshot {
    pub fn ability_ready(&self, ability: &str) -> Option<bool> {
        self.abilities.get(ability).copied()
    }

    pub fn flag(&self, name: &str) -> Option<bool> {
        self.flags.get(name).copied()
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

fn as_u32(v: &Value) -> Option<u32> {
    v.as_u64().and_then(|n| u32::try_from(n).ok())
}

/// Keep only entries whose value is a real boolean.
fn bool_map(v: Option<&Value>, upper_keys: bool) -> BTreeMap<String, bool> {
    let Some(obj) = v.and_then(Value::as_object) else {
        return BTreeMap::new();
    };
    obj.iter()
        .filter_map(|(k, v)| {
            let key = if upper_keys { k.trim().to_ascii_uppercase() } else { k.trim().to_owned() };
            v.as_bool().map(|b| (key, b))
        })
        .collect()
}

fn parse_economy(obj: Option<&Map<String, Value>>) -> Economy {
    let Some(obj) = obj else {
        return Economy::default();
    };
    Economy {
        credits:     obj.get("credits").and_then(as_u32),
        round_phase: obj.get("round_phase").and_then(Value::as_str).and_then(RoundPhase::from_name),
    }
}

pub fn parse_line(raw: &str) -> Option<Snapshot> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    let obj = value.as_object()?;
    let timestamp_ms = obj.get("timestamp")?.as_u64()?;

    Some(Snapshot {
        timestamp_ms,
        game:            obj.get("game").and_then(Value::as_str).unwrap_or_default().to_ascii_lowercase(),
        in_combat:       obj.get("in_combat").and_then(Value::as_bool).unwrap_or(false),
        abilities:       bool_map(obj.get("abilities"), true),
        equipped_weapon: obj.get("equipped_weapon").and_then(Value::as_str).and_then(Weapon::from_name),
        economy:         parse_economy(obj.get("economy").and_then(Value::as_object)),
        health:          obj.get("health").and_then(as_u32),
        armor:           obj.get("armor").and_then(as_u32),
        flags:           bool_map(obj.get("flags"), false),
        frame:           obj
            .get("frame_path")
            .and_then(Value::as_str)
            .filter(|p| !p.trim().is_empty())
            .map(|p| FrameRef::Path(PathBuf::from(p))),
    })
}

/// Async feed task: receive raw lines from the tailer, forward parsed snapshots.
pub async fn run(mut rx: Receiver<String>, tx: Sender<Snapshot>) -> Result<()> {
    let mut rejected: u64 = 0;
    while let Some(line) = rx.recv().await {
        match parse_line(&line) {
            Some(snapshot) => {
                if tx.send(snapshot).await.is_err() {
                    break;
                }
            }
            None => {
                rejected += 1;
                tracing::debug!("Rejected snapshot line #{}: {:.80}", rejected, line);
            }
        }
    }
    Ok(())
}
