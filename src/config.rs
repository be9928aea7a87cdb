/// Application configuration: persisted as TOML in the app config directory.
///
/// Resolution order for the directory:
///   1. `HUD_COACH_HOME` if set
///   2. `%APPDATA%\hud-coach` (the overlay ships on Windows)
///   3. `<temp>\hud-coach`
///
/// The value is built once at startup and handed to each component by
/// reference; nothing reads configuration from global state.
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const APP_DIR_NAME: &str = "hud-coach";

// ---------------------------------------------------------------------------
// Policy types
// ---------------------------------------------------------------------------

/// Monotonic confidence → priority mapping for the structured advisor.
///
///   confidence <  min_confidence               → no suggestion
///   min_confidence <= c < high_confidence      → medium_priority
///   confidence >= high_confidence              → high_priority
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriorityBuckets {
    #[serde(default = "default_min_confidence")]
    pub min_confidence:  f32,
    #[serde(default = "default_high_confidence")]
    pub high_confidence: f32,
    #[serde(default = "default_medium_priority")]
    pub medium_priority: u8,
    #[serde(default = "default_high_priority")]
    pub high_priority:   u8,
}

fn default_min_confidence()  -> f32 { 0.5 }
fn default_high_confidence() -> f32 { 0.8 }
fn default_medium_priority() -> u8  { 60 }
fn default_high_priority()   -> u8  { 75 }

impl Default for PriorityBuckets {
    fn default() -> Self {
        Self {
            min_confidence:  default_min_confidence(),
            high_confidence: default_high_confidence(),
            medium_priority: default_medium_priority(),
            high_priority:   default_high_priority(),
        }
    }
}

impl PriorityBuckets {
    /// Clamp into range and restore ordering so the mapping stays monotonic.
    pub fn normalized(self) -> Self {
        let lo = if self.min_confidence.is_finite() { self.min_confidence.clamp(0.0, 1.0) } else { default_min_confidence() };
        let hi = if self.high_confidence.is_finite() { self.high_confidence.clamp(0.0, 1.0) } else { default_high_confidence() };
        let medium = self.medium_priority.min(100);
        let high   = self.high_priority.min(100);
        Self {
            min_confidence:  lo.min(hi),
            high_confidence: lo.max(hi),
            medium_priority: medium.min(high),
            high_priority:   medium.max(high),
        }
    }

    pub fn priority_for(&self, confidence: f32) -> Option<u8> {
        if !confidence.is_finite() || confidence < self.min_confidence {
            return None;
        }
        if confidence >= self.high_confidence {
            Some(self.high_priority)
        } else {
            Some(self.medium_priority)
        }
    }
}

/// How the aggregator decides two suggestions say the same thing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupPolicy {
    /// Same `id`.
    Id,
    /// Same normalised text.
    Text,
    /// Same `id` or same normalised text.
    #[default]
    IdOrText,
}

// ---------------------------------------------------------------------------
// AppConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Which embedded rule registry / structured model to use.
    #[serde(default = "default_game")]
    pub game: String,

    /// JSON-lines file the capture process appends snapshots to.
    /// Empty = `<config dir>/snapshots.jsonl`.
    #[serde(default)]
    pub snapshot_feed_path: PathBuf,

    /// Minimum spacing between cycles. A backlog is coalesced to the newest snapshot.
    #[serde(default = "default_cycle_interval_ms")]
    pub cycle_interval_ms: u64,

    /// Number of suggestions surfaced per cycle.
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    #[serde(default = "default_structured_timeout_ms")]
    pub structured_timeout_ms: u64,

    #[serde(default = "default_vision_timeout_ms")]
    pub vision_timeout_ms: u64,

    /// User rule registry (TOML). Empty = embedded registry for `game`.
    #[serde(default)]
    pub rule_registry_path: PathBuf,

    /// Linear classifier weights (JSON). Empty = embedded model for `game`.
    #[serde(default)]
    pub structured_model_path: PathBuf,

    /// Vision-language inference endpoint. Empty = vision advisor disabled.
    #[serde(default)]
    pub vision_endpoint: String,

    /// Optional bearer token for the vision endpoint.
    #[serde(default)]
    pub vision_api_token: String,

    /// Fixed priority of vision suggestions (capped below combat-gated rules).
    #[serde(default = "default_vision_priority")]
    pub vision_priority: u8,

    #[serde(default)]
    pub priority_buckets: PriorityBuckets,

    #[serde(default)]
    pub dedup_policy: DedupPolicy,

    /// Keep stable ordering across cycles and skip identical overlay updates.
    #[serde(default = "default_true")]
    pub flicker_suppression: bool,

    /// Suggestions at or above this priority are flagged critical to the overlay.
    #[serde(default = "default_critical_priority")]
    pub critical_priority: u8,

    /// File the overlay process polls. Empty = `<config dir>/overlay.json`.
    #[serde(default)]
    pub overlay_output_path: PathBuf,

    /// SQLite session log. Empty = `<config dir>/sessions.sqlite`.
    #[serde(default)]
    pub session_db_path: PathBuf,
}

fn default_game()                  -> String { "valorant".to_owned() }
fn default_cycle_interval_ms()     -> u64 { 250 }
fn default_top_k()                 -> usize { 3 }
fn default_structured_timeout_ms() -> u64 { 50 }
fn default_vision_timeout_ms()     -> u64 { 1_500 }
fn default_vision_priority()       -> u8 { 40 }
fn default_critical_priority()     -> u8 { 80 }
fn default_true()                  -> bool { true }

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            game:                  default_game(),
            snapshot_feed_path:    PathBuf::new(),
            cycle_interval_ms:     default_cycle_interval_ms(),
            top_k:                 default_top_k(),
            structured_timeout_ms: default_structured_timeout_ms(),
            vision_timeout_ms:     default_vision_timeout_ms(),
            rule_registry_path:    PathBuf::new(),
            structured_model_path: PathBuf::new(),
            vision_endpoint:       String::new(),
            vision_api_token:      String::new(),
            vision_priority:       default_vision_priority(),
            priority_buckets:      PriorityBuckets::default(),
            dedup_policy:          DedupPolicy::default(),
            flicker_suppression:   true,
            critical_priority:     default_critical_priority(),
            overlay_output_path:   PathBuf::new(),
            session_db_path:       PathBuf::new(),
        }
    }
}

impl AppConfig {
    /// Repair values that would break pipeline invariants.
    pub fn sanitized(mut self) -> Self {
        if self.top_k == 0 {
            tracing::warn!("top_k = 0 is not usable — falling back to {}", default_top_k());
            self.top_k = default_top_k();
        }
        self.priority_buckets = self.priority_buckets.normalized();
        self.vision_priority   = self.vision_priority.min(100);
        self.critical_priority = self.critical_priority.min(100);
        self
    }

    pub fn feed_path(&self, config_dir: &Path) -> PathBuf {
        if self.snapshot_feed_path.as_os_str().is_empty() {
            config_dir.join("snapshots.jsonl")
        } else {
            self.snapshot_feed_path.clone()
        }
    }

    pub fn overlay_path(&self, config_dir: &Path) -> PathBuf {
        if self.overlay_output_path.as_os_str().is_empty() {
            config_dir.join("overlay.json")
        } else {
            self.overlay_output_path.clone()
        }
    }

    pub fn db_path(&self, config_dir: &Path) -> PathBuf {
        if self.session_db_path.as_os_str().is_empty() {
            config_dir.join("sessions.sqlite")
        } else {
            self.session_db_path.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

pub fn config_dir() -> PathBuf {
    if let Some(home) = std::env::var_os("HUD_COACH_HOME").filter(|v| !v.is_empty()) {
        return PathBuf::from(home);
    }
    let base = std::env::var("APPDATA")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir());
    base.join(APP_DIR_NAME)
}

pub fn load_or_default(config_dir: &Path) -> Result<AppConfig> {
    let path = config_dir.join("config.toml");
    if path.exists() {
        let raw = std::fs::read_to_string(&path)?;
        let cfg: AppConfig = toml::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("Config parse error: {}", e))?;
        Ok(cfg.sanitized())
    } else {
        Ok(AppConfig::default())
    }
}

pub fn save(config: &AppConfig, config_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(config_dir)?;
    let raw = toml::to_string_pretty(config)
        .map_err(|e| anyhow::anyhow!("Config serialize error: {}", e))?;
    std::fs::write(config_dir.join("config.toml"), raw)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn round_trips_config() {
        let dir = tempdir().unwrap();
        let mut cfg = AppConfig::default();
        cfg.top_k           = 5;
        cfg.game            = "csgo".to_owned();
        cfg.vision_endpoint = "http://127.0.0.1:8080/caption".to_owned();
        cfg.dedup_policy    = DedupPolicy::Text;

        save(&cfg, dir.path()).unwrap();

        let loaded = load_or_default(dir.path()).unwrap();
        assert_eq!(loaded.top_k,           5);
        assert_eq!(loaded.game,            "csgo");
        assert_eq!(loaded.vision_endpoint, "http://127.0.0.1:8080/caption");
        assert_eq!(loaded.dedup_policy,    DedupPolicy::Text);
    }

    #[test]
    fn returns_default_when_missing() {
        let dir = tempdir().unwrap();
        let cfg = load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.top_k, 3);
        assert_eq!(cfg.game, "valorant");
        assert!(cfg.vision_endpoint.is_empty());
        assert_eq!(cfg.overlay_path(dir.path()), dir.path().join("overlay.json"));
        assert_eq!(cfg.feed_path(dir.path()), dir.path().join("snapshots.jsonl"));
        assert_eq!(cfg.db_path(dir.path()), dir.path().join("sessions.sqlite"));
    }

    #[test]
    fn partial_file_fills_defaults_and_sanitizes() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.toml"),
            "top_k = 0\n[priority_buckets]\nmin_confidence = 0.9\nhigh_confidence = 0.6\n",
        )
        .unwrap();
        let cfg = load_or_default(dir.path()).unwrap();
        assert_eq!(cfg.top_k, 3);
        assert_eq!(cfg.vision_timeout_ms, 1_500);
        assert_eq!(cfg.priority_buckets.min_confidence, 0.6);
        assert_eq!(cfg.priority_buckets.high_confidence, 0.9);
        assert_eq!(cfg.priority_buckets.medium_priority, 60);
    }

    #[test]
    fn rejects_unparsable_config() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("config.toml"), "top_k = \"many\"").unwrap();
        assert!(load_or_default(dir.path()).is_err());
    }

    #[test]
    fn buckets_are_monotonic() {
        let b = PriorityBuckets::default();
        assert_eq!(b.priority_for(0.49), None);
        assert_eq!(b.priority_for(0.5),  Some(60));
        assert_eq!(b.priority_for(0.79), Some(60));
        assert_eq!(b.priority_for(0.8),  Some(75));
        assert_eq!(b.priority_for(1.0),  Some(75));
        assert_eq!(b.priority_for(f32::NAN), None);
    }
}
