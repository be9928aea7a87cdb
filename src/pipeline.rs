/// Pipeline driver: one aggregation cycle per snapshot.
///
/// Per cycle:
///   rules       → synchronous, always runs
///   structured  → blocking worker, own timeout, single-flight
///   vision      → blocking worker, own timeout, single-flight (needs a frame)
///   aggregate   → merge + rank + flicker state
///   publish     → every sink independently, never blocking
///
/// `run` drains the snapshot channel: a backlog is coalesced to the newest
/// snapshot and cycles are spaced at least `cycle_interval` apart.
use crate::{
    aggregator::{Aggregator, RankedResult},
    config::AppConfig,
    error::SinkError,
    rules::RuleEngine,
    slot::Slot,
    snapshot::Snapshot,
    structured::StructuredAdvisor,
    vision::VisionAdvisor,
};
use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::Receiver;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// What a cycle hands to its sinks.
#[derive(Debug, Clone)]
pub struct CycleRecord {
    pub snapshot: Arc<Snapshot>,
    pub result:   RankedResult,
}

/// Output seam. `publish` must not block; a slow consumer reports
/// `SinkError::Full` and the record is dropped.
pub trait ResultSink: Send + Sync {
    fn name(&self) -> &'static str;

    fn publish(&self, record: &CycleRecord) -> Result<(), SinkError>;

    /// Skip cycles whose ranked entries match what this sink last accepted.
    fn skip_unchanged(&self) -> bool {
        false
    }
}

/// A sink plus the last result it accepted. A rejected publish leaves
/// `delivered` alone, so the next cycle retries instead of being skipped.
struct SinkSlot {
    sink:      Box<dyn ResultSink>,
    delivered: Option<RankedResult>,
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct DriverSettings {
    pub cycle_interval:      Duration,
    pub structured_timeout:  Duration,
    pub vision_timeout:      Duration,
    pub flicker_suppression: bool,
}

impl DriverSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            cycle_interval:      Duration::from_millis(cfg.cycle_interval_ms),
            structured_timeout:  Duration::from_millis(cfg.structured_timeout_ms),
            vision_timeout:      Duration::from_millis(cfg.vision_timeout_ms),
            flicker_suppression: cfg.flicker_suppression,
        }
    }
}

pub struct Pipeline {
    rules:           RuleEngine,
    structured:      Arc<StructuredAdvisor>,
    structured_slot: Slot,
    vision:          VisionAdvisor,
    aggregator:      Aggregator,
    settings:        DriverSettings,
    sinks:           Vec<SinkSlot>,
}

impl Pipeline {
    pub fn new(
        rules:      RuleEngine,
        structured: StructuredAdvisor,
        vision:     VisionAdvisor,
        aggregator: Aggregator,
        settings:   DriverSettings,
    ) -> Self {
        Self {
            rules,
            structured: Arc::new(structured),
            structured_slot: Slot::new("structured"),
            vision,
            aggregator,
            settings,
            sinks: Vec::new(),
        }
    }

    /// Wire advisors and aggregator from configuration around a loaded rule set.
    pub fn from_config(cfg: &AppConfig, rules: RuleEngine) -> Self {
        let combat_floor = rules.registry().combat_gated_floor();
        Self::new(
            rules,
            StructuredAdvisor::from_config(cfg),
            VisionAdvisor::from_config(cfg, combat_floor),
            Aggregator::from_config(cfg),
            DriverSettings::from_config(cfg),
        )
    }

    pub fn with_sink(mut self, sink: Box<dyn ResultSink>) -> Self {
        self.sinks.push(SinkSlot { sink, delivered: None });
        self
    }

    pub async fn run_cycle(&mut self, snapshot: Arc<Snapshot>) -> RankedResult {
        let rules = self.rules.evaluate(&snapshot);

        let structured = async {
            if !self.structured.is_available() {
                return None;
            }
            let advisor = Arc::clone(&self.structured);
            let snap    = Arc::clone(&snapshot);
            self.structured_slot
                .run(self.settings.structured_timeout, move || advisor.infer(&snap))
                .await
        };
        let vision = async {
            match &snapshot.frame {
                Some(frame) => {
                    self.vision
                        .infer(frame, self.settings.vision_timeout, snapshot.timestamp_ms)
                        .await
                }
                None => None,
            }
        };
        let (structured, vision) = tokio::join!(structured, vision);

        let result = self.aggregator.cycle(&snapshot, rules, structured, vision);

        let record = CycleRecord { snapshot, result };
        self.publish(&record);
        record.result
    }

    fn publish(&mut self, record: &CycleRecord) {
        let suppress = self.settings.flicker_suppression;
        for slot in &mut self.sinks {
            let tracks = suppress && slot.sink.skip_unchanged();
            if tracks
                && slot.delivered.as_ref().is_some_and(|d| d.same_entries(&record.result))
            {
                continue;
            }
            match slot.sink.publish(record) {
                Ok(()) if tracks => slot.delivered = Some(record.result.clone()),
                Ok(()) => {}
                Err(e) => tracing::warn!("Publish to {} failed: {}", slot.sink.name(), e),
            }
        }
    }

    /// Consume snapshots until the feed closes.
    pub async fn run(mut self, mut rx: Receiver<Snapshot>) -> Result<()> {
        tracing::info!(
            "Pipeline running: {} rules, structured={}, vision={}",
            self.rules.registry().len(),
            self.structured.is_available(),
            self.vision.is_enabled()
        );

        let mut cycles: u64 = 0;
        while let Some(mut snapshot) = rx.recv().await {
            let mut stale = 0u32;
            while let Ok(newer) = rx.try_recv() {
                snapshot = newer;
                stale += 1;
            }
            if stale > 0 {
                tracing::debug!("Skipped {} stale snapshots", stale);
            }

            let started = Instant::now();
            let result = self.run_cycle(Arc::new(snapshot)).await;
            cycles += 1;

            let elapsed = started.elapsed();
            tracing::debug!(
                "Cycle {} → {} suggestions in {:?}",
                cycles, result.len(), elapsed
            );
            if elapsed < self.settings.cycle_interval {
                tokio::time::sleep(self.settings.cycle_interval - elapsed).await;
            }
        }

        tracing::info!("Snapshot feed closed after {} cycles — pipeline stopping", cycles);
        Ok(())
    }
}
