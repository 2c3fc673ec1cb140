//! # Admission policy engine
//!
//! ## Responsibility
//! Hold the latest telemetry sample and the verdict derived from it for every
//! [`WorkerIdentity`], and answer "may this identity take work right now?".
//!
//! ## Guarantees
//! - Fail-closed: no sample, or a verdict older than the freshness window,
//!   reads as [`Verdict::Unknown`], which callers treat as reject
//! - Consistent: sample and verdict live under one per-identity lock, so no
//!   reader ever observes a sample paired with another sample's verdict
//! - Independent: identities never contend beyond a sharded map lookup
//! - Deterministic: the same sample and thresholds always give the same verdict
//!
//! ## NOT Responsible For
//! - Range-checking samples (that belongs to `telemetry`)
//! - Request lifecycle (that belongs to `store`)

use crate::telemetry::{SampleReading, TelemetrySample};
use crate::WorkerIdentity;
use dashmap::DashMap;
use parking_lot::RwLock;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Static capacity thresholds. A sample is admitted when every reading is at
/// or below its limit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Thresholds {
    /// `U_max`: highest admissible GPU utilization, in `[0, 1]`.
    pub max_gpu_utilization: f64,
    /// `P_max`: highest admissible power draw, in watts.
    pub max_power_draw_w: f64,
    /// `V_max`: highest admissible VRAM usage, in `[0, 1]`.
    pub max_vram_usage: f64,
}

impl Thresholds {
    /// Evaluate `reading` against the thresholds.
    pub fn admits(&self, reading: &SampleReading) -> bool {
        reading.gpu_utilization <= self.max_gpu_utilization
            && reading.power_draw <= self.max_power_draw_w
            && reading.vram_usage <= self.max_vram_usage
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            max_gpu_utilization: 0.9,
            max_power_draw_w: 300.0,
            max_vram_usage: 0.95,
        }
    }
}

/// Admission answer for one identity at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    /// Fresh sample within thresholds.
    Accept,
    /// Fresh sample over at least one threshold.
    Reject,
    /// No sample, or the verdict is older than the freshness window.
    Unknown,
}

impl Verdict {
    /// Only a fresh accept admits. `Unknown` is never an accept.
    pub fn is_accept(self) -> bool {
        matches!(self, Self::Accept)
    }

    /// Metric label.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accept => "accept",
            Self::Reject => "reject",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy)]
struct ComputedVerdict {
    accept: bool,
    computed_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    sample: TelemetrySample,
    verdict: ComputedVerdict,
}

/// Sample and verdict of one identity, read together under one lock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicySnapshot {
    /// Latest stored sample.
    pub sample: TelemetrySample,
    /// Raw verdict computed from `sample`, ignoring freshness.
    pub accept: bool,
    /// When the verdict was computed. Equals the sample's arrival instant.
    pub computed_at: Instant,
    /// Verdict as reported at snapshot time, freshness applied.
    pub verdict: Verdict,
}

/// Per-identity latest sample and verdict, with freshness-aware lookup.
///
/// The outer map is only locked long enough to find or create a slot; all
/// reads and writes of a slot's contents go through that slot's own lock.
pub struct AdmissionPolicy {
    thresholds: Thresholds,
    freshness: Duration,
    slots: DashMap<WorkerIdentity, Arc<RwLock<Option<Slot>>>>,
}

impl AdmissionPolicy {
    /// Create an engine with the given thresholds and freshness window `F`.
    pub fn new(thresholds: Thresholds, freshness: Duration) -> Self {
        Self {
            thresholds,
            freshness,
            slots: DashMap::new(),
        }
    }

    /// Configured thresholds.
    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Configured freshness window.
    pub fn freshness_window(&self) -> Duration {
        self.freshness
    }

    /// Run `f` on the slot of `identity` under its write lock, creating the
    /// slot if needed. The map guard is held for the duration so eviction
    /// cannot detach the slot mid-write.
    fn write_slot<R>(
        &self,
        identity: &WorkerIdentity,
        f: impl FnOnce(&mut Option<Slot>) -> R,
    ) -> R {
        if let Some(slot) = self.slots.get(identity) {
            let mut guard = slot.value().write();
            return f(&mut guard);
        }
        let slot = self.slots.entry(identity.clone()).or_default();
        let mut guard = slot.value().write();
        f(&mut guard)
    }

    fn existing_slot(&self, identity: &WorkerIdentity) -> Option<Arc<RwLock<Option<Slot>>>> {
        self.slots.get(identity).map(|s| Arc::clone(s.value()))
    }

    fn compute(&self, sample: &TelemetrySample) -> ComputedVerdict {
        ComputedVerdict {
            accept: self.thresholds.admits(&sample.reading),
            // A verdict is never fresher than the sample it came from.
            computed_at: sample.arrived_at,
        }
    }

    fn report(&self, verdict: &ComputedVerdict) -> Verdict {
        let age = Instant::now().saturating_duration_since(verdict.computed_at);
        if age > self.freshness {
            Verdict::Unknown
        } else if verdict.accept {
            Verdict::Accept
        } else {
            Verdict::Reject
        }
    }

    /// Store `sample` for `identity` (last write wins) and recompute its
    /// verdict in the same exclusive section. Returns the resulting verdict.
    pub fn record(&self, identity: &WorkerIdentity, sample: TelemetrySample) -> Verdict {
        let verdict = self.compute(&sample);
        let reported = self.write_slot(identity, |slot| {
            *slot = Some(Slot { sample, verdict });
            self.report(&verdict)
        });

        debug!(
            client_key = %identity.client_key,
            model = %identity.model,
            accept = verdict.accept,
            verdict = %reported,
            "verdict recomputed"
        );
        reported
    }

    /// Re-derive the verdict for `identity` from its stored sample.
    ///
    /// Returns the raw accept flag, or `None` when no sample is stored.
    pub fn recompute(&self, identity: &WorkerIdentity) -> Option<bool> {
        let slot = self.existing_slot(identity)?;
        let mut guard = slot.write();
        let current = guard.as_mut()?;
        current.verdict = self.compute(&current.sample);
        Some(current.verdict.accept)
    }

    /// Current verdict for `identity`, freshness applied.
    pub fn verdict(&self, identity: &WorkerIdentity) -> Verdict {
        let Some(slot) = self.existing_slot(identity) else {
            return Verdict::Unknown;
        };
        let guard = slot.read();
        match guard.as_ref() {
            Some(current) => self.report(&current.verdict),
            None => Verdict::Unknown,
        }
    }

    /// Sample and verdict of `identity` read under one lock.
    pub fn snapshot(&self, identity: &WorkerIdentity) -> Option<PolicySnapshot> {
        let slot = self.existing_slot(identity)?;
        let guard = slot.read();
        let current = guard.as_ref()?;
        Some(PolicySnapshot {
            sample: current.sample,
            accept: current.verdict.accept,
            computed_at: current.verdict.computed_at,
            verdict: self.report(&current.verdict),
        })
    }

    /// Drop identities whose latest sample is older than `age`.
    ///
    /// Evicted identities read as `Unknown`, as they would anyway once past
    /// the freshness window. Runs under each shard's write lock, so it never
    /// interleaves with [`record`](Self::record) on the same identity.
    /// Returns the number of slots removed.
    pub fn evict_older_than(&self, age: Duration) -> usize {
        let now = Instant::now();
        let before = self.slots.len();
        self.slots.retain(|_, slot| match slot.try_read() {
            Some(guard) => match guard.as_ref() {
                Some(current) => now.saturating_duration_since(current.sample.arrived_at) <= age,
                None => false,
            },
            // A writer is active; the slot is live.
            None => true,
        });
        before.saturating_sub(self.slots.len())
    }

    /// Number of identities with a slot.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns `true` if no identity has reported.
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
