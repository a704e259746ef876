//! Identify the firmware running on a connected device
//!
//! A [Detector] bundles an optional passive probe, which only looks at bytes
//! already received, and an optional active probe, which may write to the
//! device and wait for an answer. [identify] runs a set of detectors against a
//! [DetectorContext] and picks the most convincing [DetectionResult].

use std::{cmp::Reverse, collections::BTreeMap, fmt, sync::Arc, time::Duration};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::{
    connection::DetectorContext,
    error::{Error, ResultExt},
};

pub mod improv;

/// How sure a detector is about its verdict
///
/// Variants are ordered from least to most certain.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Med,
    High,
}

/// Verdict of a single probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectionResult {
    /// Identifier of the detector which produced this result
    pub id: String,
    /// Display name of the detected firmware or protocol
    pub name: String,
    pub confidence: Confidence,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, String>>,
}

impl DetectionResult {
    pub fn new(id: impl Into<String>, name: impl Into<String>, confidence: Confidence) -> Self {
        DetectionResult {
            id: id.into(),
            name: name.into(),
            confidence,
            details: None,
        }
    }

    pub fn with_details(mut self, details: Option<BTreeMap<String, String>>) -> Self {
        self.details = details;
        self
    }
}

/// Inspects the receive buffer without touching the transport
pub type PassiveProbe = Arc<dyn Fn(&dyn DetectorContext) -> Option<DetectionResult> + Send + Sync>;

/// Talks to the device and waits for an answer
pub type ActiveProbe =
    Arc<dyn Fn(&mut dyn DetectorContext) -> Result<Option<DetectionResult>, Error> + Send + Sync>;

/// A named, prioritized pair of optional probes
#[derive(Clone)]
pub struct Detector {
    id: String,
    name: String,
    priority: i32,
    passive: Option<PassiveProbe>,
    active: Option<ActiveProbe>,
}

impl fmt::Debug for Detector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Detector")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("passive", &self.passive.is_some())
            .field("active", &self.active.is_some())
            .finish()
    }
}

impl Detector {
    /// A detector without any probes; add them with [Detector::with_passive]
    /// and [Detector::with_active]
    pub fn new(id: impl Into<String>, name: impl Into<String>, priority: i32) -> Self {
        Detector {
            id: id.into(),
            name: name.into(),
            priority,
            passive: None,
            active: None,
        }
    }

    pub fn with_passive<F>(mut self, probe: F) -> Self
    where
        F: Fn(&dyn DetectorContext) -> Option<DetectionResult> + Send + Sync + 'static,
    {
        self.passive = Some(Arc::new(probe));
        self
    }

    pub fn with_active<F>(mut self, probe: F) -> Self
    where
        F: Fn(&mut dyn DetectorContext) -> Result<Option<DetectionResult>, Error>
            + Send
            + Sync
            + 'static,
    {
        self.active = Some(Arc::new(probe));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Higher values are probed first and win ties
    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn has_passive(&self) -> bool {
        self.passive.is_some()
    }

    pub fn has_active(&self) -> bool {
        self.active.is_some()
    }

    /// Run the passive probe, if any
    pub fn passive(&self, ctx: &dyn DetectorContext) -> Option<DetectionResult> {
        self.passive.as_ref().and_then(|probe| probe(ctx))
    }

    /// Run the active probe, if any
    pub fn active(&self, ctx: &mut dyn DetectorContext) -> Result<Option<DetectionResult>, Error> {
        match &self.active {
            Some(probe) => probe(ctx).for_detector(&self.id),
            None => Ok(None),
        }
    }
}

/// A result together with the priority of the detector that produced it
struct Candidate {
    result: DetectionResult,
    priority: i32,
}

impl Candidate {
    fn rank(&self) -> (Confidence, i32) {
        (self.result.confidence, self.priority)
    }
}

/// Identify the device behind `ctx`.
///
/// Passive probes run first against whatever is already buffered. Active
/// probes then run one at a time, highest priority first; the first `high`
/// confidence answer ends the search. Otherwise the best result seen in
/// either phase is returned, ranked by confidence then detector priority.
///
/// Bytes already waiting on the transport are collected before the passive
/// phase. A failing active probe is logged and counts as no result.
pub fn identify(
    ctx: &mut dyn DetectorContext,
    detectors: &[Detector],
) -> Option<DetectionResult> {
    collect_pending(ctx);

    let mut best: Option<Candidate> = None;
    let mut consider = |candidate: Candidate| {
        if best
            .as_ref()
            .map_or(true, |current| candidate.rank() > current.rank())
        {
            best = Some(candidate);
        }
    };

    for candidate in run_passive(&*ctx, detectors) {
        consider(candidate);
    }

    for detector in active_order(detectors) {
        let Some(result) = run_active(ctx, detector) else {
            continue;
        };

        if result.confidence == Confidence::High {
            debug!("Detector `{}` answered with high confidence", detector.id);
            return Some(result);
        }

        consider(Candidate {
            result,
            priority: detector.priority,
        });
    }

    best.map(|candidate| candidate.result)
}

/// Run every probe and return all results, best first.
///
/// Unlike [identify] this never stops early, so every active probe gets a
/// turn on the transport.
pub fn identify_all(ctx: &mut dyn DetectorContext, detectors: &[Detector]) -> Vec<DetectionResult> {
    collect_pending(ctx);

    let mut candidates = run_passive(&*ctx, detectors);

    for detector in active_order(detectors) {
        if let Some(result) = run_active(ctx, detector) {
            candidates.push(Candidate {
                result,
                priority: detector.priority,
            });
        }
    }

    candidates.sort_by_key(|candidate| Reverse(candidate.rank()));
    candidates.into_iter().map(|c| c.result).collect()
}

/// Pull whatever the device already sent into the buffer, so passive probes
/// see it. A broken transport is left for the active probes to report.
fn collect_pending(ctx: &mut dyn DetectorContext) {
    if let Err(err) = ctx.idle(Duration::ZERO) {
        debug!("Could not read pending bytes: {err}");
    }
}

fn run_passive(ctx: &dyn DetectorContext, detectors: &[Detector]) -> Vec<Candidate> {
    detectors
        .iter()
        .filter_map(|detector| {
            let result = detector.passive(ctx);
            debug!("Passive probe `{}`: {:?}", detector.id, result);

            result.map(|result| Candidate {
                result,
                priority: detector.priority,
            })
        })
        .collect()
}

/// Detectors with an active probe, highest priority first
fn active_order(detectors: &[Detector]) -> Vec<&Detector> {
    let mut ordered: Vec<_> = detectors.iter().filter(|d| d.has_active()).collect();
    ordered.sort_by_key(|detector| Reverse(detector.priority));
    ordered
}

fn run_active(ctx: &mut dyn DetectorContext, detector: &Detector) -> Option<DetectionResult> {
    match detector.active(ctx) {
        Ok(result) => {
            debug!("Active probe `{}`: {:?}", detector.id, result);
            result
        }
        Err(err) => {
            warn!("{:?}", miette::Report::new(err));
            None
        }
    }
}

/// Poll `check` every `interval` until it yields a value or `timeout` has
/// elapsed on the context's clock.
///
/// The buffer is checked before each wait and once more at the deadline, so
/// a value already present is returned without idling and bytes received
/// during the final wait are not lost.
pub fn wait_for<T>(
    ctx: &mut dyn DetectorContext,
    timeout: Duration,
    interval: Duration,
    mut check: impl FnMut(&dyn DetectorContext) -> Option<T>,
) -> Result<Option<T>, Error> {
    let deadline = ctx.now() + timeout;

    while ctx.now() < deadline {
        if let Some(found) = check(&*ctx) {
            return Ok(Some(found));
        }
        ctx.idle(interval)?;
    }

    // Bytes collected by the last idle still count
    Ok(check(&*ctx))
}
