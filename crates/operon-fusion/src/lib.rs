//! Fusion tracker: counts consecutive pathway successes with an identical
//! allele composition and drives the fuse/decompose cycle. State is written
//! through to the phenotype map and mirrored to `fusion_tracker.json`.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use operon_phenotype::{PhenotypeError, PhenotypeMap};

pub type Digest = String;

pub const FUSION_THRESHOLD: u64 = 10;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FusionState {
    #[serde(default)]
    pub composition: Vec<Digest>,
    #[serde(default)]
    pub consecutive_successes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_allele: Option<Digest>,
    /// Latch preventing duplicate fuse requests while one is outstanding.
    #[serde(default)]
    pub fuse_requested: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FusionSignal {
    /// Reinforcement crossed the threshold: ask the mutation driver for a
    /// single consolidated allele.
    FuseRequest {
        pathway: String,
        composition: Vec<Digest>,
    },
    /// A fused allele failed and was cleared; the pathway returns to its
    /// decomposed step form. Constituent alleles remain in the registry.
    Decomposed {
        pathway: String,
        fused_allele: Digest,
    },
}

#[derive(Debug, Error)]
pub enum FusionError {
    #[error("fusion tracker I/O error: {0}")]
    Io(String),
    #[error("fusion tracker serialization error: {0}")]
    Serde(String),
    #[error(transparent)]
    Phenotype(#[from] PhenotypeError),
    #[error("fusion tracker lock poisoned")]
    Poisoned,
}

fn io_err(err: io::Error) -> FusionError {
    FusionError::Io(err.to_string())
}

pub struct FusionTracker {
    path: PathBuf,
    phenotype: Arc<PhenotypeMap>,
    threshold: u64,
    states: Mutex<BTreeMap<String, FusionState>>,
}

impl FusionTracker {
    /// Load the mirror at `path` (conventionally `<root>/fusion_tracker.json`),
    /// starting empty when absent.
    pub fn open<P: Into<PathBuf>>(
        path: P,
        phenotype: Arc<PhenotypeMap>,
    ) -> Result<Self, FusionError> {
        let path = path.into();
        let states = if path.exists() {
            let bytes = fs::read(&path).map_err(io_err)?;
            serde_json::from_slice(&bytes).map_err(|err| FusionError::Serde(err.to_string()))?
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            phenotype,
            threshold: FUSION_THRESHOLD,
            states: Mutex::new(states),
        })
    }

    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn state(&self, pathway: &str) -> Result<FusionState, FusionError> {
        let states = self.states.lock().map_err(|_| FusionError::Poisoned)?;
        Ok(states.get(pathway).cloned().unwrap_or_default())
    }

    /// Record a decomposed (step-by-step) pathway run.
    pub fn observe(
        &self,
        pathway: &str,
        composition: &[Digest],
        success: bool,
    ) -> Result<Option<FusionSignal>, FusionError> {
        let mut states = self.states.lock().map_err(|_| FusionError::Poisoned)?;
        let state = states.entry(pathway.to_string()).or_default();
        let mut signal = None;

        if success {
            if state.composition == composition {
                state.consecutive_successes += 1;
            } else {
                state.composition = composition.to_vec();
                state.consecutive_successes = 1;
                state.fuse_requested = false;
            }
            if state.consecutive_successes >= self.threshold
                && state.fused_allele.is_none()
                && !state.fuse_requested
            {
                state.fuse_requested = true;
                info!(
                    pathway,
                    successes = state.consecutive_successes,
                    "fusion threshold reached"
                );
                signal = Some(FusionSignal::FuseRequest {
                    pathway: pathway.to_string(),
                    composition: state.composition.clone(),
                });
            }
        } else {
            state.consecutive_successes = 0;
            state.fuse_requested = false;
        }

        self.write_through(pathway, state)?;
        drop(states);
        self.persist()?;
        Ok(signal)
    }

    /// Record a run that went through the fused allele.
    pub fn observe_fused(
        &self,
        pathway: &str,
        success: bool,
    ) -> Result<Option<FusionSignal>, FusionError> {
        let mut states = self.states.lock().map_err(|_| FusionError::Poisoned)?;
        let state = states.entry(pathway.to_string()).or_default();
        let mut signal = None;

        if success {
            state.consecutive_successes += 1;
        } else if let Some(fused) = state.fused_allele.take() {
            state.consecutive_successes = 0;
            state.fuse_requested = false;
            self.phenotype.clear_fusion(pathway)?;
            info!(pathway, fused_allele = %fused, "fused allele failed, decomposing");
            signal = Some(FusionSignal::Decomposed {
                pathway: pathway.to_string(),
                fused_allele: fused,
            });
        } else {
            state.consecutive_successes = 0;
        }

        self.write_through(pathway, state)?;
        drop(states);
        self.persist()?;
        Ok(signal)
    }

    /// A fused allele arrived from the mutation driver: flip the fused slot.
    pub fn install_fused(&self, pathway: &str, digest: &str) -> Result<(), FusionError> {
        let mut states = self.states.lock().map_err(|_| FusionError::Poisoned)?;
        let state = states.entry(pathway.to_string()).or_default();
        state.fused_allele = Some(digest.to_string());
        state.fuse_requested = false;
        self.phenotype.set_fusion(pathway, digest)?;
        self.write_through(pathway, state)?;
        drop(states);
        self.persist()
    }

    fn write_through(&self, pathway: &str, state: &FusionState) -> Result<(), FusionError> {
        self.phenotype.update_pathway(pathway, |entry| {
            entry.reinforcement_count = state.consecutive_successes;
            entry.last_composition = state.composition.clone();
            entry.fused_allele = state.fused_allele.clone();
        })?;
        Ok(())
    }

    fn persist(&self) -> Result<(), FusionError> {
        let states = self.states.lock().map_err(|_| FusionError::Poisoned)?;
        let bytes = serde_json::to_vec_pretty(&*states)
            .map_err(|err| FusionError::Serde(err.to_string()))?;
        drop(states);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(io_err)?;
        fs::rename(&tmp, &self.path).map_err(io_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture(name: &str) -> (FusionTracker, Arc<PhenotypeMap>) {
        let root = std::env::temp_dir().join(format!(
            "operon-fusion-{name}-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let phenotype = Arc::new(PhenotypeMap::open(root.join("phenotype.toml")).unwrap());
        let tracker =
            FusionTracker::open(root.join("fusion_tracker.json"), phenotype.clone()).unwrap();
        (tracker, phenotype)
    }

    fn composition() -> Vec<Digest> {
        vec!["aaa".into(), "bbb".into()]
    }

    #[test]
    fn fuse_request_fires_on_the_tenth_success_not_the_ninth() {
        let (tracker, _) = fixture("threshold");
        for _ in 0..9 {
            assert_eq!(tracker.observe("p", &composition(), true).unwrap(), None);
        }
        let signal = tracker.observe("p", &composition(), true).unwrap();
        assert!(matches!(signal, Some(FusionSignal::FuseRequest { .. })));
    }

    #[test]
    fn fuse_request_is_not_re_emitted_while_outstanding() {
        let (tracker, _) = fixture("latch");
        for _ in 0..10 {
            tracker.observe("p", &composition(), true).unwrap();
        }
        assert_eq!(tracker.observe("p", &composition(), true).unwrap(), None);
    }

    #[test]
    fn composition_change_resets_reinforcement_to_one() {
        let (tracker, _) = fixture("composition");
        for _ in 0..5 {
            tracker.observe("p", &composition(), true).unwrap();
        }
        let changed = vec!["aaa".to_string(), "zzz".to_string()];
        tracker.observe("p", &changed, true).unwrap();
        let state = tracker.state("p").unwrap();
        assert_eq!(state.consecutive_successes, 1);
        assert_eq!(state.composition, changed);
    }

    #[test]
    fn failure_resets_reinforcement() {
        let (tracker, _) = fixture("failure");
        for _ in 0..5 {
            tracker.observe("p", &composition(), true).unwrap();
        }
        tracker.observe("p", &composition(), false).unwrap();
        assert_eq!(tracker.state("p").unwrap().consecutive_successes, 0);
    }

    #[test]
    fn fused_failure_decomposes_and_clears_phenotype() {
        let (tracker, phenotype) = fixture("decompose");
        for _ in 0..10 {
            tracker.observe("p", &composition(), true).unwrap();
        }
        tracker.install_fused("p", "fff").unwrap();
        assert_eq!(
            phenotype.pathway_state("p").unwrap().fused_allele.as_deref(),
            Some("fff")
        );

        let signal = tracker.observe_fused("p", false).unwrap();
        assert_eq!(
            signal,
            Some(FusionSignal::Decomposed {
                pathway: "p".into(),
                fused_allele: "fff".into(),
            })
        );
        let state = tracker.state("p").unwrap();
        assert_eq!(state.fused_allele, None);
        assert_eq!(state.consecutive_successes, 0);
        assert_eq!(phenotype.pathway_state("p").unwrap().fused_allele, None);
    }

    #[test]
    fn mirror_survives_reopen() {
        let root = std::env::temp_dir().join(format!(
            "operon-fusion-reopen-{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&root);
        fs::create_dir_all(&root).unwrap();
        let phenotype = Arc::new(PhenotypeMap::open(root.join("phenotype.toml")).unwrap());
        {
            let tracker =
                FusionTracker::open(root.join("fusion_tracker.json"), phenotype.clone()).unwrap();
            for _ in 0..4 {
                tracker.observe("p", &composition(), true).unwrap();
            }
        }
        let tracker =
            FusionTracker::open(root.join("fusion_tracker.json"), phenotype).unwrap();
        assert_eq!(tracker.state("p").unwrap().consecutive_successes, 4);
    }
}
