//! The arena: central scoring and lifecycle authority. Every invocation is
//! recorded as an observation; after each observation the arena re-evaluates
//! promotion, demotion, and regression for the locus under that locus's lock,
//! rewriting the phenotype entry when a decision lands.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use operon_phenotype::{PhenotypeError, PhenotypeMap};
use operon_registry::{
    AlleleState, Digest, Registry, RegistryError, SlotState, Timescale,
};

#[derive(Clone, Debug)]
pub struct ArenaConfig {
    pub promotion_advantage: f64,
    pub promotion_min_invocations: u64,
    pub demotion_consecutive_failures: u32,
    pub regression_threshold: f64,
    pub severe_regression: f64,
    pub regression_min_invocations: u64,
    pub convergence_window: Duration,
    pub resilience_window: Duration,
    pub peer_weight: f64,
    pub peer_min_invocations: u64,
    pub deprecate_after: Duration,
    pub regression_log_limit: usize,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            promotion_advantage: 0.1,
            promotion_min_invocations: 50,
            demotion_consecutive_failures: 3,
            regression_threshold: 0.2,
            severe_regression: 0.4,
            regression_min_invocations: 10,
            convergence_window: Duration::from_secs(30),
            resilience_window: Duration::from_secs(3600),
            peer_weight: 0.3,
            peer_min_invocations: 10,
            deprecate_after: Duration::from_secs(7 * 24 * 3600),
            regression_log_limit: 100,
        }
    }
}

/// Which temporal slots an observation opens as pending.
#[derive(Clone, Copy, Debug, Default)]
pub struct TemporalTracking {
    pub convergence: bool,
    pub resilience: bool,
}

/// Handle for resolving a recorded observation's temporal slots later.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservationTicket {
    pub locus: String,
    pub digest: Digest,
    pub observation_id: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ArenaEvent {
    Promoted {
        locus: String,
        digest: Digest,
        displaced: Option<Digest>,
    },
    Demoted {
        locus: String,
        digest: Digest,
        new_dominant: Option<Digest>,
    },
    LocusExhausted {
        locus: String,
        last_digest: Digest,
    },
    MildRegression {
        locus: String,
        digest: Digest,
        drop: f64,
    },
    SevereRegression {
        locus: String,
        digest: Digest,
        drop: f64,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegressionEntry {
    pub timestamp: DateTime<Utc>,
    pub locus: String,
    pub digest: Digest,
    pub severity: String,
    pub peak: f64,
    pub current: f64,
}

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Phenotype(#[from] PhenotypeError),
    #[error("arena I/O error: {0}")]
    Io(String),
    #[error("arena lock poisoned")]
    Poisoned,
}

#[derive(Default)]
struct PeakHistory {
    peaks: HashMap<Digest, f64>,
}

pub struct Arena {
    registry: Arc<Registry>,
    phenotype: Arc<PhenotypeMap>,
    config: ArenaConfig,
    locus_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    peaks: Mutex<PeakHistory>,
    regression_log: Option<PathBuf>,
}

impl Arena {
    pub fn new(registry: Arc<Registry>, phenotype: Arc<PhenotypeMap>) -> Self {
        Self::with_config(registry, phenotype, ArenaConfig::default())
    }

    pub fn with_config(
        registry: Arc<Registry>,
        phenotype: Arc<PhenotypeMap>,
        config: ArenaConfig,
    ) -> Self {
        Self {
            registry,
            phenotype,
            config,
            locus_locks: Mutex::new(HashMap::new()),
            peaks: Mutex::new(PeakHistory::default()),
            regression_log: None,
        }
    }

    /// Persist regression entries to the given file (`.sg/regression.json`).
    pub fn with_regression_log(mut self, path: PathBuf) -> Self {
        self.regression_log = Some(path);
        self
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    fn locus_lock(&self, locus: &str) -> Result<Arc<Mutex<()>>, ArenaError> {
        let mut locks = self.locus_locks.lock().map_err(|_| ArenaError::Poisoned)?;
        Ok(locks
            .entry(locus.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Record an invocation outcome and run the lifecycle rules for the
    /// locus. Returns the observation ticket plus any decisions taken.
    pub fn record(
        &self,
        locus: &str,
        digest: &str,
        immediate_ok: bool,
        tracking: TemporalTracking,
    ) -> Result<(ObservationTicket, Vec<ArenaEvent>), ArenaError> {
        let lock = self.locus_lock(locus)?;
        let _guard = lock.lock().map_err(|_| ArenaError::Poisoned)?;

        let slot = |tracked: bool| {
            if tracked {
                SlotState::Pending
            } else {
                SlotState::Untracked
            }
        };
        let observation_id = self.registry.observe(
            digest,
            immediate_ok,
            slot(tracking.convergence),
            slot(tracking.resilience),
            Utc::now(),
        )?;
        let events = self.evaluate_locus(locus, digest)?;
        Ok((
            ObservationTicket {
                locus: locus.to_string(),
                digest: digest.to_string(),
                observation_id,
            },
            events,
        ))
    }

    /// Resolve the convergence slot of a prior observation. A failure here
    /// retroactively lowers the allele's fitness, so lifecycle rules rerun.
    pub fn record_convergence(
        &self,
        ticket: &ObservationTicket,
        ok: bool,
    ) -> Result<Vec<ArenaEvent>, ArenaError> {
        self.resolve(ticket, Timescale::Convergence, ok)
    }

    pub fn record_resilience(
        &self,
        ticket: &ObservationTicket,
        ok: bool,
    ) -> Result<Vec<ArenaEvent>, ArenaError> {
        self.resolve(ticket, Timescale::Resilience, ok)
    }

    fn resolve(
        &self,
        ticket: &ObservationTicket,
        timescale: Timescale,
        ok: bool,
    ) -> Result<Vec<ArenaEvent>, ArenaError> {
        let lock = self.locus_lock(&ticket.locus)?;
        let _guard = lock.lock().map_err(|_| ArenaError::Poisoned)?;
        let resolved =
            self.registry
                .resolve_slot(&ticket.digest, ticket.observation_id, timescale, ok)?;
        if !resolved {
            warn!(
                locus = %ticket.locus,
                digest = %ticket.digest,
                observation = ticket.observation_id,
                "temporal slot already resolved or evicted"
            );
            return Ok(Vec::new());
        }
        self.evaluate_locus(&ticket.locus, &ticket.digest)
    }

    /// Default pending slots past their windows to fail for every allele of
    /// the locus, then rerun the lifecycle rules.
    pub fn expire_pending(
        &self,
        locus: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<ArenaEvent>, ArenaError> {
        let lock = self.locus_lock(locus)?;
        let _guard = lock.lock().map_err(|_| ArenaError::Poisoned)?;
        let mut expired_any = false;
        let mut last_digest = None;
        for digest in self.registry.list(locus)? {
            let expired = self.registry.expire_pending(
                &digest,
                now,
                self.config.convergence_window,
                self.config.resilience_window,
            )?;
            if expired > 0 {
                expired_any = true;
                last_digest = Some(digest);
            }
        }
        match (expired_any, last_digest) {
            (true, Some(digest)) => self.evaluate_locus(locus, &digest),
            _ => Ok(Vec::new()),
        }
    }

    pub fn fitness(&self, digest: &str) -> Result<f64, ArenaError> {
        let record = self
            .registry
            .get(digest)?
            .ok_or_else(|| RegistryError::UnknownDigest(digest.to_string()))?;
        Ok(record.fitness.fitness())
    }

    /// Fitness blended with peer observations when the peer reports enough
    /// invocations: `0.7 * local + 0.3 * peer`.
    pub fn effective_fitness(&self, digest: &str) -> Result<f64, ArenaError> {
        let record = self
            .registry
            .get(digest)?
            .ok_or_else(|| RegistryError::UnknownDigest(digest.to_string()))?;
        let local = record.fitness.fitness();
        let Some(peer) = record.peer else {
            return Ok(local);
        };
        if peer.invocations < self.config.peer_min_invocations {
            return Ok(local);
        }
        let peer_fitness = peer.successes as f64
            / peer
                .invocations
                .max(operon_registry::MIN_INVOCATIONS_FOR_SCORE) as f64;
        Ok((1.0 - self.config.peer_weight) * local + self.config.peer_weight * peer_fitness)
    }

    /// Deprecate living alleles that no phenotype entry references and that
    /// score below every referenced allele of their locus, once old enough.
    pub fn sweep_deprecated(&self, now: DateTime<Utc>) -> Result<Vec<Digest>, ArenaError> {
        let mut deprecated = Vec::new();
        for locus in self.phenotype.loci()? {
            let referenced = self.phenotype.resolve_with_stack(&locus)?;
            let floor = referenced
                .iter()
                .filter_map(|digest| self.registry.get(digest).ok().flatten())
                .map(|record| record.fitness.fitness())
                .fold(f64::INFINITY, f64::min);
            for digest in self.registry.list(&locus)? {
                if referenced.contains(&digest) {
                    continue;
                }
                let Some(record) = self.registry.get(&digest)? else {
                    continue;
                };
                if !record.state.is_living() {
                    continue;
                }
                let age = (now - record.created_at).to_std().unwrap_or(Duration::ZERO);
                if age >= self.config.deprecate_after
                    && record.fitness.fitness() < floor
                {
                    self.registry.set_state(&digest, AlleleState::Deprecated)?;
                    info!(%locus, %digest, "deprecated unreferenced allele");
                    deprecated.push(digest);
                }
            }
        }
        Ok(deprecated)
    }

    // --- lifecycle evaluation (caller holds the locus lock) ---

    fn evaluate_locus(
        &self,
        locus: &str,
        observed_digest: &str,
    ) -> Result<Vec<ArenaEvent>, ArenaError> {
        let mut events = Vec::new();
        self.check_regression(locus, observed_digest, &mut events)?;
        self.check_demotion(locus, &mut events)?;
        self.check_promotion(locus, &mut events)?;
        self.phenotype
            .sync_fallback_order(locus, &self.registry.ranked(locus)?)?;
        Ok(events)
    }

    fn check_demotion(
        &self,
        locus: &str,
        events: &mut Vec<ArenaEvent>,
    ) -> Result<(), ArenaError> {
        let Some(dominant) = self.phenotype.resolve(locus)? else {
            return Ok(());
        };
        let Some(record) = self.registry.get(&dominant)? else {
            return Ok(());
        };
        if record.fitness.consecutive_failures < self.config.demotion_consecutive_failures {
            return Ok(());
        }
        self.demote_dominant(locus, &dominant, events)
    }

    fn demote_dominant(
        &self,
        locus: &str,
        dominant: &str,
        events: &mut Vec<ArenaEvent>,
    ) -> Result<(), ArenaError> {
        let outcome = self.phenotype.demote(locus)?;
        self.registry.set_state(dominant, AlleleState::Recessive)?;
        if let Some(next) = &outcome.new_dominant {
            self.registry.set_state(next, AlleleState::Dominant)?;
        }
        info!(locus, digest = %dominant, new_dominant = ?outcome.new_dominant, "demoted");
        events.push(ArenaEvent::Demoted {
            locus: locus.to_string(),
            digest: dominant.to_string(),
            new_dominant: outcome.new_dominant.clone(),
        });
        if outcome.new_dominant.is_none() {
            warn!(locus, "allele stack exhausted");
            events.push(ArenaEvent::LocusExhausted {
                locus: locus.to_string(),
                last_digest: dominant.to_string(),
            });
        }
        Ok(())
    }

    fn check_promotion(
        &self,
        locus: &str,
        events: &mut Vec<ArenaEvent>,
    ) -> Result<(), ArenaError> {
        let dominant = self.phenotype.resolve(locus)?;
        let dominant_fitness = match &dominant {
            Some(digest) => match self.registry.get(digest)? {
                Some(record) => Some(record.fitness.fitness()),
                None => None,
            },
            None => None,
        };

        let mut best: Option<(Digest, f64, u64)> = None;
        for digest in self.registry.list(locus)? {
            if dominant.as_deref() == Some(digest.as_str()) {
                continue;
            }
            let Some(record) = self.registry.get(&digest)? else {
                continue;
            };
            // Shadow alleles only ever ran against mock capabilities; their
            // scores say nothing about live behavior.
            if !record.state.is_living() || record.state == AlleleState::Shadow {
                continue;
            }
            let fitness = record.fitness.fitness();
            let invocations = record.fitness.invocations;
            let qualified = match dominant_fitness {
                Some(current) => {
                    invocations >= self.config.promotion_min_invocations
                        && fitness > current + self.config.promotion_advantage
                }
                None => fitness > 0.0,
            };
            if !qualified {
                continue;
            }
            let better = match &best {
                None => true,
                Some((best_digest, best_fitness, _)) => {
                    fitness > *best_fitness
                        || (fitness == *best_fitness && digest < *best_digest)
                }
            };
            if better {
                best = Some((digest, fitness, invocations));
            }
        }

        let Some((winner, fitness, _)) = best else {
            return Ok(());
        };
        self.phenotype.promote(locus, &winner)?;
        self.registry.set_state(&winner, AlleleState::Dominant)?;
        if let Some(previous) = &dominant {
            self.registry.set_state(previous, AlleleState::Recessive)?;
        }
        info!(locus, digest = %winner, fitness, "promoted to dominant");
        events.push(ArenaEvent::Promoted {
            locus: locus.to_string(),
            digest: winner,
            displaced: dominant,
        });
        Ok(())
    }

    fn check_regression(
        &self,
        locus: &str,
        digest: &str,
        events: &mut Vec<ArenaEvent>,
    ) -> Result<(), ArenaError> {
        let Some(record) = self.registry.get(digest)? else {
            return Ok(());
        };
        let fitness = record.fitness.fitness();
        let mut peaks = self.peaks.lock().map_err(|_| ArenaError::Poisoned)?;
        let peak = peaks.peaks.entry(digest.to_string()).or_insert(0.0);
        if fitness > *peak {
            *peak = fitness;
            return Ok(());
        }
        if record.fitness.invocations < self.config.regression_min_invocations {
            return Ok(());
        }
        let decline = *peak - fitness;
        let peak_value = *peak;
        drop(peaks);

        if decline >= self.config.severe_regression {
            warn!(locus, %digest, decline, "severe fitness regression");
            events.push(ArenaEvent::SevereRegression {
                locus: locus.to_string(),
                digest: digest.to_string(),
                drop: decline,
            });
            self.append_regression(locus, digest, "severe", peak_value, fitness)?;
            if self.phenotype.resolve(locus)?.as_deref() == Some(digest) {
                self.demote_dominant(locus, digest, events)?;
            }
        } else if decline >= self.config.regression_threshold {
            info!(locus, %digest, decline, "mild fitness regression");
            events.push(ArenaEvent::MildRegression {
                locus: locus.to_string(),
                digest: digest.to_string(),
                drop: decline,
            });
            self.append_regression(locus, digest, "mild", peak_value, fitness)?;
        }
        Ok(())
    }

    fn append_regression(
        &self,
        locus: &str,
        digest: &str,
        severity: &str,
        peak: f64,
        current: f64,
    ) -> Result<(), ArenaError> {
        let Some(path) = &self.regression_log else {
            return Ok(());
        };
        let mut entries: Vec<RegressionEntry> = if path.exists() {
            let bytes = fs::read(path).map_err(io_to_arena)?;
            serde_json::from_slice(&bytes).unwrap_or_default()
        } else {
            Vec::new()
        };
        entries.push(RegressionEntry {
            timestamp: Utc::now(),
            locus: locus.to_string(),
            digest: digest.to_string(),
            severity: severity.to_string(),
            peak,
            current,
        });
        let overflow = entries.len().saturating_sub(self.config.regression_log_limit);
        if overflow > 0 {
            entries.drain(..overflow);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_to_arena)?;
        }
        let bytes = serde_json::to_vec_pretty(&entries)
            .map_err(|err| ArenaError::Io(err.to_string()))?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, bytes).map_err(io_to_arena)?;
        fs::rename(&tmp, path).map_err(io_to_arena)?;
        Ok(())
    }
}

fn io_to_arena(err: io::Error) -> ArenaError {
    ArenaError::Io(err.to_string())
}
