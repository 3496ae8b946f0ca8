//! Content-addressed allele registry: immutable source keyed by SHA-256 of
//! the canonicalised text, with lineage, lifecycle state, and per-allele
//! fitness aggregates. Storage is append-only; the index document is
//! rewritten atomically and rebuilt from the per-digest files when corrupt.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use tracing::warn;

pub type Digest = String;

/// Maximum observations retained per allele (sliding window).
pub const MAX_OBSERVATIONS: usize = 200;

/// Invocation floor for the simple fitness denominator.
pub const MIN_INVOCATIONS_FOR_SCORE: u64 = 10;

const IMMEDIATE_WEIGHT: f64 = 0.3;
const CONVERGENCE_WEIGHT: f64 = 0.5;
const RESILIENCE_WEIGHT: f64 = 0.2;

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AlleleState {
    Shadow,
    Canary,
    #[default]
    Recessive,
    Dominant,
    Deprecated,
}

impl AlleleState {
    pub fn is_living(self) -> bool {
        self != AlleleState::Deprecated
    }
}

/// Resolution state of a temporal fitness slot.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SlotState {
    /// The locus declares no feedback for this timescale.
    Untracked,
    Pending,
    Ok,
    Fail,
}

impl SlotState {
    fn resolved_ok(self) -> Option<bool> {
        match self {
            SlotState::Ok => Some(true),
            SlotState::Fail => Some(false),
            SlotState::Untracked | SlotState::Pending => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Timescale {
    Convergence,
    Resilience,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Observation {
    pub id: u64,
    pub immediate_ok: bool,
    pub convergence: SlotState,
    pub resilience: SlotState,
    pub timestamp: DateTime<Utc>,
}

impl Observation {
    fn slot(&self, timescale: Timescale) -> SlotState {
        match timescale {
            Timescale::Convergence => self.convergence,
            Timescale::Resilience => self.resilience,
        }
    }

    fn slot_mut(&mut self, timescale: Timescale) -> &mut SlotState {
        match timescale {
            Timescale::Convergence => &mut self.convergence,
            Timescale::Resilience => &mut self.resilience,
        }
    }
}

/// Aggregated peer-reported outcomes for a digest, supplied externally.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerSummary {
    pub successes: u64,
    pub invocations: u64,
}

/// Per-allele fitness aggregate: totals plus a bounded observation ring.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct FitnessRecord {
    pub invocations: u64,
    pub successes: u64,
    pub consecutive_failures: u32,
    #[serde(default)]
    pub observations: VecDeque<Observation>,
    #[serde(default)]
    next_observation_id: u64,
}

impl FitnessRecord {
    pub fn observe(
        &mut self,
        immediate_ok: bool,
        convergence: SlotState,
        resilience: SlotState,
        now: DateTime<Utc>,
    ) -> u64 {
        let id = self.next_observation_id;
        self.next_observation_id += 1;
        self.invocations += 1;
        if immediate_ok {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }
        self.observations.push_back(Observation {
            id,
            immediate_ok,
            convergence,
            resilience,
            timestamp: now,
        });
        while self.observations.len() > MAX_OBSERVATIONS {
            self.observations.pop_front();
        }
        id
    }

    /// Resolve a pending slot. Returns false when the observation has left
    /// the window or the slot was already resolved.
    pub fn resolve(&mut self, observation_id: u64, timescale: Timescale, ok: bool) -> bool {
        for observation in self.observations.iter_mut() {
            if observation.id == observation_id {
                let slot = observation.slot_mut(timescale);
                if *slot != SlotState::Pending {
                    return false;
                }
                *slot = if ok { SlotState::Ok } else { SlotState::Fail };
                return true;
            }
        }
        false
    }

    /// Default pending slots older than their window to fail. Returns the
    /// number of slots expired.
    pub fn expire_pending(
        &mut self,
        now: DateTime<Utc>,
        convergence_window: Duration,
        resilience_window: Duration,
    ) -> u32 {
        let mut expired = 0;
        for observation in self.observations.iter_mut() {
            let age = (now - observation.timestamp)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if observation.convergence == SlotState::Pending && age >= convergence_window {
                observation.convergence = SlotState::Fail;
                expired += 1;
            }
            if observation.resilience == SlotState::Pending && age >= resilience_window {
                observation.resilience = SlotState::Fail;
                expired += 1;
            }
        }
        expired
    }

    fn timescale_rate(&self, timescale: Timescale) -> Option<f64> {
        let mut ok = 0u64;
        let mut resolved = 0u64;
        for observation in &self.observations {
            if let Some(success) = observation.slot(timescale).resolved_ok() {
                resolved += 1;
                if success {
                    ok += 1;
                }
            }
        }
        (resolved > 0).then(|| ok as f64 / resolved as f64)
    }

    /// Derived scalar fitness in [0, 1].
    ///
    /// With at least ten invocations and resolved temporal feedback, the
    /// weighted three-timescale formula applies; pending slots are excluded
    /// from the rates and a timescale with no resolved data scores as good.
    /// Without temporal feedback the simple `successes / max(n, 10)` rate is
    /// used.
    pub fn fitness(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        let simple = self.successes as f64
            / self.invocations.max(MIN_INVOCATIONS_FOR_SCORE) as f64;

        let convergence = self.timescale_rate(Timescale::Convergence);
        let resilience = self.timescale_rate(Timescale::Resilience);
        if self.invocations < MIN_INVOCATIONS_FOR_SCORE
            || (convergence.is_none() && resilience.is_none())
        {
            return simple.clamp(0.0, 1.0);
        }

        let immediate = {
            let mut ok = 0u64;
            for observation in &self.observations {
                if observation.immediate_ok {
                    ok += 1;
                }
            }
            ok as f64 / self.observations.len().max(1) as f64
        };
        let score = immediate * IMMEDIATE_WEIGHT
            + convergence.unwrap_or(1.0) * CONVERGENCE_WEIGHT
            + resilience.unwrap_or(1.0) * RESILIENCE_WEIGHT;
        score.clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AlleleRecord {
    pub digest: Digest,
    pub locus: String,
    pub generation: u32,
    pub parent: Option<Digest>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub mutation_ctx: BTreeMap<String, String>,
    pub state: AlleleState,
    #[serde(default)]
    pub fitness: FitnessRecord,
    #[serde(default)]
    pub shadow_successes: u32,
    #[serde(default)]
    pub canary_successes: u32,
    #[serde(default)]
    pub peer: Option<PeerSummary>,
}

/// Request for [`Registry::put`]. Generation is derived from the parent.
#[derive(Clone, Debug, Default)]
pub struct NewAllele {
    pub locus: String,
    pub parent: Option<Digest>,
    pub mutation_ctx: BTreeMap<String, String>,
    pub state: AlleleState,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry I/O error: {0}")]
    Io(String),
    #[error("registry serialization error: {0}")]
    Serde(String),
    #[error("unknown digest: {0}")]
    UnknownDigest(Digest),
    #[error("registry lock poisoned")]
    Poisoned,
}

fn io_err(err: io::Error) -> RegistryError {
    RegistryError::Io(err.to_string())
}

/// Canonicalise source for digesting: trailing whitespace stripped per line,
/// exactly one trailing newline.
pub fn canonicalise_source(source: &str) -> String {
    let mut out = String::with_capacity(source.len() + 1);
    for line in source.lines() {
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out
}

pub fn digest_source(source: &str) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(canonicalise_source(source).as_bytes());
    hex::encode(hasher.finalize())
}

pub struct Registry {
    root: PathBuf,
    index: Mutex<BTreeMap<Digest, AlleleRecord>>,
}

impl Registry {
    /// Open (or create) a registry under `<root>` (conventionally
    /// `<project>/.sg/registry`). A corrupt index is rebuilt from the
    /// per-digest source files; entries whose source file has vanished are
    /// dropped.
    pub fn open<P: Into<PathBuf>>(root: P) -> Result<Self, RegistryError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(io_err)?;
        let index_path = root.join("index.json");
        let mut index = if index_path.exists() {
            let bytes = fs::read(&index_path).map_err(io_err)?;
            match serde_json::from_slice::<BTreeMap<Digest, AlleleRecord>>(&bytes) {
                Ok(index) => index,
                Err(err) => {
                    warn!(error = %err, "registry index corrupt, rebuilding from source files");
                    rebuild_index(&root)?
                }
            }
        } else {
            BTreeMap::new()
        };
        index.retain(|digest, _| {
            let present = root.join(format!("{digest}.src")).exists();
            if !present {
                warn!(%digest, "source file missing, dropping allele from index");
            }
            present
        });
        let registry = Self {
            root,
            index: Mutex::new(index),
        };
        registry.flush()?;
        Ok(registry)
    }

    fn source_path(&self, digest: &str) -> PathBuf {
        self.root.join(format!("{digest}.src"))
    }

    /// Store an allele. Idempotent by digest: identical source returns the
    /// existing record untouched.
    pub fn put(&self, source: &str, request: NewAllele) -> Result<Digest, RegistryError> {
        let canonical = canonicalise_source(source);
        let digest = digest_source(&canonical);
        let mut index = self.index.lock().map_err(|_| RegistryError::Poisoned)?;
        if index.contains_key(&digest) {
            return Ok(digest);
        }
        let generation = request
            .parent
            .as_deref()
            .and_then(|parent| index.get(parent))
            .map(|parent| parent.generation + 1)
            .unwrap_or(0);
        let path = self.source_path(&digest);
        if !path.exists() {
            write_atomic(&path, canonical.as_bytes())?;
        }
        index.insert(
            digest.clone(),
            AlleleRecord {
                digest: digest.clone(),
                locus: request.locus,
                generation,
                parent: request.parent,
                created_at: Utc::now(),
                mutation_ctx: request.mutation_ctx,
                state: request.state,
                fitness: FitnessRecord::default(),
                shadow_successes: 0,
                canary_successes: 0,
                peer: None,
            },
        );
        self.flush_locked(&index).map(|_| digest)
    }

    pub fn get(&self, digest: &str) -> Result<Option<AlleleRecord>, RegistryError> {
        let index = self.index.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(index.get(digest).cloned())
    }

    pub fn source(&self, digest: &str) -> Result<Option<String>, RegistryError> {
        let path = self.source_path(digest);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(path).map(Some).map_err(io_err)
    }

    pub fn list(&self, locus: &str) -> Result<BTreeSet<Digest>, RegistryError> {
        let index = self.index.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(index
            .values()
            .filter(|record| record.locus == locus)
            .map(|record| record.digest.clone())
            .collect())
    }

    /// Living alleles for a locus ordered by descending fitness, ties broken
    /// by ascending digest.
    pub fn ranked(&self, locus: &str) -> Result<Vec<Digest>, RegistryError> {
        let index = self.index.lock().map_err(|_| RegistryError::Poisoned)?;
        let mut matching: Vec<(&String, f64)> = index
            .values()
            .filter(|record| record.locus == locus && record.state.is_living())
            .map(|record| (&record.digest, record.fitness.fitness()))
            .collect();
        matching.sort_by(|left, right| {
            right
                .1
                .partial_cmp(&left.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| left.0.cmp(right.0))
        });
        Ok(matching.into_iter().map(|(digest, _)| digest.clone()).collect())
    }

    pub fn set_state(&self, digest: &str, state: AlleleState) -> Result<(), RegistryError> {
        self.with_record(digest, |record| record.state = state)
    }

    pub fn set_peer_summary(
        &self,
        digest: &str,
        summary: PeerSummary,
    ) -> Result<(), RegistryError> {
        self.with_record(digest, |record| record.peer = Some(summary))
    }

    pub fn record_shadow_success(&self, digest: &str) -> Result<u32, RegistryError> {
        let mut count = 0;
        self.with_record(digest, |record| {
            record.shadow_successes += 1;
            count = record.shadow_successes;
        })?;
        Ok(count)
    }

    pub fn record_canary_success(&self, digest: &str) -> Result<u32, RegistryError> {
        let mut count = 0;
        self.with_record(digest, |record| {
            record.canary_successes += 1;
            count = record.canary_successes;
        })?;
        Ok(count)
    }

    /// Shadow and canary qualification counts consecutive successes; a
    /// failure starts the run over.
    pub fn reset_shadow_successes(&self, digest: &str) -> Result<(), RegistryError> {
        self.with_record(digest, |record| record.shadow_successes = 0)
    }

    pub fn reset_canary_successes(&self, digest: &str) -> Result<(), RegistryError> {
        self.with_record(digest, |record| record.canary_successes = 0)
    }

    /// Append an observation to a digest's fitness record, returning the
    /// observation id for later slot resolution.
    pub fn observe(
        &self,
        digest: &str,
        immediate_ok: bool,
        convergence: SlotState,
        resilience: SlotState,
        now: DateTime<Utc>,
    ) -> Result<u64, RegistryError> {
        let mut id = 0;
        self.with_record(digest, |record| {
            id = record
                .fitness
                .observe(immediate_ok, convergence, resilience, now);
        })?;
        Ok(id)
    }

    pub fn resolve_slot(
        &self,
        digest: &str,
        observation_id: u64,
        timescale: Timescale,
        ok: bool,
    ) -> Result<bool, RegistryError> {
        let mut resolved = false;
        self.with_record(digest, |record| {
            resolved = record.fitness.resolve(observation_id, timescale, ok);
        })?;
        Ok(resolved)
    }

    pub fn expire_pending(
        &self,
        digest: &str,
        now: DateTime<Utc>,
        convergence_window: Duration,
        resilience_window: Duration,
    ) -> Result<u32, RegistryError> {
        let mut expired = 0;
        self.with_record(digest, |record| {
            expired = record
                .fitness
                .expire_pending(now, convergence_window, resilience_window);
        })?;
        Ok(expired)
    }

    /// Lineage from `digest` to its seed, inclusive. Cycles cannot occur in
    /// well-formed data; a dangling parent edge ends the walk.
    pub fn lineage(&self, digest: &str) -> Result<Vec<AlleleRecord>, RegistryError> {
        let index = self.index.lock().map_err(|_| RegistryError::Poisoned)?;
        let mut chain = Vec::new();
        let mut seen = BTreeSet::new();
        let mut cursor = Some(digest.to_string());
        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                break;
            }
            match index.get(&current) {
                Some(record) => {
                    cursor = record.parent.clone();
                    chain.push(record.clone());
                }
                None if chain.is_empty() => {
                    return Err(RegistryError::UnknownDigest(current));
                }
                None => break,
            }
        }
        Ok(chain)
    }

    pub fn contains(&self, digest: &str) -> Result<bool, RegistryError> {
        let index = self.index.lock().map_err(|_| RegistryError::Poisoned)?;
        Ok(index.contains_key(digest))
    }

    /// Persist the index document (write-to-temp then rename).
    pub fn flush(&self) -> Result<(), RegistryError> {
        let index = self.index.lock().map_err(|_| RegistryError::Poisoned)?;
        self.flush_locked(&index)
    }

    fn flush_locked(
        &self,
        index: &BTreeMap<Digest, AlleleRecord>,
    ) -> Result<(), RegistryError> {
        let bytes = serde_json::to_vec_pretty(index)
            .map_err(|err| RegistryError::Serde(err.to_string()))?;
        write_atomic(&self.root.join("index.json"), &bytes)
    }

    fn with_record(
        &self,
        digest: &str,
        apply: impl FnOnce(&mut AlleleRecord),
    ) -> Result<(), RegistryError> {
        let mut index = self.index.lock().map_err(|_| RegistryError::Poisoned)?;
        let record = index
            .get_mut(digest)
            .ok_or_else(|| RegistryError::UnknownDigest(digest.to_string()))?;
        apply(record);
        self.flush_locked(&index)
    }
}

fn rebuild_index(root: &Path) -> Result<BTreeMap<Digest, AlleleRecord>, RegistryError> {
    let mut index = BTreeMap::new();
    for entry in fs::read_dir(root).map_err(io_err)? {
        let entry = entry.map_err(io_err)?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let Some(digest) = name.strip_suffix(".src") else {
            continue;
        };
        let source = fs::read_to_string(&path).map_err(io_err)?;
        if digest_source(&source) != digest {
            warn!(%digest, "source file does not match its digest, skipping");
            continue;
        }
        index.insert(
            digest.to_string(),
            AlleleRecord {
                digest: digest.to_string(),
                locus: String::new(),
                generation: 0,
                parent: None,
                created_at: Utc::now(),
                mutation_ctx: BTreeMap::new(),
                state: AlleleState::Recessive,
                fitness: FitnessRecord::default(),
                shadow_successes: 0,
                canary_successes: 0,
                peer: None,
            },
        );
    }
    Ok(index)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), RegistryError> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes).map_err(io_err)?;
    fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}
