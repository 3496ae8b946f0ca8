//! Phenotype map: which allele is expressed at each locus (dominant plus an
//! ordered fallback stack) and the fusion state of each pathway. Mutations
//! are written through to a TOML document atomically; readers see cloned
//! snapshots, never a torn write.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub type Digest = String;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LocusEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dominant: Option<Digest>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fallback: Vec<Digest>,
}

impl LocusEntry {
    /// `[dominant, fallback...]`, dominant first.
    pub fn stack(&self) -> Vec<Digest> {
        let mut stack = Vec::with_capacity(1 + self.fallback.len());
        if let Some(dominant) = &self.dominant {
            stack.push(dominant.clone());
        }
        stack.extend(self.fallback.iter().cloned());
        stack
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PathwayEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fused_allele: Option<Digest>,
    #[serde(default)]
    pub reinforcement_count: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_composition: Vec<Digest>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PhenotypeDoc {
    #[serde(default)]
    locus: BTreeMap<String, LocusEntry>,
    #[serde(default)]
    pathway: BTreeMap<String, PathwayEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DemoteOutcome {
    pub demoted: Digest,
    /// None when the fallback stack was empty: the locus is exhausted.
    pub new_dominant: Option<Digest>,
}

#[derive(Debug, Error)]
pub enum PhenotypeError {
    #[error("phenotype I/O error: {0}")]
    Io(String),
    #[error("phenotype document error: {0}")]
    Document(String),
    #[error("locus '{0}' has no dominant allele")]
    NoDominant(String),
    #[error("phenotype lock poisoned")]
    Poisoned,
}

fn io_err(err: io::Error) -> PhenotypeError {
    PhenotypeError::Io(err.to_string())
}

pub struct PhenotypeMap {
    path: PathBuf,
    doc: Mutex<PhenotypeDoc>,
}

impl PhenotypeMap {
    /// Load the phenotype document at `path`, or start empty if absent.
    pub fn open<P: Into<PathBuf>>(path: P) -> Result<Self, PhenotypeError> {
        let path = path.into();
        let doc = if path.exists() {
            let text = fs::read_to_string(&path).map_err(io_err)?;
            toml::from_str(&text).map_err(|err| PhenotypeError::Document(err.to_string()))?
        } else {
            PhenotypeDoc::default()
        };
        Ok(Self {
            path,
            doc: Mutex::new(doc),
        })
    }

    pub fn resolve(&self, locus: &str) -> Result<Option<Digest>, PhenotypeError> {
        let doc = self.doc.lock().map_err(|_| PhenotypeError::Poisoned)?;
        Ok(doc.locus.get(locus).and_then(|entry| entry.dominant.clone()))
    }

    pub fn resolve_with_stack(&self, locus: &str) -> Result<Vec<Digest>, PhenotypeError> {
        let doc = self.doc.lock().map_err(|_| PhenotypeError::Poisoned)?;
        Ok(doc
            .locus
            .get(locus)
            .map(LocusEntry::stack)
            .unwrap_or_default())
    }

    pub fn locus_entry(&self, locus: &str) -> Result<Option<LocusEntry>, PhenotypeError> {
        let doc = self.doc.lock().map_err(|_| PhenotypeError::Poisoned)?;
        Ok(doc.locus.get(locus).cloned())
    }

    pub fn loci(&self) -> Result<Vec<String>, PhenotypeError> {
        let doc = self.doc.lock().map_err(|_| PhenotypeError::Poisoned)?;
        Ok(doc.locus.keys().cloned().collect())
    }

    /// Make `digest` dominant for `locus`. The previous dominant is pushed to
    /// the head of the fallback stack; the new dominant is removed from it.
    pub fn promote(&self, locus: &str, digest: &str) -> Result<(), PhenotypeError> {
        self.mutate(|doc| {
            let entry = doc.locus.entry(locus.to_string()).or_default();
            if let Some(previous) = entry.dominant.take() {
                if previous != digest && !entry.fallback.contains(&previous) {
                    entry.fallback.insert(0, previous);
                }
            }
            entry.fallback.retain(|candidate| candidate != digest);
            entry.dominant = Some(digest.to_string());
            info!(locus, %digest, "promoted to dominant");
        })
    }

    /// Pop the dominant allele. The next fallback (if any) becomes dominant;
    /// an empty fallback leaves the locus exhausted.
    pub fn demote(&self, locus: &str) -> Result<DemoteOutcome, PhenotypeError> {
        let mut outcome = None;
        self.mutate(|doc| {
            let entry = doc.locus.entry(locus.to_string()).or_default();
            if let Some(demoted) = entry.dominant.take() {
                let new_dominant = if entry.fallback.is_empty() {
                    None
                } else {
                    Some(entry.fallback.remove(0))
                };
                entry.dominant = new_dominant.clone();
                info!(locus, %demoted, new_dominant = ?entry.dominant, "demoted dominant");
                outcome = Some(DemoteOutcome {
                    demoted,
                    new_dominant,
                });
            }
        })?;
        outcome.ok_or_else(|| PhenotypeError::NoDominant(locus.to_string()))
    }

    /// Append a digest to the fallback stack (no-op if already present or
    /// dominant).
    pub fn add_fallback(&self, locus: &str, digest: &str) -> Result<(), PhenotypeError> {
        self.mutate(|doc| {
            let entry = doc.locus.entry(locus.to_string()).or_default();
            if entry.dominant.as_deref() != Some(digest)
                && !entry.fallback.iter().any(|candidate| candidate == digest)
            {
                entry.fallback.push(digest.to_string());
            }
        })
    }

    /// Reorder the fallback stack to follow `ranking` (descending historical
    /// fitness among living alleles). Digests absent from `ranking` keep
    /// their relative order at the tail.
    pub fn sync_fallback_order(
        &self,
        locus: &str,
        ranking: &[Digest],
    ) -> Result<(), PhenotypeError> {
        self.mutate(|doc| {
            let Some(entry) = doc.locus.get_mut(locus) else {
                return;
            };
            let mut reordered: Vec<Digest> = ranking
                .iter()
                .filter(|digest| entry.fallback.contains(digest))
                .cloned()
                .collect();
            for digest in &entry.fallback {
                if !reordered.contains(digest) {
                    reordered.push(digest.clone());
                }
            }
            entry.fallback = reordered;
        })
    }

    /// Drop digests the registry no longer holds. Returns the removed set.
    pub fn repair(
        &self,
        exists: impl Fn(&str) -> bool,
    ) -> Result<Vec<Digest>, PhenotypeError> {
        let mut removed = Vec::new();
        self.mutate(|doc| {
            for entry in doc.locus.values_mut() {
                if let Some(dominant) = &entry.dominant {
                    if !exists(dominant) {
                        removed.push(dominant.clone());
                        entry.dominant = if entry.fallback.is_empty() {
                            None
                        } else {
                            Some(entry.fallback.remove(0))
                        };
                    }
                }
                entry.fallback.retain(|digest| {
                    let keep = exists(digest);
                    if !keep {
                        removed.push(digest.clone());
                    }
                    keep
                });
            }
            for entry in doc.pathway.values_mut() {
                if let Some(fused) = &entry.fused_allele {
                    if !exists(fused) {
                        removed.push(fused.clone());
                        entry.fused_allele = None;
                    }
                }
            }
        })?;
        Ok(removed)
    }

    pub fn pathway_state(&self, name: &str) -> Result<PathwayEntry, PhenotypeError> {
        let doc = self.doc.lock().map_err(|_| PhenotypeError::Poisoned)?;
        Ok(doc.pathway.get(name).cloned().unwrap_or_default())
    }

    pub fn set_fusion(&self, name: &str, digest: &str) -> Result<(), PhenotypeError> {
        self.mutate(|doc| {
            let entry = doc.pathway.entry(name.to_string()).or_default();
            entry.fused_allele = Some(digest.to_string());
            info!(pathway = name, %digest, "fused allele installed");
        })
    }

    pub fn clear_fusion(&self, name: &str) -> Result<(), PhenotypeError> {
        self.mutate(|doc| {
            if let Some(entry) = doc.pathway.get_mut(name) {
                if entry.fused_allele.take().is_some() {
                    info!(pathway = name, "fused allele cleared");
                }
            }
        })
    }

    pub fn update_pathway(
        &self,
        name: &str,
        apply: impl FnOnce(&mut PathwayEntry),
    ) -> Result<(), PhenotypeError> {
        self.mutate(|doc| {
            apply(doc.pathway.entry(name.to_string()).or_default());
        })
    }

    fn mutate(&self, apply: impl FnOnce(&mut PhenotypeDoc)) -> Result<(), PhenotypeError> {
        let mut doc = self.doc.lock().map_err(|_| PhenotypeError::Poisoned)?;
        apply(&mut doc);
        write_doc(&self.path, &doc)
    }
}

fn write_doc(path: &Path, doc: &PhenotypeDoc) -> Result<(), PhenotypeError> {
    let text =
        toml::to_string_pretty(doc).map_err(|err| PhenotypeError::Document(err.to_string()))?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_err)?;
    }
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, text.as_bytes()).map_err(io_err)?;
    fs::rename(&tmp_path, path).map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "operon-phenotype-{name}-{}.toml",
            std::process::id()
        ))
    }

    fn fresh(name: &str) -> PhenotypeMap {
        let path = temp_path(name);
        let _ = fs::remove_file(&path);
        PhenotypeMap::open(path).unwrap()
    }

    #[test]
    fn promote_pushes_previous_dominant_to_fallback_head() {
        let map = fresh("promote");
        map.promote("x", "aaa").unwrap();
        map.add_fallback("x", "bbb").unwrap();
        map.promote("x", "ccc").unwrap();
        assert_eq!(
            map.resolve_with_stack("x").unwrap(),
            vec!["ccc".to_string(), "aaa".to_string(), "bbb".to_string()]
        );
    }

    #[test]
    fn dominant_never_appears_in_its_own_fallback() {
        let map = fresh("invariant");
        map.promote("x", "aaa").unwrap();
        map.add_fallback("x", "bbb").unwrap();
        map.promote("x", "bbb").unwrap();
        let entry = map.locus_entry("x").unwrap().unwrap();
        assert_eq!(entry.dominant.as_deref(), Some("bbb"));
        assert!(!entry.fallback.contains(&"bbb".to_string()));
    }

    #[test]
    fn demote_pops_to_next_fallback() {
        let map = fresh("demote");
        map.promote("x", "aaa").unwrap();
        map.add_fallback("x", "bbb").unwrap();
        let outcome = map.demote("x").unwrap();
        assert_eq!(outcome.demoted, "aaa");
        assert_eq!(outcome.new_dominant.as_deref(), Some("bbb"));
        assert_eq!(map.resolve("x").unwrap().as_deref(), Some("bbb"));
    }

    #[test]
    fn demote_with_empty_fallback_reports_exhaustion() {
        let map = fresh("exhausted");
        map.promote("x", "aaa").unwrap();
        let outcome = map.demote("x").unwrap();
        assert_eq!(outcome.new_dominant, None);
        assert_eq!(map.resolve("x").unwrap(), None);
        assert!(matches!(
            map.demote("x"),
            Err(PhenotypeError::NoDominant(_))
        ));
    }

    #[test]
    fn document_round_trips_through_disk() {
        let path = temp_path("roundtrip");
        let _ = fs::remove_file(&path);
        {
            let map = PhenotypeMap::open(&path).unwrap();
            map.promote("x", "aaa").unwrap();
            map.add_fallback("x", "bbb").unwrap();
            map.update_pathway("p", |entry| {
                entry.reinforcement_count = 4;
                entry.last_composition = vec!["aaa".into(), "bbb".into()];
            })
            .unwrap();
            map.set_fusion("p", "fff").unwrap();
        }
        let map = PhenotypeMap::open(&path).unwrap();
        assert_eq!(
            map.resolve_with_stack("x").unwrap(),
            vec!["aaa".to_string(), "bbb".to_string()]
        );
        let pathway = map.pathway_state("p").unwrap();
        assert_eq!(pathway.fused_allele.as_deref(), Some("fff"));
        assert_eq!(pathway.reinforcement_count, 4);
    }

    #[test]
    fn sync_fallback_order_follows_ranking() {
        let map = fresh("ordering");
        map.promote("x", "dom").unwrap();
        map.add_fallback("x", "low").unwrap();
        map.add_fallback("x", "high").unwrap();
        map.sync_fallback_order("x", &["high".into(), "low".into()])
            .unwrap();
        assert_eq!(
            map.resolve_with_stack("x").unwrap(),
            vec!["dom".to_string(), "high".to_string(), "low".to_string()]
        );
    }

    #[test]
    fn repair_drops_unknown_digests() {
        let map = fresh("repair");
        map.promote("x", "gone").unwrap();
        map.add_fallback("x", "kept").unwrap();
        map.set_fusion("p", "gone").unwrap();
        let removed = map.repair(|digest| digest == "kept").unwrap();
        assert!(removed.contains(&"gone".to_string()));
        assert_eq!(map.resolve("x").unwrap().as_deref(), Some("kept"));
        assert_eq!(map.pathway_state("p").unwrap().fused_allele, None);
    }
}
