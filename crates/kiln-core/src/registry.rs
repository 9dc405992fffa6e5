//! Persisted name -> entry ledgers and their reconciliation against disk.
//!
//! A [`RegistryStore`] is the metadata half of a resource's state. The other
//! half lives on the filesystem, and the two drift whenever a user deletes a
//! file by hand or a crash interrupts an operation. [`RegistryStore::reconcile`]
//! brings them back together:
//!
//! 1. entries whose backing file is gone are pruned,
//! 2. unregistered files in the managed directory are adopted through an
//!    [`Adopter`], which asks the external tool what the file really is,
//! 3. the result is written back unconditionally.
//!
//! Loading never fails. A missing document is an empty registry, and a
//! malformed one is logged and treated as empty so the next reconcile can
//! rebuild it from the filesystem.

use crate::error::{CoreError, EntityKind, Result};
use crate::validate::validate_name;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// An entry that can live in a [`RegistryStore`].
pub trait RegistryEntry: Serialize + DeserializeOwned + Clone + Send + Sync {
    /// Kind of entity, used in log fields and error messages.
    const KIND: EntityKind;

    /// The backing resource on the filesystem.
    fn path(&self) -> &Path;
}

/// Builds entries for unregistered files found during reconciliation.
#[async_trait]
pub trait Adopter<E>: Send + Sync {
    /// Whether `path` looks like a resource of this kind at all.
    fn accepts(&self, path: &Path) -> bool;

    /// Derive an entry for `path`, or `None` if it cannot be identified.
    async fn adopt(&self, name: &str, path: &Path, created_at: DateTime<Utc>) -> Option<E>;
}

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Names removed because their backing file was missing.
    pub pruned: Vec<String>,
    /// Names added for previously unregistered files.
    pub adopted: Vec<String>,
    /// Candidate files that were left unregistered.
    pub skipped: Vec<PathBuf>,
}

impl ReconcileReport {
    /// Whether the pass changed the registry contents.
    pub fn changed(&self) -> bool {
        !self.pruned.is_empty() || !self.adopted.is_empty()
    }

    /// Fold a later pass into this one, keeping each name or path once.
    pub fn absorb(&mut self, later: ReconcileReport) {
        self.pruned.extend(later.pruned);
        self.adopted.extend(later.adopted);
        self.skipped.extend(later.skipped);
        for names in [&mut self.pruned, &mut self.adopted] {
            names.sort();
            names.dedup();
        }
        self.skipped.sort();
        self.skipped.dedup();
    }
}

/// In-memory registry bound to its JSON document.
#[derive(Debug, Clone)]
pub struct RegistryStore<E> {
    document: PathBuf,
    entries: BTreeMap<String, E>,
}

impl<E: RegistryEntry> RegistryStore<E> {
    /// An empty registry bound to `document`, without touching the filesystem.
    pub fn empty(document: impl Into<PathBuf>) -> Self {
        Self {
            document: document.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the registry persisted at `document`.
    pub fn load(document: impl Into<PathBuf>) -> Self {
        let document = document.into();
        let entries = match fs::read_to_string(&document) {
            Ok(text) => match serde_json::from_str::<BTreeMap<String, E>>(&text) {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::error!(
                        kind = %E::KIND,
                        document = %document.display(),
                        error = %e,
                        "Registry document is malformed, starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                tracing::error!(
                    kind = %E::KIND,
                    document = %document.display(),
                    error = %e,
                    "Registry document is unreadable, starting empty"
                );
                BTreeMap::new()
            }
        };

        tracing::debug!(kind = %E::KIND, count = entries.len(), "Registry loaded");
        Self { document, entries }
    }

    /// Path of the backing JSON document.
    pub fn document(&self) -> &Path {
        &self.document
    }

    /// Write the registry to its document.
    ///
    /// The document is written to a sibling `.tmp` file first and renamed
    /// into place, so a crash never leaves a half-written registry.
    pub fn save(&self) -> Result<()> {
        let persistence = |source| CoreError::Persistence {
            path: self.document.clone(),
            source,
        };

        if let Some(parent) = self.document.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(persistence)?;
            }
        }

        let json = serde_json::to_string_pretty(&self.entries)?;
        let mut tmp = self.document.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, json).map_err(persistence)?;
        fs::rename(&tmp, &self.document).map_err(persistence)?;
        tracing::trace!(document = %self.document.display(), "Registry saved");
        Ok(())
    }

    /// Prune stale entries, adopt orphaned files in `managed_dir`, and persist.
    pub async fn reconcile<A>(&mut self, managed_dir: &Path, adopter: &A) -> Result<ReconcileReport>
    where
        A: Adopter<E> + ?Sized,
    {
        let mut report = ReconcileReport::default();

        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| !entry.path().exists())
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            if let Some(entry) = self.entries.remove(&name) {
                tracing::warn!(
                    kind = %E::KIND,
                    name = %name,
                    path = %entry.path().display(),
                    "Backing file missing, removing from registry"
                );
            }
            report.pruned.push(name);
        }

        for path in candidate_files(managed_dir).await {
            if !adopter.accepts(&path) || self.find_by_path(&path).is_some() {
                continue;
            }

            let Some(name) = path.file_stem().and_then(|s| s.to_str()).map(str::to_owned) else {
                report.skipped.push(path);
                continue;
            };
            if validate_name(E::KIND, &name).is_err() {
                tracing::warn!(kind = %E::KIND, path = %path.display(), "Orphaned file has an unusable name, skipping");
                report.skipped.push(path);
                continue;
            }
            if self.entries.contains_key(&name) {
                tracing::warn!(
                    kind = %E::KIND,
                    name = %name,
                    path = %path.display(),
                    "Orphaned file collides with a registered name, skipping"
                );
                report.skipped.push(path);
                continue;
            }

            match adopter.adopt(&name, &path, file_created_at(&path)).await {
                Some(entry) => {
                    tracing::info!(kind = %E::KIND, name = %name, path = %path.display(), "Adopted orphaned file");
                    self.entries.insert(name.clone(), entry);
                    report.adopted.push(name);
                }
                None => {
                    tracing::warn!(kind = %E::KIND, path = %path.display(), "Could not identify orphaned file, leaving it unregistered");
                    report.skipped.push(path);
                }
            }
        }

        self.save()?;

        if report.changed() {
            tracing::info!(
                kind = %E::KIND,
                pruned = report.pruned.len(),
                adopted = report.adopted.len(),
                "Registry reconciled"
            );
        }
        Ok(report)
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &str) -> Option<&E> {
        self.entries.get(name)
    }

    /// Mutable lookup by name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut E> {
        self.entries.get_mut(name)
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Insert or replace an entry. Does not persist.
    pub fn insert(&mut self, name: impl Into<String>, entry: E) -> Option<E> {
        self.entries.insert(name.into(), entry)
    }

    /// Remove an entry. Does not persist.
    pub fn remove(&mut self, name: &str) -> Option<E> {
        self.entries.remove(name)
    }

    /// Insert an entry and persist. If the save fails the insert is undone,
    /// so memory never holds an entry the document lacks.
    pub fn insert_and_save(&mut self, name: impl Into<String>, entry: E) -> Result<()> {
        let name = name.into();
        let previous = self.entries.insert(name.clone(), entry);
        if let Err(e) = self.save() {
            match previous {
                Some(previous) => self.entries.insert(name, previous),
                None => self.entries.remove(&name),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove an entry and persist. If the save fails the entry is restored.
    pub fn remove_and_save(&mut self, name: &str) -> Result<Option<E>> {
        let Some(entry) = self.entries.remove(name) else {
            return Ok(None);
        };
        if let Err(e) = self.save() {
            self.entries.insert(name.to_string(), entry);
            return Err(e);
        }
        Ok(Some(entry))
    }

    /// All entries in name order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &E)> {
        self.entries.iter().map(|(name, entry)| (name.as_str(), entry))
    }

    /// The entry whose backing file is `path`, if any.
    pub fn find_by_path(&self, path: &Path) -> Option<(&str, &E)> {
        self.entries()
            .find(|(_, entry)| same_file(entry.path(), path))
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Compare two paths, falling back to canonical forms when they differ textually.
pub(crate) fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Regular, non-hidden files directly inside `dir`, sorted by path.
async fn candidate_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut read_dir = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) => {
            tracing::debug!(dir = %dir.display(), error = %e, "Managed directory not readable, nothing to adopt");
            return files;
        }
    };

    loop {
        match read_dir.next_entry().await {
            Ok(Some(entry)) => {
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                let is_file = entry
                    .file_type()
                    .await
                    .map(|t| t.is_file())
                    .unwrap_or(false);
                if is_file && !hidden {
                    files.push(entry.path());
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Error while scanning managed directory");
                break;
            }
        }
    }

    files.sort();
    files
}

/// Creation time of `path`, falling back to modification time, then now.
pub(crate) fn file_created_at(path: &Path) -> DateTime<Utc> {
    fs::metadata(path)
        .and_then(|meta| meta.created().or_else(|_| meta.modified()))
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}
