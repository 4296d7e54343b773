//! KN-004: Execution journal — the only source of truth for "already done".
//!
//! Entry lifecycle: `Pending -> {Completed | Failed}`, `Failed -> Pending` on
//! retry, `Pending -> Pending` when an interrupted run is recovered.
//! `Completed` is terminal. Every transition is a compare-and-set on the
//! entry revision; losing a race is reported as a journal conflict.

use super::error::{KilnError, Result};
use super::store::{open_store, Backend, JournalStore};
use super::types::{entry_key, Descriptor, EntryStatus, JournalEntry};
use crate::tripwire::eventlog::now_iso8601;
use std::path::Path;
use tracing::debug;

/// Durable record of descriptor executions, shared by every module run.
pub struct Journal {
    store: Box<dyn JournalStore>,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal").finish_non_exhaustive()
    }
}

impl Journal {
    pub fn new(store: Box<dyn JournalStore>) -> Self {
        Self { store }
    }

    /// Open (or create) the journal kept in a deployment directory.
    pub fn open(deployment_dir: &Path, backend: Backend) -> Result<Self> {
        Ok(Self::new(open_store(deployment_dir, backend)?))
    }

    /// Volatile journal, for rehearsals and tests.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(Box::new(super::store::SqliteStore::open_in_memory()?)))
    }

    pub fn lookup(&self, module: &str, descriptor: &str) -> Result<Option<JournalEntry>> {
        self.store.get(module, descriptor)
    }

    /// All entries, optionally restricted to one module.
    pub fn entries(&self, module: Option<&str>) -> Result<Vec<JournalEntry>> {
        let mut all = self.store.entries()?;
        if let Some(m) = module {
            all.retain(|e| e.module == m);
        }
        Ok(all)
    }

    /// Claim a descriptor for execution.
    pub fn mark_pending(&self, module: &str, descriptor: &Descriptor) -> Result<JournalEntry> {
        let key = entry_key(module, &descriptor.id);
        let fingerprint = descriptor.fingerprint();
        let current = self.store.get(module, &descriptor.id)?;

        let next = match &current {
            None => JournalEntry {
                module: module.to_string(),
                descriptor: descriptor.id.clone(),
                kind: descriptor.kind.clone(),
                fingerprint,
                status: EntryStatus::Pending,
                result: None,
                error: None,
                attempts: 1,
                revision: 1,
                updated_at: now_iso8601(),
            },
            Some(e) if e.status == EntryStatus::Completed => {
                return Err(KilnError::InvalidTransition {
                    key,
                    from: e.status.to_string(),
                    to: EntryStatus::Pending.to_string(),
                });
            }
            Some(e) => {
                if e.fingerprint != fingerprint || e.kind != descriptor.kind {
                    return Err(KilnError::JournalConflict {
                        key,
                        detail: "declaration changed since the previous attempt".to_string(),
                    });
                }
                JournalEntry {
                    status: EntryStatus::Pending,
                    error: None,
                    attempts: e.attempts + 1,
                    revision: e.revision + 1,
                    updated_at: now_iso8601(),
                    ..e.clone()
                }
            }
        };

        self.swap(&key, current.map(|e| e.revision), next)
    }

    /// Record a materialized result. Idempotent for an identical result.
    pub fn mark_completed(
        &self,
        module: &str,
        descriptor: &str,
        result: &str,
    ) -> Result<JournalEntry> {
        let key = entry_key(module, descriptor);
        let current = self.require(module, descriptor, &key, EntryStatus::Completed)?;

        match current.status {
            EntryStatus::Completed => {
                if current.result.as_deref() == Some(result) {
                    return Ok(current);
                }
                Err(KilnError::JournalConflict {
                    key,
                    detail: format!(
                        "recorded result {} differs from {}",
                        current.result.as_deref().unwrap_or("<none>"),
                        result
                    ),
                })
            }
            EntryStatus::Pending => {
                let expected = current.revision;
                let next = JournalEntry {
                    status: EntryStatus::Completed,
                    result: Some(result.to_string()),
                    error: None,
                    revision: current.revision + 1,
                    updated_at: now_iso8601(),
                    ..current
                };
                self.swap(&key, Some(expected), next)
            }
            EntryStatus::Failed => Err(KilnError::InvalidTransition {
                key,
                from: current.status.to_string(),
                to: EntryStatus::Completed.to_string(),
            }),
        }
    }

    /// Record a creation failure.
    pub fn mark_failed(&self, module: &str, descriptor: &str, error: &str) -> Result<JournalEntry> {
        let key = entry_key(module, descriptor);
        let current = self.require(module, descriptor, &key, EntryStatus::Failed)?;
        if current.status != EntryStatus::Pending {
            return Err(KilnError::InvalidTransition {
                key,
                from: current.status.to_string(),
                to: EntryStatus::Failed.to_string(),
            });
        }
        let expected = current.revision;
        let next = JournalEntry {
            status: EntryStatus::Failed,
            error: Some(error.to_string()),
            revision: current.revision + 1,
            updated_at: now_iso8601(),
            ..current
        };
        self.swap(&key, Some(expected), next)
    }

    /// Forget a Failed or Pending entry so the descriptor starts fresh.
    pub fn wipe(&self, module: &str, descriptor: &str) -> Result<JournalEntry> {
        let key = entry_key(module, descriptor);
        let current = self
            .store
            .get(module, descriptor)?
            .ok_or_else(|| KilnError::JournalConflict {
                key: key.clone(),
                detail: "no journal entry to wipe".to_string(),
            })?;
        if current.status == EntryStatus::Completed {
            return Err(KilnError::InvalidTransition {
                key,
                from: current.status.to_string(),
                to: "WIPED".to_string(),
            });
        }
        if !self.store.remove(module, descriptor, current.revision)? {
            return Err(concurrent(key));
        }
        debug!(entry = %current.key(), "wiped journal entry");
        Ok(current)
    }

    fn require(
        &self,
        module: &str,
        descriptor: &str,
        key: &str,
        to: EntryStatus,
    ) -> Result<JournalEntry> {
        self.store
            .get(module, descriptor)?
            .ok_or_else(|| KilnError::InvalidTransition {
                key: key.to_string(),
                from: "UNSTARTED".to_string(),
                to: to.to_string(),
            })
    }

    fn swap(&self, key: &str, expected: Option<u64>, next: JournalEntry) -> Result<JournalEntry> {
        if !self.store.compare_and_set(expected, &next)? {
            return Err(concurrent(key.to_string()));
        }
        debug!(entry = key, status = %next.status, revision = next.revision, "journal write");
        Ok(next)
    }
}

fn concurrent(key: String) -> KilnError {
    KilnError::JournalConflict {
        key,
        detail: "entry was modified concurrently".to_string(),
    }
}
