use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use cairn_core::maintenance::{maintenance, MaintenanceOptions};
use cairn_core::repo::Repository;
use cairn_core::reporter::Reporter;
use cairn_core::snapshot::backup::{backup, BackupOptions};
use cairn_core::snapshot::check::{check, CheckEvent, CheckOptions};
use cairn_core::snapshot::importer::FsImporter;
use cairn_core::snapshot::restore::restore;
use cairn_core::snapshot::Snapshot;
use cairn_core::storage::StoreRegistry;
use cairn_core::{CairnError, Result, ResourceType};

use cairn_core::context::AppContext;

/// Where a repository identifier resolves to: a store location plus the
/// passphrase needed to open it.
#[derive(Debug, Clone)]
pub struct RepoTarget {
    pub location: String,
    pub passphrase: Option<String>,
}

/// Maps `@name` references from the configuration DSL to repository
/// targets. Bare locations pass through untouched.
#[derive(Default)]
pub struct RepoResolver {
    entries: HashMap<String, RepoTarget>,
}

impl RepoResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reference: &str, target: RepoTarget) {
        self.entries.insert(reference.to_string(), target);
    }

    pub fn resolve(&self, ident: &str) -> Result<RepoTarget> {
        if let Some(target) = self.entries.get(ident) {
            return Ok(target.clone());
        }
        if ident.starts_with('@') {
            return Err(CairnError::Config(format!(
                "unknown repository reference '{ident}'"
            )));
        }
        Ok(RepoTarget {
            location: ident.to_string(),
            passphrase: None,
        })
    }
}

/// What a job does when it fires.
#[derive(Debug, Clone)]
pub enum Task {
    Backup {
        repository: String,
        path: String,
        retention: Option<Duration>,
    },
    Check {
        repository: String,
    },
    Restore {
        repository: String,
        target: String,
    },
    Maintenance {
        repository: String,
    },
    Sync {
        source: String,
        destination: String,
    },
    Rm {
        repository: String,
        retention: Duration,
    },
}

impl Task {
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Backup { .. } => "backup",
            Task::Check { .. } => "check",
            Task::Restore { .. } => "restore",
            Task::Maintenance { .. } => "maintenance",
            Task::Sync { .. } => "sync",
            Task::Rm { .. } => "rm",
        }
    }

    /// Execute the task. Errors surface to the job runner, which reports
    /// them and keeps the scheduler alive.
    pub fn run(
        &self,
        ctx: &AppContext,
        registry: &StoreRegistry,
        resolver: &RepoResolver,
        reporter: &dyn Reporter,
        job_name: &str,
    ) -> Result<()> {
        match self {
            Task::Backup {
                repository,
                path,
                retention,
            } => {
                let mut repo = open_repo(ctx, registry, resolver, repository)?;
                reporter.with_repository_name(repository);
                let importer = FsImporter::new(Path::new(path));
                let (snapshot_mac, stats) = backup(
                    &mut repo,
                    &importer,
                    &BackupOptions {
                        name: job_name.to_string(),
                    },
                )?;
                reporter.with_snapshot_id(snapshot_mac);
                if stats.errors > 0 {
                    reporter.task_warning(&format!(
                        "{} of {} files could not be read",
                        stats.errors,
                        stats.errors + stats.files
                    ));
                }
                if let Some(retention) = retention {
                    apply_retention(&mut repo, *retention)?;
                }
                repo.close()
            }
            Task::Check { repository } => {
                let repo = open_repo(ctx, registry, resolver, repository)?;
                reporter.with_repository_name(repository);
                let mut failures = 0usize;
                for snapshot in repo.list_snapshots() {
                    let ok = check(
                        &repo,
                        snapshot,
                        &CheckOptions { fast: false },
                        &mut |event| {
                            if let CheckEvent::ChunkCorrupted(mac) = event {
                                warn!(snapshot = %snapshot, chunk = %mac, "corrupt chunk");
                            }
                        },
                    )?;
                    if !ok {
                        failures += 1;
                    }
                }
                repo.close()?;
                if failures > 0 {
                    return Err(CairnError::Other(format!(
                        "{failures} snapshot(s) failed verification"
                    )));
                }
                Ok(())
            }
            Task::Restore { repository, target } => {
                let repo = open_repo(ctx, registry, resolver, repository)?;
                reporter.with_repository_name(repository);
                let latest = latest_snapshot(&repo)?
                    .ok_or_else(|| CairnError::Other("no snapshot to restore".into()))?;
                let stats = restore(&repo, latest, Path::new(target))?;
                info!(files = stats.files, bytes = stats.bytes, "restore complete");
                repo.close()
            }
            Task::Maintenance { repository } => {
                let mut repo = open_repo(ctx, registry, resolver, repository)?;
                reporter.with_repository_name(repository);
                let stats = maintenance(&mut repo, &MaintenanceOptions::default())?;
                info!(
                    rewritten = stats.packfiles_rewritten,
                    deleted = stats.packfiles_deleted,
                    "maintenance complete"
                );
                repo.close()
            }
            Task::Sync {
                source,
                destination,
            } => {
                let src = open_repo(ctx, registry, resolver, source)?;
                let mut dst = open_repo(ctx, registry, resolver, destination)?;
                reporter.with_repository_name(destination);
                let copied = sync_repositories(ctx, &src, &mut dst)?;
                info!(snapshots = copied, "sync complete");
                src.close()?;
                dst.close()
            }
            Task::Rm {
                repository,
                retention,
            } => {
                let mut repo = open_repo(ctx, registry, resolver, repository)?;
                reporter.with_repository_name(repository);
                let removed = apply_retention(&mut repo, *retention)?;
                info!(removed, "retention pass complete");
                repo.close()
            }
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Task::Backup {
                repository, path, ..
            } => write!(f, "backup {path} on {repository}"),
            Task::Check { repository } => write!(f, "check {repository}"),
            Task::Restore { repository, target } => {
                write!(f, "restore {repository} to {target}")
            }
            Task::Maintenance { repository } => write!(f, "maintenance {repository}"),
            Task::Sync {
                source,
                destination,
            } => write!(f, "sync {source} to {destination}"),
            Task::Rm { repository, .. } => write!(f, "rm {repository}"),
        }
    }
}

fn open_repo(
    ctx: &AppContext,
    registry: &StoreRegistry,
    resolver: &RepoResolver,
    ident: &str,
) -> Result<Repository> {
    let target = resolver.resolve(ident)?;
    Repository::open(
        ctx,
        registry,
        &target.location,
        target.passphrase.as_deref(),
    )
}

/// Most recently created visible snapshot, by the timestamp inside the
/// snapshot document.
fn latest_snapshot(repo: &Repository) -> Result<Option<cairn_core::Mac>> {
    let mut latest = None;
    for mac in repo.list_snapshots() {
        let snapshot = Snapshot::load(repo, mac)?;
        match latest {
            Some((created, _)) if created >= snapshot.created => {}
            _ => latest = Some((snapshot.created, mac)),
        }
    }
    Ok(latest.map(|(_, mac)| mac))
}

/// Tombstone snapshots older than the retention window. Returns how many
/// were removed.
fn apply_retention(repo: &mut Repository, retention: Duration) -> Result<usize> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(retention)
            .map_err(|_| CairnError::Config("retention duration out of range".into()))?;
    let mut removed = 0;
    for mac in repo.list_snapshots() {
        let snapshot = Snapshot::load(repo, mac)?;
        if snapshot.created < cutoff {
            repo.delete_snapshot(mac)?;
            info!(snapshot = %mac, "removed by retention");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Copy every source snapshot the destination does not have yet.
///
/// MACs are keyed per repository, so chunks are re-addressed under the
/// destination key and the snapshot document is rewritten accordingly;
/// chunk boundaries are preserved, and already-present chunks copy
/// nothing.
fn sync_repositories(
    ctx: &AppContext,
    src: &Repository,
    dst: &mut Repository,
) -> Result<usize> {
    let mut copied = 0;
    for snapshot_mac in src.list_snapshots() {
        ctx.check_cancelled()?;
        let snapshot = Snapshot::load(src, snapshot_mac)?;

        // First pass: re-address every chunk under the destination key to
        // learn the rewritten snapshot's identity.
        let mut files = Vec::with_capacity(snapshot.files.len());
        for file in &snapshot.files {
            let mut chunks = Vec::with_capacity(file.chunks.len());
            for &chunk in &file.chunks {
                let data = src.get_blob(ResourceType::Chunk, chunk)?;
                chunks.push(dst.compute_mac(&data));
            }
            files.push(cairn_core::snapshot::FileEntry {
                path: file.path.clone(),
                size: file.size,
                chunks,
            });
        }
        let rewritten = Snapshot {
            name: snapshot.name.clone(),
            created: snapshot.created,
            total_size: snapshot.total_size,
            files,
        };
        let doc = rmp_serde::to_vec(&rewritten)
            .map_err(|e| CairnError::Other(format!("encode snapshot: {e}")))?;
        let new_mac = dst.compute_mac(&doc);
        if dst.snapshot_visible(new_mac) {
            continue;
        }

        // Second pass: copy what is missing and declare the snapshot.
        let mut session = dst.session();
        for file in &snapshot.files {
            for &chunk in &file.chunks {
                let data = src.get_blob(ResourceType::Chunk, chunk)?;
                session.put_blob(ResourceType::Chunk, &data)?;
            }
        }
        session.put_blob(ResourceType::Snapshot, &doc)?;
        session.record_snapshot(new_mac);
        session.commit()?;
        copied += 1;
    }
    Ok(copied)
}
