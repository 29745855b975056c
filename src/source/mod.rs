//! Target enumeration.
//!
//! Produces the finite, ordered, deduplicated stream of targets the pool
//! consumes. Backends: a SQLite events database, a CSV events export, an
//! organization list file, or a single explicit spec. Organization targets
//! are expanded here, against the event backend, into repository targets;
//! the pool never sees an organization.

mod events_db;
mod events_file;
mod org_list;

pub use events_db::EventsDb;
pub use events_file::read_events_file;
pub use org_list::parse_org_list;

use indexmap::IndexSet;
use rand::SeedableRng;
use rand::seq::SliceRandom;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::path::Path;

use crate::config::{OrderPolicy, RunConfig};
use crate::target::{CommitTarget, OrganizationTarget, RepositoryTarget, Target};

/// Errors that abort the run before any target is processed.
#[derive(Debug)]
pub enum SourceError {
    /// The backing store cannot be opened or is required but absent.
    Unavailable { what: String, detail: String },
    /// An explicit target spec does not parse.
    InvalidSpec { spec: String, detail: String },
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::Unavailable { what, detail } => {
                write!(f, "target source unavailable: {what}: {detail}")
            }
            SourceError::InvalidSpec { spec, detail } => {
                write!(f, "invalid target '{spec}': {detail}")
            }
        }
    }
}

impl std::error::Error for SourceError {}

/// The materialized, ordered target sequence. Single-pass; construct a new
/// one to re-enumerate.
pub struct TargetStream {
    targets: std::vec::IntoIter<Target>,
    total: usize,
}

impl TargetStream {
    pub fn total(&self) -> usize {
        self.total
    }

    /// Bypass the backends for pool-level tests.
    #[cfg(test)]
    pub(crate) fn from_vec(targets: Vec<Target>) -> TargetStream {
        let total = targets.len();
        TargetStream {
            targets: targets.into_iter(),
            total,
        }
    }
}

impl Iterator for TargetStream {
    type Item = Target;

    fn next(&mut self) -> Option<Target> {
        self.targets.next()
    }
}

/// Rows loaded from a backend, plus whether the star metric was present
/// (its absence downgrades `stars` ordering).
#[derive(Debug)]
struct Enumerated {
    targets: Vec<Target>,
    has_stars: bool,
}

/// Enumerate, expand, deduplicate, and order targets per the run config.
pub fn stream(config: &RunConfig) -> Result<TargetStream, SourceError> {
    let events = open_event_backend(config)?;

    let enumerated = if let Some(spec) = &config.source.single {
        single_targets(spec, events.as_deref())?
    } else if let Some(path) = &config.source.orgs_file {
        org_list_targets(path, events.as_deref())?
    } else {
        match &events {
            Some(backend) => Enumerated {
                targets: backend
                    .all_commit_targets()?
                    .into_iter()
                    .map(Target::Commit)
                    .collect(),
                has_stars: backend.has_stars(),
            },
            None => {
                return Err(SourceError::Unavailable {
                    what: "event store".to_string(),
                    detail: "no backend configured".to_string(),
                });
            }
        }
    };

    let mut targets = dedup(enumerated.targets);
    apply_order(&mut targets, config.order, enumerated.has_stars);

    let total = targets.len();
    Ok(TargetStream {
        targets: targets.into_iter(),
        total,
    })
}

/// The event backend abstracts over the SQLite database and the CSV export,
/// which share a schema.
pub trait EventBackend {
    fn all_commit_targets(&self) -> Result<Vec<CommitTarget>, SourceError>;
    fn commit_targets_for_org(&self, org: &str) -> Result<Vec<CommitTarget>, SourceError>;
    fn has_stars(&self) -> bool;
    fn organizations(&self) -> Result<HashSet<String>, SourceError>;
}

fn open_event_backend(config: &RunConfig) -> Result<Option<Box<dyn EventBackend>>, SourceError> {
    if let Some(path) = &config.source.events_db {
        return Ok(Some(Box::new(EventsDb::open(path)?)));
    }
    if let Some(path) = &config.source.events_file {
        return Ok(Some(Box::new(read_events_file(path)?)));
    }
    Ok(None)
}

fn single_targets(
    spec: &str,
    events: Option<&dyn EventBackend>,
) -> Result<Enumerated, SourceError> {
    let target = Target::parse_spec(spec).map_err(|detail| SourceError::InvalidSpec {
        spec: spec.to_string(),
        detail,
    })?;
    match target {
        Target::Organization(org) => expand_org(&org, events),
        other => Ok(Enumerated {
            targets: vec![other],
            has_stars: false,
        }),
    }
}

fn org_list_targets(
    path: &Path,
    events: Option<&dyn EventBackend>,
) -> Result<Enumerated, SourceError> {
    let orgs = parse_org_list(path)?;

    // Cross-check against the event store when one is configured: orgs with
    // no recorded events have nothing to scan.
    let orgs: Vec<String> = match events {
        Some(backend) => {
            let known = backend.organizations()?;
            orgs.into_iter()
                .filter(|org| {
                    let keep = known.contains(org);
                    if !keep {
                        log::warn!("org '{org}' has no events in the backing store, skipping");
                    }
                    keep
                })
                .collect()
        }
        None => orgs,
    };

    let mut targets = Vec::new();
    let mut has_stars = false;
    for org in orgs {
        let org_target = OrganizationTarget {
            organization: org,
            flags: crate::target::OrgFilterFlags { require_events: true },
        };
        let expanded = expand_org(&org_target, events)?;
        has_stars |= expanded.has_stars;
        targets.extend(expanded.targets);
    }
    Ok(Enumerated { targets, has_stars })
}

/// Expand an organization into repository targets: one per distinct repo in
/// the org's events, carrying the repo's best star metric and latest push.
fn expand_org(
    org: &OrganizationTarget,
    events: Option<&dyn EventBackend>,
) -> Result<Enumerated, SourceError> {
    let backend = events.ok_or_else(|| SourceError::Unavailable {
        what: format!("organization '{}'", org.organization),
        detail: "expanding an organization requires --events-db or --events-file".to_string(),
    })?;

    let commits = backend.commit_targets_for_org(&org.organization)?;
    let mut repos: IndexSet<String> = IndexSet::new();
    let mut targets: Vec<Target> = Vec::new();
    for commit in commits {
        let key = format!("{}/{}", commit.organization, commit.repository);
        if repos.insert(key) {
            targets.push(Target::Repository(RepositoryTarget {
                owner: commit.organization.clone(),
                name: commit.repository.clone(),
                pinned_commit: None,
                clone_url: None,
                size_kb: None,
                stars: commit.stars,
                pushed_at: commit.pushed_at,
            }));
        } else if let Some(Target::Repository(existing)) = targets
            .iter_mut()
            .find(|t| t.canonical_key() == format!("{}/{}", commit.organization, commit.repository))
        {
            // Keep the strongest metrics seen across the repo's events
            existing.stars = existing.stars.max(commit.stars);
            existing.pushed_at = existing.pushed_at.max(commit.pushed_at);
        }
    }
    Ok(Enumerated {
        targets,
        has_stars: backend.has_stars(),
    })
}

/// Each canonical key is emitted at most once; first occurrence wins.
fn dedup(targets: Vec<Target>) -> Vec<Target> {
    let mut seen: IndexSet<String> = IndexSet::with_capacity(targets.len());
    targets
        .into_iter()
        .filter(|t| seen.insert(t.canonical_key()))
        .collect()
}

fn apply_order(targets: &mut Vec<Target>, policy: OrderPolicy, has_stars: bool) {
    let effective = match policy {
        OrderPolicy::Stars if !has_stars => {
            log::warn!("star metric absent from the backing store; ordering downgraded to random");
            OrderPolicy::Random
        }
        other => other,
    };

    match effective {
        OrderPolicy::FileOrder => {}
        OrderPolicy::Random => {
            let seed = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
            targets.shuffle(&mut rng);
        }
        OrderPolicy::Latest => {
            targets.sort_by_key(|t| Reverse(t.pushed_at()));
        }
        OrderPolicy::Stars => {
            targets.sort_by(|a, b| {
                Reverse(a.stars().unwrap_or(0))
                    .cmp(&Reverse(b.stars().unwrap_or(0)))
                    .then_with(|| a.canonical_key().cmp(&b.canonical_key()))
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn commit(org: &str, repo: &str, sha: &str, stars: Option<u32>, ts: i64) -> Target {
        Target::Commit(CommitTarget {
            organization: org.to_string(),
            repository: repo.to_string(),
            commit: sha.to_string(),
            before_commit: None,
            stars,
            pushed_at: Some(Utc.timestamp_opt(ts, 0).unwrap()),
        })
    }

    #[test]
    fn test_dedup_keeps_first_occurrence() {
        let targets = vec![
            commit("a", "x", "1", Some(5), 100),
            commit("a", "x", "2", None, 200),
            commit("a", "x", "1", Some(9), 300),
        ];
        let deduped = dedup(targets);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].stars(), Some(5));
    }

    #[test]
    fn test_stars_order_descending_with_lexicographic_ties() {
        let mut targets = vec![
            commit("a", "low", "1", Some(1), 0),
            commit("b", "high", "2", Some(50), 0),
            commit("a", "tie2", "3", Some(10), 0),
            commit("a", "tie1", "4", Some(10), 0),
        ];
        apply_order(&mut targets, OrderPolicy::Stars, true);
        let keys: Vec<String> = targets.iter().map(|t| t.canonical_key()).collect();
        assert_eq!(keys, vec!["b/high@2", "a/tie1@4", "a/tie2@3", "a/low@1"]);
    }

    #[test]
    fn test_stars_downgrades_without_star_column() {
        let mut targets: Vec<Target> =
            (0..20).map(|i| commit("a", "x", &i.to_string(), None, i)).collect();
        // Downgrade shuffles rather than sorting; contents must be preserved
        let before: HashSet<String> = targets.iter().map(|t| t.canonical_key()).collect();
        apply_order(&mut targets, OrderPolicy::Stars, false);
        let after: HashSet<String> = targets.iter().map(|t| t.canonical_key()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_latest_order_descending() {
        let mut targets = vec![
            commit("a", "x", "old", None, 100),
            commit("a", "x", "new", None, 300),
            commit("a", "x", "mid", None, 200),
        ];
        apply_order(&mut targets, OrderPolicy::Latest, false);
        let keys: Vec<String> = targets.iter().map(|t| t.canonical_key()).collect();
        assert_eq!(keys, vec!["a/x@new", "a/x@mid", "a/x@old"]);
    }

    struct StubBackend {
        commits: Vec<CommitTarget>,
        has_stars: bool,
    }

    impl EventBackend for StubBackend {
        fn all_commit_targets(&self) -> Result<Vec<CommitTarget>, SourceError> {
            Ok(self.commits.clone())
        }
        fn commit_targets_for_org(&self, org: &str) -> Result<Vec<CommitTarget>, SourceError> {
            Ok(self.commits.iter().filter(|c| c.organization == org).cloned().collect())
        }
        fn has_stars(&self) -> bool {
            self.has_stars
        }
        fn organizations(&self) -> Result<HashSet<String>, SourceError> {
            Ok(self.commits.iter().map(|c| c.organization.clone()).collect())
        }
    }

    fn raw_commit(org: &str, repo: &str, sha: &str, stars: Option<u32>, ts: i64) -> CommitTarget {
        CommitTarget {
            organization: org.to_string(),
            repository: repo.to_string(),
            commit: sha.to_string(),
            before_commit: None,
            stars,
            pushed_at: Some(Utc.timestamp_opt(ts, 0).unwrap()),
        }
    }

    #[test]
    fn test_expand_org_groups_commits_by_repository() {
        let backend = StubBackend {
            commits: vec![
                raw_commit("acme", "app", "1", Some(3), 100),
                raw_commit("acme", "app", "2", Some(9), 300),
                raw_commit("acme", "lib", "3", None, 200),
                raw_commit("other", "tool", "4", Some(1), 50),
            ],
            has_stars: true,
        };
        let org = OrganizationTarget {
            organization: "acme".to_string(),
            flags: crate::target::OrgFilterFlags::default(),
        };
        let expanded = expand_org(&org, Some(&backend)).unwrap();
        assert!(expanded.has_stars);
        assert_eq!(expanded.targets.len(), 2);

        // One repository target per repo, carrying the best metrics seen
        let Target::Repository(app) = &expanded.targets[0] else {
            panic!("expected repository target");
        };
        assert_eq!(app.name, "app");
        assert_eq!(app.stars, Some(9));
        assert_eq!(app.pushed_at, Some(Utc.timestamp_opt(300, 0).unwrap()));
    }

    #[test]
    fn test_expand_org_without_backend_is_unavailable() {
        let org = OrganizationTarget {
            organization: "acme".to_string(),
            flags: crate::target::OrgFilterFlags::default(),
        };
        assert!(matches!(
            expand_org(&org, None).unwrap_err(),
            SourceError::Unavailable { .. }
        ));
    }

    #[test]
    fn test_org_list_cross_check_drops_unknown_orgs() {
        let dir = tempfile::tempdir().unwrap();
        let orgs_path = dir.path().join("orgs.txt");
        std::fs::write(&orgs_path, "acme\nghost-org\n").unwrap();

        let backend = StubBackend {
            commits: vec![raw_commit("acme", "app", "1", None, 100)],
            has_stars: false,
        };
        let enumerated = org_list_targets(&orgs_path, Some(&backend)).unwrap();
        let keys: Vec<String> = enumerated.targets.iter().map(|t| t.canonical_key()).collect();
        assert_eq!(keys, vec!["acme/app"]);
    }

    #[test]
    fn test_single_repo_spec_passes_through() {
        let enumerated = single_targets("acme/app", None).unwrap();
        assert_eq!(enumerated.targets.len(), 1);
        assert!(matches!(enumerated.targets[0], Target::Repository(_)));
    }

    #[test]
    fn test_file_order_is_preserved() {
        let mut targets = vec![
            commit("a", "x", "3", Some(1), 100),
            commit("a", "x", "1", Some(9), 300),
            commit("a", "x", "2", Some(5), 200),
        ];
        let before: Vec<String> = targets.iter().map(|t| t.canonical_key()).collect();
        apply_order(&mut targets, OrderPolicy::FileOrder, true);
        let after: Vec<String> = targets.iter().map(|t| t.canonical_key()).collect();
        assert_eq!(before, after);
    }
}
