//! Scan target variants and canonical identity.
//!
//! A target is one unit of work for the pool: a single (possibly dangling)
//! commit, a whole repository, or an organization that the source layer
//! expands into commit targets. Targets are immutable once produced and are
//! identified by their canonical key, which is also the deduplication and
//! resume key.

use chrono::{DateTime, Utc};

/// One unit of scan work.
///
/// The kind is explicit so the scan task dispatches on it instead of
/// sniffing which fields happen to be populated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Commit(CommitTarget),
    Repository(RepositoryTarget),
    Organization(OrganizationTarget),
}

/// A dangling (or regular) commit inside a host repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTarget {
    pub organization: String,
    pub repository: String,
    /// The commit to fetch and check out; for force-push events this object
    /// is typically unreachable from any branch.
    pub commit: String,
    /// The remote tip that the force push overwrote, when the event recorded it.
    pub before_commit: Option<String>,
    pub stars: Option<u32>,
    pub pushed_at: Option<DateTime<Utc>>,
}

/// A whole repository, optionally pinned to a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryTarget {
    pub owner: String,
    pub name: String,
    pub pinned_commit: Option<String>,
    /// Explicit clone URL; when absent the configured clone base applies.
    pub clone_url: Option<String>,
    /// Size hint in kilobytes, when the source knows it.
    pub size_kb: Option<u64>,
    pub stars: Option<u32>,
    pub pushed_at: Option<DateTime<Utc>>,
}

/// An organization, expanded by the source layer into commit targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrganizationTarget {
    pub organization: String,
    pub flags: OrgFilterFlags,
}

/// Filters applied when expanding an organization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OrgFilterFlags {
    /// Drop the org unless the event store has rows for it.
    pub require_events: bool,
}

impl Target {
    /// The string uniquely identifying this target within a run.
    ///
    /// `org/repo@commit` for commits, `owner/repo` for repositories, `org`
    /// for organizations. This is the dedup key, the resume key, and the key
    /// recorded in the progress store.
    pub fn canonical_key(&self) -> String {
        match self {
            Target::Commit(c) => format!("{}/{}@{}", c.organization, c.repository, c.commit),
            Target::Repository(r) => format!("{}/{}", r.owner, r.name),
            Target::Organization(o) => o.organization.clone(),
        }
    }

    /// The organization a finding from this target is attributed to.
    pub fn organization(&self) -> &str {
        match self {
            Target::Commit(c) => &c.organization,
            Target::Repository(r) => &r.owner,
            Target::Organization(o) => &o.organization,
        }
    }

    /// Clone URL for the host repository, resolved against `clone_base`
    /// (e.g. `https://github.com`) unless the target carries an explicit one.
    ///
    /// Returns `None` for organization targets; those never reach the scan
    /// task directly.
    pub fn repository_url(&self, clone_base: &str) -> Option<String> {
        let base = clone_base.trim_end_matches('/');
        match self {
            Target::Commit(c) => {
                Some(format!("{}/{}/{}", base, c.organization, c.repository))
            }
            Target::Repository(r) => Some(
                r.clone_url
                    .clone()
                    .unwrap_or_else(|| format!("{}/{}/{}", base, r.owner, r.name)),
            ),
            Target::Organization(_) => None,
        }
    }

    /// The commit the scan task must check out, when the target pins one.
    pub fn pinned_commit(&self) -> Option<&str> {
        match self {
            Target::Commit(c) => Some(&c.commit),
            Target::Repository(r) => r.pinned_commit.as_deref(),
            Target::Organization(_) => None,
        }
    }

    pub fn stars(&self) -> Option<u32> {
        match self {
            Target::Commit(c) => c.stars,
            Target::Repository(r) => r.stars,
            Target::Organization(_) => None,
        }
    }

    pub fn pushed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Target::Commit(c) => c.pushed_at,
            Target::Repository(r) => r.pushed_at,
            Target::Organization(_) => None,
        }
    }

    /// Parse an explicit target spec from the command line.
    ///
    /// Accepted forms: `org`, `owner/repo`, `org/repo@commit`.
    pub fn parse_spec(spec: &str) -> Result<Target, String> {
        let spec = spec.trim();
        if spec.is_empty() {
            return Err("target spec is empty".to_string());
        }

        let (repo_part, commit) = match spec.split_once('@') {
            Some((r, c)) => {
                if c.is_empty() {
                    return Err(format!("target spec '{spec}' has an empty commit"));
                }
                (r, Some(c))
            }
            None => (spec, None),
        };

        let mut segments = repo_part.split('/');
        let first = segments.next().unwrap_or_default();
        let second = segments.next();
        if first.is_empty() || segments.next().is_some() || second == Some("") {
            return Err(format!(
                "target spec '{spec}' is not of the form org, owner/repo, or org/repo@commit"
            ));
        }

        match (second, commit) {
            (Some(repo), Some(sha)) => Ok(Target::Commit(CommitTarget {
                organization: first.to_string(),
                repository: repo.to_string(),
                commit: sha.to_string(),
                before_commit: None,
                stars: None,
                pushed_at: None,
            })),
            (Some(repo), None) => Ok(Target::Repository(RepositoryTarget {
                owner: first.to_string(),
                name: repo.to_string(),
                pinned_commit: None,
                clone_url: None,
                size_kb: None,
                stars: None,
                pushed_at: None,
            })),
            (None, Some(_)) => Err(format!(
                "target spec '{spec}' names a commit without a repository"
            )),
            (None, None) => Ok(Target::Organization(OrganizationTarget {
                organization: first.to_string(),
                flags: OrgFilterFlags::default(),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(org: &str, repo: &str, sha: &str) -> Target {
        Target::Commit(CommitTarget {
            organization: org.to_string(),
            repository: repo.to_string(),
            commit: sha.to_string(),
            before_commit: None,
            stars: None,
            pushed_at: None,
        })
    }

    #[test]
    fn test_canonical_keys() {
        assert_eq!(commit("acme", "app", "deadbeef").canonical_key(), "acme/app@deadbeef");

        let repo = Target::parse_spec("acme/app").unwrap();
        assert_eq!(repo.canonical_key(), "acme/app");

        let org = Target::parse_spec("acme").unwrap();
        assert_eq!(org.canonical_key(), "acme");
    }

    #[test]
    fn test_parse_spec_variants() {
        assert!(matches!(Target::parse_spec("acme").unwrap(), Target::Organization(_)));
        assert!(matches!(Target::parse_spec("acme/app").unwrap(), Target::Repository(_)));
        assert!(matches!(
            Target::parse_spec("acme/app@deadbeef").unwrap(),
            Target::Commit(_)
        ));
    }

    #[test]
    fn test_parse_spec_rejects_malformed() {
        assert!(Target::parse_spec("").is_err());
        assert!(Target::parse_spec("a/b/c").is_err());
        assert!(Target::parse_spec("acme@deadbeef").is_err());
        assert!(Target::parse_spec("acme/app@").is_err());
        assert!(Target::parse_spec("acme/").is_err());
    }

    #[test]
    fn test_repository_url_uses_clone_base() {
        let t = commit("acme", "app", "deadbeef");
        assert_eq!(
            t.repository_url("https://github.com").as_deref(),
            Some("https://github.com/acme/app")
        );
        // Trailing slash on the base collapses
        assert_eq!(
            t.repository_url("https://ghe.example.com/").as_deref(),
            Some("https://ghe.example.com/acme/app")
        );
    }

    #[test]
    fn test_repository_url_prefers_explicit_clone_url() {
        let t = Target::Repository(RepositoryTarget {
            owner: "acme".to_string(),
            name: "app".to_string(),
            pinned_commit: None,
            clone_url: Some("file:///fixtures/acme/app".to_string()),
            size_kb: None,
            stars: None,
            pushed_at: None,
        });
        assert_eq!(
            t.repository_url("https://github.com").as_deref(),
            Some("file:///fixtures/acme/app")
        );
    }

    #[test]
    fn test_org_targets_have_no_url() {
        let org = Target::parse_spec("acme").unwrap();
        assert_eq!(org.repository_url("https://github.com"), None);
    }
}
