//! creating, updating and removing the mirrored repositories under a base
//! directory
//!
//! layout:
//!
//! ```text
//! <base>/settings.toml              optional engine settings
//! <base>/ssh/                       the engine's key pair
//! <base>/repos/<provider>/<name>/   one bare repository per remote
//! <base>/repos/.staging/<uuid>/     clones in progress
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{Remote, Settings};
use crate::error::{Error, IoResultExt, Result};
use crate::hash::ObjectId;
use crate::identity::{Identity, PublicKeyInfo};
use crate::object::{ObjectStore, Quarantine};
use crate::ops::is_ancestor;
use crate::progress::{CancellationToken, ProgressSink};
use crate::refs::{branch_ref, read_symbolic, tracking_ref, try_read_ref, update_ref, write_symbolic};
use crate::repo::Repo;
use crate::transport::{
    fetch_pack, list_remote_refs, AuthMode, FetchRequest, Provider, RemoteDescriptor,
};

pub const REPOS_DIR: &str = "repos";
const STAGING_DIR: &str = ".staging";

pub fn repos_dir(base: &Path) -> PathBuf {
    base.join(REPOS_DIR)
}

fn staging_dir(base: &Path) -> PathBuf {
    repos_dir(base).join(STAGING_DIR)
}

/// where the repository for `provider`/`name` lives
pub fn repo_path(base: &Path, provider: Provider, name: &str) -> Result<PathBuf> {
    validate_repo_name(name)?;
    Ok(repos_dir(base).join(provider.as_str()).join(name))
}

fn validate_repo_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('.')
        || name.contains(['/', '\\', '\0'])
        || name.chars().any(char::is_control);
    if bad {
        return Err(Error::InvalidRepoName(name.to_string()));
    }
    Ok(())
}

/// result of preparing a base directory
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemInfo {
    pub base: PathBuf,
    pub public_key: PublicKeyInfo,
}

/// prepare `base` for use: directory layout, settings, ssh identity
///
/// safe to call repeatedly; an existing key pair is kept.
pub fn init_system(base: &Path) -> Result<SystemInfo> {
    let staging = staging_dir(base);
    fs::create_dir_all(&staging).with_path(&staging)?;
    Settings::load(base)?;
    let public_key = Identity::new(base).ensure()?;
    info!(base = %base.display(), "system initialized");
    Ok(SystemInfo {
        base: base.to_path_buf(),
        public_key,
    })
}

/// what a clone request names
pub struct InitRequest<'a> {
    pub url: &'a str,
    pub name: &'a str,
    /// inferred from the url when absent
    pub provider: Option<Provider>,
    pub auth: &'a AuthMode,
    pub settings: &'a Settings,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitReport {
    pub path: PathBuf,
    /// none for an empty remote
    pub default_branch: Option<String>,
    pub head: Option<ObjectId>,
    /// false when the repository already existed
    #[serde(skip)]
    pub created: bool,
}

/// removes a staging directory unless the clone completed
struct Staging {
    path: PathBuf,
    armed: bool,
}

impl Staging {
    fn new(base: &Path) -> Result<Self> {
        let path = staging_dir(base).join(uuid::Uuid::new_v4().to_string());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        Ok(Self { path, armed: true })
    }

    /// move the staged repository to `target`
    fn install(mut self, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).with_path(parent)?;
        }
        fs::rename(&self.path, target).with_path(target)?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.armed && self.path.exists() {
            match fs::remove_dir_all(&self.path) {
                Ok(()) => debug!(path = %self.path.display(), "removed staging"),
                Err(e) => warn!(path = %self.path.display(), error = %e, "failed to remove staging"),
            }
        }
    }
}

/// clone `request.url` into `<base>/repos/<provider>/<name>`
///
/// an existing repository is opened instead and its stored url refreshed.
/// a new clone is assembled in staging and only renamed into place once its
/// objects and refs are complete, so a failure leaves nothing behind.
pub fn init_repo(
    base: &Path,
    request: &InitRequest<'_>,
    sink: &mut ProgressSink<'_>,
    cancel: &CancellationToken,
) -> Result<InitReport> {
    let remote = RemoteDescriptor::new(request.url, request.provider, request.auth.clone())?;
    let target = repo_path(base, remote.provider, request.name)?;

    if target.join("config.toml").is_file() {
        let mut repo = Repo::open(&target)?;
        if repo.config().remote_url() != Some(request.url) {
            info!(path = %target.display(), url = request.url, "updating remote url");
            repo.config_mut().remote = Some(Remote::origin(request.url, remote.provider.as_str()));
            repo.save_config()?;
        }
        return Ok(InitReport {
            default_branch: repo.config().default_branch.clone(),
            head: head_commit(&repo)?,
            path: target,
            created: false,
        });
    }

    let adv = list_remote_refs(&remote, request.settings)?;
    cancel.check()?;

    let staging = Staging::new(base)?;
    let mut repo = Repo::init(&staging.path, adv.object_format)?;
    repo.config_mut().remote = Some(Remote::origin(request.url, remote.provider.as_str()));

    let default_branch = adv.default_branch().map(|r| r.short_name().to_string());
    let mut head = None;
    match &default_branch {
        Some(branch) => {
            let quarantine = Quarantine::new(&repo)?;
            let fetch = FetchRequest {
                remote: &remote,
                branch,
                settings: request.settings,
                cancel,
            };
            let outcome = fetch_pack(&repo, &quarantine, &fetch, sink)?;
            cancel.check()?;
            quarantine.promote(&outcome.promote_order)?;

            update_ref(&repo, &tracking_ref(branch), &outcome.tip, None)?;
            update_ref(&repo, &branch_ref(branch), &outcome.tip, None)?;
            write_symbolic(&repo, "HEAD", &branch_ref(branch))?;
            head = Some(outcome.tip);
            repo.config_mut().default_branch = Some(branch.clone());
        }
        None => {
            if let Some(target) = &adv.head {
                write_symbolic(&repo, "HEAD", target)?;
            }
            info!(url = request.url, "remote is empty");
        }
    }
    repo.save_config()?;

    if target.exists() {
        return Err(Error::Io {
            path: target,
            source: std::io::Error::new(
                std::io::ErrorKind::AlreadyExists,
                "target appeared while cloning",
            ),
        });
    }
    staging.install(&target)?;

    info!(
        url = request.url,
        path = %target.display(),
        branch = default_branch.as_deref().unwrap_or("-"),
        "repository initialized"
    );
    Ok(InitReport {
        path: target,
        default_branch,
        head,
        created: true,
    })
}

fn head_commit(repo: &Repo) -> Result<Option<ObjectId>> {
    match read_symbolic(repo, "HEAD")? {
        Some(target) => try_read_ref(repo, &target),
        None => try_read_ref(repo, "HEAD"),
    }
}

/// the remote a repository mirrors
pub fn remote_of(repo: &Repo, auth: AuthMode) -> Result<RemoteDescriptor> {
    let remote = repo
        .config()
        .remote
        .as_ref()
        .ok_or_else(|| Error::NoRemote(repo.path().to_path_buf()))?;
    let provider = remote.provider.parse::<Provider>().ok();
    RemoteDescriptor::new(&remote.url, provider, auth)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchReport {
    pub branch: String,
    pub tip: ObjectId,
    /// tracking ref value before the fetch
    pub previous: Option<ObjectId>,
    pub received: u64,
    pub up_to_date: bool,
}

/// bring `refs/remotes/origin/<branch>` up to date with the remote
///
/// objects are verified and promoted before the tracking ref moves. the
/// local branch is created when missing and fast-forwarded when possible;
/// a diverged local branch is left alone.
pub fn fetch(
    repo: &Repo,
    remote: &RemoteDescriptor,
    branch: &str,
    settings: &Settings,
    sink: &mut ProgressSink<'_>,
    cancel: &CancellationToken,
) -> Result<FetchReport> {
    let _lock = repo.lock_shared()?;
    let tracking = tracking_ref(branch);
    let previous = try_read_ref(repo, &tracking)?;

    let quarantine = Quarantine::new(repo)?;
    let request = FetchRequest {
        remote,
        branch,
        settings,
        cancel,
    };
    let outcome = fetch_pack(repo, &quarantine, &request, sink)?;
    cancel.check()?;
    if outcome.already_present {
        quarantine.discard()?;
    } else {
        quarantine.promote(&outcome.promote_order)?;
    }

    let tip = outcome.tip;
    if previous != Some(tip) {
        update_ref(repo, &tracking, &tip, previous.as_ref())?;
    }
    advance_local_branch(repo, branch, &tip)?;

    Ok(FetchReport {
        branch: branch.to_string(),
        tip,
        previous,
        received: outcome.received,
        up_to_date: previous == Some(tip),
    })
}

fn advance_local_branch(repo: &Repo, branch: &str, tip: &ObjectId) -> Result<()> {
    let name = branch_ref(branch);
    match try_read_ref(repo, &name)? {
        None => update_ref(repo, &name, tip, None),
        Some(local) if local == *tip => Ok(()),
        Some(local) => {
            let store = ObjectStore::open(repo);
            if is_ancestor(&store, &local, tip)? {
                debug!(branch, from = %local, to = %tip, "fast-forwarding local branch");
                update_ref(repo, &name, tip, Some(&local))
            } else {
                warn!(branch, local = %local, remote = %tip, "local branch has diverged, not updating");
                Ok(())
            }
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteReport {
    pub path: PathBuf,
    /// false when there was nothing to delete
    pub removed: bool,
}

/// remove the repository mirroring `url`
///
/// refuses while a fetch holds the repository, or when the directory
/// belongs to another url. other repositories and the identity are untouched.
pub fn delete_repo(base: &Path, url: &str, name: &str, provider: Provider) -> Result<DeleteReport> {
    let path = repo_path(base, provider, name)?;
    if !path.exists() {
        return Ok(DeleteReport {
            path,
            removed: false,
        });
    }

    let repo = Repo::open(&path)?;
    let lock = repo.lock()?;
    let found = repo.config().remote_url().unwrap_or_default();
    if found != url {
        return Err(Error::RemoteMismatch {
            path,
            found: found.to_string(),
            requested: url.to_string(),
        });
    }

    let trash = repos_dir(base).join(format!(".trash-{}", uuid::Uuid::new_v4()));
    fs::rename(&path, &trash).with_path(&trash)?;
    drop(lock);
    fs::remove_dir_all(&trash).with_path(&trash)?;

    info!(url, path = %path.display(), "repository deleted");
    Ok(DeleteReport {
        path,
        removed: true,
    })
}

/// every repository under `base` whose remote url is `url`
pub fn find_by_url(base: &Path, url: &str) -> Result<Option<PathBuf>> {
    let repos = repos_dir(base);
    let providers = match fs::read_dir(&repos) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_path(&repos),
    };
    for provider in providers {
        let provider = provider.with_path(&repos)?;
        if provider.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let dir = provider.path();
        if !dir.is_dir() {
            continue;
        }
        for entry in fs::read_dir(&dir).with_path(&dir)? {
            let path = entry.with_path(&dir)?.path();
            if !path.join("config.toml").is_file() {
                continue;
            }
            match Repo::open(&path) {
                Ok(repo) if repo.config().remote_url() == Some(url) => return Ok(Some(path)),
                Ok(_) => {}
                Err(e) => debug!(path = %path.display(), error = %e, "skipping unreadable repository"),
            }
        }
    }
    Ok(None)
}
