use std::fs::File;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};

use crate::config::Config;
use crate::error::{Error, IoResultExt, Result};
use crate::hash::HashAlgorithm;

/// a bare git-style repository
pub struct Repo {
    path: PathBuf,
    config: Config,
}

impl Repo {
    /// initialize a repository at the given path
    ///
    /// an existing repository is opened and returned as is, provided it uses
    /// the requested object format.
    pub fn init(path: &Path, object_format: HashAlgorithm) -> Result<Self> {
        let config_path = path.join("config.toml");
        if config_path.exists() {
            let repo = Self::open(path)?;
            if repo.object_format() != object_format {
                return Err(Error::FormatMismatch {
                    path: path.to_path_buf(),
                    found: repo.object_format().to_string(),
                    requested: object_format.to_string(),
                });
            }
            return Ok(repo);
        }

        // create directory structure
        std::fs::create_dir_all(path.join("objects")).with_path(path)?;
        std::fs::create_dir_all(path.join("refs/heads")).with_path(path)?;
        std::fs::create_dir_all(path.join("refs/tags")).with_path(path)?;
        std::fs::create_dir_all(path.join("refs/remotes")).with_path(path)?;
        std::fs::create_dir_all(path.join("tmp")).with_path(path)?;

        let head = path.join("HEAD");
        if !head.exists() {
            std::fs::write(&head, "ref: refs/heads/main\n").with_path(&head)?;
        }

        // config last: its presence marks the repository as complete
        let config = Config::new(object_format);
        config.save(&config_path)?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    /// open an existing repository
    pub fn open(path: &Path) -> Result<Self> {
        let config_path = path.join("config.toml");
        if !config_path.exists() {
            return Err(Error::NoRepo(path.to_path_buf()));
        }

        let config = Config::load(&config_path)?;

        Ok(Self {
            path: path.to_path_buf(),
            config,
        })
    }

    /// repository root path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// repository configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// mutable access to configuration
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// save configuration changes
    pub fn save_config(&self) -> Result<()> {
        self.config.save(&self.config_path())
    }

    pub fn object_format(&self) -> HashAlgorithm {
        self.config.core.object_format
    }

    /// path to config.toml
    pub fn config_path(&self) -> PathBuf {
        self.path.join("config.toml")
    }

    /// path to objects directory
    pub fn objects_path(&self) -> PathBuf {
        self.path.join("objects")
    }

    /// path to refs directory
    pub fn refs_path(&self) -> PathBuf {
        self.path.join("refs")
    }

    /// path to tmp directory (for atomic writes)
    pub fn tmp_path(&self) -> PathBuf {
        self.path.join("tmp")
    }

    /// path to lock file
    pub fn lock_path(&self) -> PathBuf {
        self.path.join(".lock")
    }

    /// acquire exclusive lock on repository
    /// returns a guard that releases the lock on drop
    pub fn lock(&self) -> Result<RepoLock> {
        self.flock(FlockArg::LockExclusiveNonblock)
    }

    /// acquire a shared lock; any number of holders may coexist, but none
    /// while an exclusive lock is held
    pub fn lock_shared(&self) -> Result<RepoLock> {
        self.flock(FlockArg::LockSharedNonblock)
    }

    fn flock(&self, arg: FlockArg) -> Result<RepoLock> {
        let lock_path = self.lock_path();
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .with_path(&lock_path)?;

        let flock = Flock::lock(file, arg).map_err(|(_, errno)| match errno {
            nix::errno::Errno::EWOULDBLOCK => Error::RepoBusy(self.path.clone()),
            other => Error::Io {
                path: lock_path.clone(),
                source: std::io::Error::from(other),
            },
        })?;

        Ok(RepoLock { _flock: flock })
    }
}

/// guard that holds repository lock until dropped
pub struct RepoLock {
    _flock: Flock<File>,
}
