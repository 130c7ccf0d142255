//! the boundary an application shell talks to
//!
//! every operation returns a [`Response`]: a status string, a readable
//! message, and a JSON payload. errors never escape as panics or `Err`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Mutex, MutexGuard};
use std::thread::JoinHandle;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::hash::ObjectId;
use crate::identity::{Identity, PublicKeyInfo};
use crate::lifecycle::{self, InitRequest};
use crate::object::is_binary;
use crate::ops;
use crate::progress::{CancellationToken, ProgressEvent, ProgressSink};
use crate::repo::Repo;
use crate::transport::{list_remote_refs, AuthMode, Provider, RemoteDescriptor};

/// outcome of one engine operation
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Response {
    /// `ok` or an error kind such as `not_found`
    pub status: String,
    pub message: String,
    /// JSON text; `null` on failure
    pub data: String,
}

impl Response {
    fn ok<T: Serialize>(message: impl Into<String>, data: &T) -> Self {
        match serde_json::to_string(data) {
            Ok(data) => Self {
                status: "ok".to_string(),
                message: message.into(),
                data,
            },
            Err(e) => Self::error(&Error::from(e)),
        }
    }

    fn error(err: &Error) -> Self {
        Self {
            status: err.kind().as_str().to_string(),
            message: err.to_string(),
            data: "null".to_string(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "ok"
    }
}

fn respond<T: Serialize>(op: &str, result: Result<T>, message: impl FnOnce(&T) -> String) -> Response {
    match result {
        Ok(value) => {
            debug!(op, "operation succeeded");
            Response::ok(message(&value), &value)
        }
        Err(e) => {
            warn!(op, kind = %e.kind(), error = %e, "operation failed");
            Response::error(&e)
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SystemPayload {
    base: PathBuf,
    public_key: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BranchPayload {
    name: String,
    id: ObjectId,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TagPayload {
    name: String,
    id: ObjectId,
    peeled_id: ObjectId,
    annotated: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FilePayload {
    path: String,
    size: usize,
    binary: bool,
    encoding: &'static str,
    content: String,
}

impl FilePayload {
    fn new(path: &str, bytes: Vec<u8>) -> Self {
        let size = bytes.len();
        match String::from_utf8(bytes) {
            Ok(text) if !is_binary(text.as_bytes()) => Self {
                path: path.to_string(),
                size,
                binary: false,
                encoding: "utf8",
                content: text,
            },
            Ok(text) => Self::base64(path, text.as_bytes()),
            Err(e) => Self::base64(path, e.as_bytes()),
        }
    }

    fn base64(path: &str, bytes: &[u8]) -> Self {
        Self {
            path: path.to_string(),
            size: bytes.len(),
            binary: true,
            encoding: "base64",
            content: STANDARD.encode(bytes),
        }
    }
}

struct State {
    base: PathBuf,
    settings: Settings,
    /// remote url -> repository path
    registry: HashMap<String, PathBuf>,
}

/// a running background fetch
pub struct FetchHandle {
    events: Receiver<ProgressEvent>,
    cancel: CancellationToken,
    worker: JoinHandle<Response>,
}

impl FetchHandle {
    /// progress events; the channel closes when the fetch ends
    pub fn events(&self) -> &Receiver<ProgressEvent> {
        &self.events
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// wait for the terminal result
    pub fn wait(self) -> Response {
        match self.worker.join() {
            Ok(response) => response,
            Err(_) => Response::error(&Error::Remote("fetch worker panicked".to_string())),
        }
    }
}

/// engine façade; safe to share between threads
#[derive(Default)]
pub struct Engine {
    state: Mutex<Option<State>>,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, Option<State>> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// base directory and settings, or `NotInitialized`
    fn context(&self) -> Result<(PathBuf, Settings)> {
        self.state()
            .as_ref()
            .map(|s| (s.base.clone(), s.settings.clone()))
            .ok_or(Error::NotInitialized)
    }

    /// the engine base, which `path` must name
    fn base_at(&self, path: &str) -> Result<(PathBuf, Settings)> {
        let (base, settings) = self.context()?;
        let requested = Path::new(path);
        let same = match (base.canonicalize(), requested.canonicalize()) {
            (Ok(a), Ok(b)) => a == b,
            _ => base == requested,
        };
        if !same {
            return Err(Error::NotEngineBase(requested.to_path_buf()));
        }
        Ok((base, settings))
    }

    fn auth(base: &Path) -> AuthMode {
        AuthMode::Key(Identity::new(base))
    }

    /// local repository mirroring `url`
    fn lookup(&self, url: &str) -> Result<PathBuf> {
        let base = {
            let guard = self.state();
            let state = guard.as_ref().ok_or(Error::NotInitialized)?;
            if let Some(path) = state.registry.get(url) {
                if path.join("config.toml").is_file() {
                    return Ok(path.clone());
                }
            }
            state.base.clone()
        };

        let path = lifecycle::find_by_url(&base, url)?
            .ok_or_else(|| Error::UnknownRepo(url.to_string()))?;
        self.register(url, &path);
        Ok(path)
    }

    fn register(&self, url: &str, path: &Path) {
        if let Some(state) = self.state().as_mut() {
            state.registry.insert(url.to_string(), path.to_path_buf());
        }
    }

    fn unregister(&self, url: &str) {
        if let Some(state) = self.state().as_mut() {
            state.registry.remove(url);
        }
    }

    fn remote(&self, url: &str) -> Result<(RemoteDescriptor, Settings)> {
        let (base, settings) = self.context()?;
        Ok((RemoteDescriptor::new(url, None, Self::auth(&base))?, settings))
    }

    /// prepare `path` as the engine's base directory
    pub fn init_system(&self, path: &str) -> Response {
        let result = (|| -> Result<_> {
            let base = PathBuf::from(path);
            let info = lifecycle::init_system(&base)?;
            let settings = Settings::load(&base)?;
            *self.state() = Some(State {
                base: base.clone(),
                settings,
                registry: HashMap::new(),
            });
            Ok(SystemPayload {
                base,
                public_key: info.public_key.public_key,
            })
        })();
        respond("init_system", result, |p| format!("initialized {}", p.base.display()))
    }

    /// clone `url` under `path` as `<provider>/<repo>`; `provider` may be empty
    pub fn init_repo(&self, path: &str, url: &str, repo: &str, provider: &str) -> Response {
        let result = (|| -> Result<_> {
            let (base, settings) = self.base_at(path)?;
            let provider = parse_provider(provider)?;
            let auth = Self::auth(&base);
            let request = InitRequest {
                url,
                name: repo,
                provider,
                auth: &auth,
                settings: &settings,
            };
            let report = lifecycle::init_repo(
                &base,
                &request,
                &mut ProgressSink::Silent,
                &CancellationToken::new(),
            )?;
            self.register(url, &report.path);
            Ok(report)
        })();
        respond("init_repo", result, |r| {
            if r.created {
                format!("cloned {} into {}", url, r.path.display())
            } else {
                format!("{} already present at {}", url, r.path.display())
            }
        })
    }

    pub fn delete_repo(&self, path: &str, url: &str, repo: &str, provider: &str) -> Response {
        let result = (|| -> Result<_> {
            let (base, _) = self.base_at(path)?;
            let provider = match parse_provider(provider)? {
                Some(provider) => provider,
                None => RemoteDescriptor::new(url, None, AuthMode::Anonymous)?.provider,
            };
            let report = lifecycle::delete_repo(&base, url, repo, provider)?;
            self.unregister(url);
            Ok(report)
        })();
        respond("delete_repo", result, |r| {
            if r.removed {
                format!("deleted {}", r.path.display())
            } else {
                format!("nothing to delete at {}", r.path.display())
            }
        })
    }

    /// branches advertised by the remote
    pub fn get_branches(&self, url: &str) -> Response {
        let result = self.remote(url).and_then(|(remote, settings)| {
            let adv = list_remote_refs(&remote, &settings)?;
            Ok(adv
                .branches()
                .map(|r| BranchPayload {
                    name: r.short_name().to_string(),
                    id: r.id,
                })
                .collect::<Vec<_>>())
        });
        respond("get_branches", result, |b| format!("{} branches", b.len()))
    }

    /// tags advertised by the remote, peeled to what they point at
    pub fn get_tags(&self, url: &str) -> Response {
        let result = self.remote(url).and_then(|(remote, settings)| {
            let adv = list_remote_refs(&remote, &settings)?;
            Ok(adv
                .tags()
                .map(|r| TagPayload {
                    name: r.short_name().to_string(),
                    id: r.id,
                    peeled_id: r.peeled.unwrap_or(r.id),
                    annotated: r.peeled.is_some(),
                })
                .collect::<Vec<_>>())
        });
        respond("get_tags", result, |t| format!("{} tags", t.len()))
    }

    /// fetch `branch` of the repository mirroring `url`
    ///
    /// `callback` receives `(processed, total, message)`, always before this
    /// returns.
    pub fn fetch(
        &self,
        url: &str,
        branch: &str,
        mut callback: impl FnMut(u64, u64, &str) + Send,
    ) -> Response {
        let mut sink = ProgressSink::callback(|e: &ProgressEvent| {
            callback(e.processed, e.total, &e.message)
        });
        let result = self.prepare_fetch(url).and_then(|(path, base, settings)| {
            run_fetch(&path, &base, branch, &settings, &mut sink, &CancellationToken::new())
        });
        respond("fetch", result, fetch_message)
    }

    /// fetch on a worker thread, streaming progress over a channel
    pub fn spawn_fetch(&self, url: &str, branch: &str) -> FetchHandle {
        let (tx, events) = mpsc::channel();
        let cancel = CancellationToken::new();
        let prepared = self.prepare_fetch(url);
        let branch = branch.to_string();
        let token = cancel.clone();

        let spawned = std::thread::Builder::new()
            .name("higit-fetch".to_string())
            .spawn(move || {
                let mut sink = ProgressSink::Channel(tx);
                let result = prepared.and_then(|(path, base, settings)| {
                    run_fetch(&path, &base, &branch, &settings, &mut sink, &token)
                });
                drop(sink);
                respond("fetch", result, fetch_message)
            });

        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                let response = Response::error(&Error::Io {
                    path: PathBuf::from(url),
                    source: e,
                });
                std::thread::spawn(move || response)
            }
        };
        FetchHandle {
            events,
            cancel,
            worker,
        }
    }

    fn prepare_fetch(&self, url: &str) -> Result<(PathBuf, PathBuf, Settings)> {
        let (base, settings) = self.context()?;
        let path = self.lookup(url)?;
        Ok((path, base, settings))
    }

    /// up to `count` commits of `branch`, newest first, after skipping `offset`
    pub fn history(&self, url: &str, branch: &str, count: usize, offset: usize) -> Response {
        let result = self
            .open(url)
            .and_then(|repo| ops::history(&repo, branch, count, offset));
        respond("history", result, |c| format!("{} commits", c.len()))
    }

    pub fn get_ssh_key(&self) -> Response {
        let result = self
            .context()
            .and_then(|(base, _)| Identity::new(&base).public_key());
        respond("get_ssh_key", result, key_message)
    }

    /// replace the key pair; remotes must be told the new public key
    pub fn generate_ssh_key(&self) -> Response {
        let result = self
            .context()
            .and_then(|(base, _)| Identity::new(&base).generate());
        respond("generate_ssh_key", result, key_message)
    }

    pub fn get_file_tree(&self, url: &str, branch: &str) -> Response {
        let result = self
            .open(url)
            .and_then(|repo| ops::file_tree(&repo, branch));
        respond("get_file_tree", result, |n| format!("{} entries", n.len()))
    }

    /// one directory level of `branch`; an empty `path` lists the top
    pub fn list_dir(&self, url: &str, branch: &str, path: &str) -> Response {
        let result = self
            .open(url)
            .and_then(|repo| ops::list_dir(&repo, branch, path));
        respond("list_dir", result, |n| format!("{} entries", n.len()))
    }

    pub fn read_file(&self, url: &str, branch: &str, path: &str) -> Response {
        let result = self
            .open(url)
            .and_then(|repo| ops::read_file(&repo, branch, path))
            .map(|bytes| FilePayload::new(path, bytes));
        respond("read_file", result, |f| format!("{} bytes", f.size))
    }

    fn open(&self, url: &str) -> Result<Repo> {
        Repo::open(&self.lookup(url)?)
    }
}

fn parse_provider(provider: &str) -> Result<Option<Provider>> {
    if provider.trim().is_empty() {
        Ok(None)
    } else {
        provider.parse().map(Some)
    }
}

fn run_fetch(
    path: &Path,
    base: &Path,
    branch: &str,
    settings: &Settings,
    sink: &mut ProgressSink<'_>,
    cancel: &CancellationToken,
) -> Result<lifecycle::FetchReport> {
    let repo = Repo::open(path)?;
    let remote = lifecycle::remote_of(&repo, Engine::auth(base))?;
    lifecycle::fetch(&repo, &remote, branch, settings, sink, cancel)
}

fn fetch_message(report: &lifecycle::FetchReport) -> String {
    if report.up_to_date {
        format!("{} already up to date", report.branch)
    } else {
        format!("{} updated to {}", report.branch, report.tip.short())
    }
}

fn key_message(info: &PublicKeyInfo) -> String {
    format!("{} {}", info.key_type, info.fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{commit_on, remote_repo};
    use tempfile::tempdir;

    fn payload(response: &Response) -> serde_json::Value {
        assert!(response.is_ok(), "{:?}", response);
        serde_json::from_str(&response.data).unwrap()
    }

    #[test]
    fn test_calls_before_init_system() {
        let engine = Engine::new();
        let response = engine.get_ssh_key();
        assert_eq!(response.status, "invalid_state");
        assert_eq!(response.data, "null");
        assert_eq!(engine.history("x", "main", 1, 0).status, "invalid_state");
        assert_eq!(engine.get_branches("/tmp/x").status, "invalid_state");
    }

    #[test]
    fn test_ssh_key_lifecycle() {
        let dir = tempdir().unwrap();
        let engine = Engine::new();
        let init = payload(&engine.init_system(&dir.path().display().to_string()));
        let key = payload(&engine.get_ssh_key());
        assert_eq!(init["publicKey"], key["publicKey"]);
        assert_eq!(key["keyType"], "ssh-ed25519");

        let fresh = payload(&engine.generate_ssh_key());
        assert_ne!(fresh["fingerprint"], key["fingerprint"]);
        assert_eq!(payload(&engine.get_ssh_key()), fresh);
    }

    #[test]
    fn test_read_file_encodings() {
        let text = FilePayload::new("a.txt", b"hello".to_vec());
        assert_eq!(text.encoding, "utf8");
        assert!(!text.binary);

        let bin = FilePayload::new("a.bin", vec![0, 159, 146, 150]);
        assert_eq!(bin.encoding, "base64");
        assert!(bin.binary);
        assert_eq!(bin.size, 4);
        assert_eq!(STANDARD.decode(&bin.content).unwrap(), vec![0, 159, 146, 150]);
    }

    #[test]
    fn test_unknown_url() {
        let dir = tempdir().unwrap();
        let engine = Engine::new();
        engine.init_system(&dir.path().display().to_string());
        let response = engine.get_file_tree("git@github.com:o/r.git", "main");
        assert_eq!(response.status, "not_found");
    }

    #[test]
    fn test_lookup_falls_back_to_scan() {
        let dir = tempdir().unwrap();
        let upstream = remote_repo(dir.path(), "upstream");
        commit_on(&upstream, "main", &[("f", "x")], 1);
        let url = upstream.path().display().to_string();
        let base = dir.path().join("base").display().to_string();

        let first = Engine::new();
        first.init_system(&base);
        assert!(first.init_repo(&base, &url, "proj", "local").is_ok());

        let second = Engine::new();
        second.init_system(&base);
        let tree = payload(&second.get_file_tree(&url, "main"));
        assert_eq!(tree[0]["path"], "f");
    }

    #[test]
    fn test_repo_paths_must_be_the_engine_base() {
        let dir = tempdir().unwrap();
        let upstream = remote_repo(dir.path(), "upstream");
        commit_on(&upstream, "main", &[("f", "x")], 1);
        let url = upstream.path().display().to_string();
        let base = dir.path().join("base").display().to_string();
        let elsewhere = dir.path().join("elsewhere");
        std::fs::create_dir(&elsewhere).unwrap();
        let elsewhere = elsewhere.display().to_string();

        let engine = Engine::new();
        engine.init_system(&base);
        let response = engine.init_repo(&elsewhere, &url, "proj", "local");
        assert_eq!(response.status, "invalid_state");
        assert!(!dir.path().join("elsewhere/repos").exists());
        assert_eq!(engine.delete_repo(&elsewhere, &url, "proj", "local").status, "invalid_state");

        // a relative spelling of the same directory is accepted
        let dotted = format!("{}/.", base);
        assert!(engine.init_repo(&dotted, &url, "proj", "local").is_ok());
        let again = Engine::new();
        again.init_system(&base);
        assert!(again.get_file_tree(&url, "main").is_ok());
    }

    #[test]
    fn test_list_dir_one_level() {
        let dir = tempdir().unwrap();
        let upstream = remote_repo(dir.path(), "upstream");
        commit_on(&upstream, "main", &[("a.txt", "a"), ("src/lib.rs", "x"), ("src/m/n.rs", "y")], 1);
        let url = upstream.path().display().to_string();
        let base = dir.path().join("base").display().to_string();

        let engine = Engine::new();
        engine.init_system(&base);
        assert!(engine.init_repo(&base, &url, "proj", "local").is_ok());

        let top = payload(&engine.list_dir(&url, "main", ""));
        let names: Vec<&str> = top
            .as_array()
            .unwrap()
            .iter()
            .map(|n| n["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt", "src"]);
        let src = payload(&engine.list_dir(&url, "main", "src"));
        assert_eq!(src.as_array().unwrap().len(), 2);
        assert_eq!(engine.list_dir(&url, "main", "a.txt").status, "type_mismatch");
    }
}
