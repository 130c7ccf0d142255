//! ssh transport: runs `git-upload-pack` on the remote through the system
//! ssh client

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::transport::url::RemoteUrl;
use crate::transport::{AuthMode, Connection, Peer, RemoteDescriptor};

/// keep at most this much of the remote's stderr
const STDERR_LIMIT: u64 = 64 * 1024;
/// how long a closed child gets to exit before it is killed
const EXIT_GRACE: Duration = Duration::from_secs(2);

/// the ssh child process behind a connection
pub(crate) struct SshPeer {
    child: Child,
    stderr: Option<JoinHandle<String>>,
    reaped: bool,
}

/// open an upload-pack session over ssh
pub fn connect(remote: &RemoteDescriptor, settings: &Settings) -> Result<Connection> {
    let RemoteUrl::Ssh {
        user,
        host,
        port,
        path,
    } = &remote.url
    else {
        return Err(Error::Unsupported(format!("{} is not an ssh url", remote.url)));
    };

    let mut cmd = Command::new(&settings.ssh_program);
    match &remote.auth {
        AuthMode::Key(identity) => {
            if !identity.exists() {
                return Err(Error::Authentication(
                    "no ssh key has been generated".to_string(),
                ));
            }
            cmd.arg("-i")
                .arg(identity.private_key_path())
                .args(["-o", "IdentitiesOnly=yes"])
                .arg("-o")
                .arg(format!(
                    "UserKnownHostsFile={}",
                    identity.known_hosts_path().display()
                ));
        }
        AuthMode::Anonymous => {}
    }
    cmd.args(["-o", "BatchMode=yes"])
        .args(["-o", "StrictHostKeyChecking=accept-new"])
        .arg("-o")
        .arg(format!("ConnectTimeout={}", settings.connect_timeout_secs.max(1)));
    if let Some(port) = port {
        cmd.arg("-p").arg(port.to_string());
    }
    let destination = match user {
        Some(user) => format!("{}@{}", user, host),
        None => host.clone(),
    };
    cmd.arg(destination)
        .arg(format!("git-upload-pack {}", shell_quote(path)));

    debug!(program = %settings.ssh_program, remote = %remote.url, "spawning ssh");
    let mut child = cmd
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::Network(format!("cannot run {}: {}", settings.ssh_program, e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Network("ssh stdout not available".to_string()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Network("ssh stdin not available".to_string()))?;
    let stderr = child.stderr.take().map(|pipe| {
        thread::spawn(move || {
            let mut text = String::new();
            let _ = pipe.take(STDERR_LIMIT).read_to_string(&mut text);
            text
        })
    });

    Ok(Connection::new(
        Box::new(stdout),
        Box::new(stdin),
        Peer::Ssh(SshPeer {
            child,
            stderr,
            reaped: false,
        }),
    ))
}

/// single-quote for the remote shell
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

impl SshPeer {
    /// wait for the child to exit after its pipes were closed
    pub(crate) fn wait(&mut self) {
        if self.reaped {
            return;
        }
        let deadline = Instant::now() + EXIT_GRACE;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!(%status, "ssh exited");
                    break;
                }
                Ok(None) if Instant::now() < deadline => {
                    thread::sleep(Duration::from_millis(20));
                }
                _ => {
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        self.reaped = true;
    }

    fn stderr_text(&mut self) -> String {
        self.stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default()
    }

    pub(crate) fn explain(&mut self, err: Error) -> Error {
        self.wait();
        let stderr = self.stderr_text();
        debug!(stderr = %stderr.trim(), "ssh stderr");
        classify_stderr(&stderr).unwrap_or(err)
    }
}

impl Drop for SshPeer {
    fn drop(&mut self) {
        if !self.reaped {
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// map what ssh or the remote printed to an error
pub(crate) fn classify_stderr(stderr: &str) -> Option<Error> {
    let message = stderr
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with("Warning: Permanently added"))
        .collect::<Vec<_>>()
        .join("; ");
    if message.is_empty() {
        return None;
    }

    let lower = message.to_ascii_lowercase();
    let auth = ["permission denied", "publickey", "host key verification failed"];
    let missing = [
        "repository not found",
        "does not appear to be a git repository",
        "project you were looking for could not be found",
    ];
    if auth.iter().any(|p| lower.contains(p)) {
        Some(Error::Authentication(message))
    } else if missing.iter().any(|p| lower.contains(p)) {
        Some(Error::RemoteRepoNotFound(message))
    } else {
        Some(Error::Network(message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::transport::Provider;

    #[test]
    fn test_classify_auth() {
        let err = classify_stderr("git@github.com: Permission denied (publickey).\n").unwrap();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);

        let err = classify_stderr("Host key verification failed.\n").unwrap();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailure);
    }

    #[test]
    fn test_classify_missing_repo() {
        let err = classify_stderr("ERROR: Repository not found.\nfatal: Could not read").unwrap();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_classify_network() {
        let err = classify_stderr("ssh: connect to host example.org port 22: Connection refused")
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::NetworkFailure);
        assert!(err.to_string().contains("refused"));
        assert!(classify_stderr("\n").is_none());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("o/r.git"), "'o/r.git'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_missing_program_is_network_failure() {
        let remote = RemoteDescriptor::new(
            "git@example.invalid:o/r.git",
            Some(Provider::SelfHosted),
            AuthMode::Anonymous,
        )
        .unwrap();
        let settings = Settings {
            ssh_program: "/nonexistent/ssh-binary".to_string(),
            ..Settings::default()
        };
        let err = connect(&remote, &settings).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::NetworkFailure);
    }
}
