use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::Serialize;

use crate::error::{Error, Result};

/// hosting service a repository comes from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    GitHub,
    GitLab,
    Gitee,
    GitCode,
    /// any other ssh-reachable host
    SelfHosted,
    /// a repository on the local filesystem
    Local,
}

impl Provider {
    pub const ALL: [Provider; 6] = [
        Provider::GitHub,
        Provider::GitLab,
        Provider::Gitee,
        Provider::GitCode,
        Provider::SelfHosted,
        Provider::Local,
    ];

    /// directory name under `repos/`
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::GitLab => "gitlab",
            Provider::Gitee => "gitee",
            Provider::GitCode => "gitcode",
            Provider::SelfHosted => "selfhosted",
            Provider::Local => "local",
        }
    }

    /// public host of a hosted provider
    pub fn host(&self) -> Option<&'static str> {
        match self {
            Provider::GitHub => Some("github.com"),
            Provider::GitLab => Some("gitlab.com"),
            Provider::Gitee => Some("gitee.com"),
            Provider::GitCode => Some("gitcode.com"),
            Provider::SelfHosted | Provider::Local => None,
        }
    }

    pub fn from_host(host: &str) -> Option<Self> {
        let host = host.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|p| p.host().is_some_and(|h| host == h || host.ends_with(&format!(".{}", h))))
    }

    /// provider implied by a url when the caller does not name one
    pub fn infer(url: &RemoteUrl) -> Self {
        match url {
            RemoteUrl::Local { .. } => Provider::Local,
            RemoteUrl::Ssh { host, .. } => Self::from_host(host).unwrap_or(Provider::SelfHosted),
        }
    }
}

impl FromStr for Provider {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "github" => Ok(Provider::GitHub),
            "gitlab" => Ok(Provider::GitLab),
            "gitee" => Ok(Provider::Gitee),
            "gitcode" => Ok(Provider::GitCode),
            "selfhosted" | "self-hosted" | "custom" => Ok(Provider::SelfHosted),
            "local" => Ok(Provider::Local),
            other => Err(Error::Unsupported(format!("provider {:?}", other))),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// a parsed remote location
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteUrl {
    Ssh {
        user: Option<String>,
        host: String,
        port: Option<u16>,
        /// path as passed to the remote upload-pack
        path: String,
    },
    Local {
        path: PathBuf,
    },
}

impl RemoteUrl {
    /// parse a url, applying provider rewrites for https urls
    pub fn parse(url: &str, provider: Option<Provider>) -> Result<Self> {
        let url = url.trim();
        if url.is_empty() {
            return Err(Error::Unsupported("empty remote url".to_string()));
        }

        if let Some(path) = url.strip_prefix("file://") {
            return Ok(RemoteUrl::Local {
                path: PathBuf::from(path),
            });
        }

        if let Some(rest) = url.strip_prefix("ssh://") {
            return parse_ssh_url(rest, url);
        }

        if let Some(rest) = url.strip_prefix("https://") {
            return rewrite_https(rest, url, provider);
        }

        if let Some((scheme, _)) = url.split_once("://") {
            return Err(Error::Unsupported(format!(
                "{} transport ({})",
                scheme, url
            )));
        }

        if url.starts_with('/') || url.starts_with('.') || url.starts_with('~') {
            return Ok(RemoteUrl::Local {
                path: PathBuf::from(url),
            });
        }

        // scp-like `[user@]host:path` when ':' comes before any '/'
        if let Some(colon) = url.find(':') {
            let slash = url.find('/').unwrap_or(usize::MAX);
            if colon < slash {
                let (authority, path) = (&url[..colon], &url[colon + 1..]);
                let (user, host) = split_user(authority);
                if host.is_empty() || path.is_empty() {
                    return Err(Error::Unsupported(format!("malformed url {}", url)));
                }
                return Ok(RemoteUrl::Ssh {
                    user,
                    host: host.to_string(),
                    port: None,
                    path: path.to_string(),
                });
            }
        }

        Ok(RemoteUrl::Local {
            path: PathBuf::from(url),
        })
    }

    pub fn is_local(&self) -> bool {
        matches!(self, RemoteUrl::Local { .. })
    }
}

fn split_user(authority: &str) -> (Option<String>, &str) {
    match authority.rsplit_once('@') {
        Some((user, host)) => (Some(user.to_string()), host),
        None => (None, authority),
    }
}

fn parse_ssh_url(rest: &str, original: &str) -> Result<RemoteUrl> {
    let malformed = || Error::Unsupported(format!("malformed ssh url {}", original));
    let (authority, path) = match rest.find('/') {
        Some(i) => (&rest[..i], &rest[i..]),
        None => return Err(malformed()),
    };
    let (user, hostport) = split_user(authority);
    let (host, port) = match hostport.rsplit_once(':') {
        Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| malformed())?)),
        None => (hostport, None),
    };
    if host.is_empty() || path.len() <= 1 {
        return Err(malformed());
    }
    // `ssh://host/~user/repo` is relative to a home directory
    let path = path.strip_prefix("/~").map(|p| format!("~{}", p));
    Ok(RemoteUrl::Ssh {
        user,
        host: host.to_string(),
        port,
        path: path.unwrap_or_else(|| rest[authority.len()..].to_string()),
    })
}

/// hosted providers accept the same `owner/repo` path over ssh as `git@host`
fn rewrite_https(rest: &str, original: &str, provider: Option<Provider>) -> Result<RemoteUrl> {
    let (host, path) = rest
        .split_once('/')
        .ok_or_else(|| Error::Unsupported(format!("malformed url {}", original)))?;
    let host = host.rsplit_once('@').map(|(_, h)| h).unwrap_or(host);

    let provider = provider
        .filter(|p| p.host().is_some())
        .or_else(|| Provider::from_host(host));
    let known = provider.and_then(|p| p.host());
    let matches = known.is_some_and(|h| {
        let host = host.to_ascii_lowercase();
        host == h || host.ends_with(&format!(".{}", h))
    });
    if !matches {
        return Err(Error::Unsupported(format!(
            "https transport for {} (only hosted providers are rewritten to ssh)",
            host
        )));
    }

    let mut path = path.trim_end_matches('/').to_string();
    if !path.ends_with(".git") {
        path.push_str(".git");
    }
    Ok(RemoteUrl::Ssh {
        user: Some("git".to_string()),
        host: host.to_string(),
        port: None,
        path,
    })
}

impl fmt::Display for RemoteUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteUrl::Local { path } => write!(f, "{}", path.display()),
            RemoteUrl::Ssh {
                user,
                host,
                port: None,
                path,
            } if !path.starts_with('/') => match user {
                Some(user) => write!(f, "{}@{}:{}", user, host, path),
                None => write!(f, "{}:{}", host, path),
            },
            RemoteUrl::Ssh {
                user,
                host,
                port,
                path,
            } => {
                write!(f, "ssh://")?;
                if let Some(user) = user {
                    write!(f, "{}@", user)?;
                }
                write!(f, "{}", host)?;
                if let Some(port) = port {
                    write!(f, ":{}", port)?;
                }
                if !path.starts_with('/') {
                    write!(f, "/")?;
                }
                write!(f, "{}", path)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scp_like() {
        let url = RemoteUrl::parse("git@github.com:owner/repo.git", None).unwrap();
        assert_eq!(
            url,
            RemoteUrl::Ssh {
                user: Some("git".into()),
                host: "github.com".into(),
                port: None,
                path: "owner/repo.git".into(),
            }
        );
        assert_eq!(url.to_string(), "git@github.com:owner/repo.git");
        assert_eq!(Provider::infer(&url), Provider::GitHub);
    }

    #[test]
    fn test_ssh_url_with_port() {
        let url = RemoteUrl::parse("ssh://git@example.org:2222/srv/repo.git", None).unwrap();
        match &url {
            RemoteUrl::Ssh { host, port, path, .. } => {
                assert_eq!(host, "example.org");
                assert_eq!(*port, Some(2222));
                assert_eq!(path, "/srv/repo.git");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(url.to_string(), "ssh://git@example.org:2222/srv/repo.git");
        assert_eq!(Provider::infer(&url), Provider::SelfHosted);
    }

    #[test]
    fn test_https_rewrite_for_provider() {
        let url = RemoteUrl::parse("https://gitee.com/owner/repo", Some(Provider::Gitee)).unwrap();
        assert_eq!(url.to_string(), "git@gitee.com:owner/repo.git");

        // host inferred when the provider is not hosted
        let url = RemoteUrl::parse("https://github.com/o/r.git", None).unwrap();
        assert_eq!(url.to_string(), "git@github.com:o/r.git");
    }

    #[test]
    fn test_https_unknown_host_unsupported() {
        let result = RemoteUrl::parse("https://git.example.org/o/r.git", None);
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn test_other_schemes_unsupported() {
        for url in ["git://host/repo", "http://github.com/o/r", "ftp://x/y"] {
            assert!(matches!(
                RemoteUrl::parse(url, None),
                Err(Error::Unsupported(_))
            ));
        }
    }

    #[test]
    fn test_local_paths() {
        assert!(RemoteUrl::parse("/srv/repo", None).unwrap().is_local());
        assert!(RemoteUrl::parse("file:///srv/repo", None).unwrap().is_local());
        assert!(RemoteUrl::parse("./relative", None).unwrap().is_local());
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("GitHub".parse::<Provider>().unwrap(), Provider::GitHub);
        assert_eq!("gitcode".parse::<Provider>().unwrap(), Provider::GitCode);
        assert!(matches!(
            "sourceforge".parse::<Provider>(),
            Err(Error::Unsupported(_))
        ));
    }
}
