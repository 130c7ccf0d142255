//! transport layer for talking to upload-pack servers
//!
//! a [`Connection`] is a byte stream pair to a remote `git-upload-pack`,
//! either an `ssh` child process or an in-process server for local paths.

pub mod advertise;
pub mod fetch;
pub mod local;
pub mod pktline;
pub mod serve;
pub mod ssh;
pub mod url;

use std::io::{self, BufReader, Read, Write};

use crate::config::Settings;
use crate::error::{Error, Result};
use crate::identity::Identity;

pub use advertise::{list_remote_refs, Advertisement, RemoteRef};
pub use fetch::{fetch_pack, FetchOutcome, FetchRequest};
pub use url::{Provider, RemoteUrl};

/// user agent sent in capability lists
pub const AGENT: &str = concat!("higit/", env!("CARGO_PKG_VERSION"));

/// how the client proves who it is
#[derive(Clone, Debug)]
pub enum AuthMode {
    /// no key; only useful for servers that allow anonymous reads
    Anonymous,
    /// the engine's ssh identity
    Key(Identity),
}

/// everything needed to reach a remote
#[derive(Clone, Debug)]
pub struct RemoteDescriptor {
    pub url: RemoteUrl,
    pub provider: Provider,
    pub auth: AuthMode,
}

impl RemoteDescriptor {
    /// parse `url`, inferring the provider when none is given
    pub fn new(url: &str, provider: Option<Provider>, auth: AuthMode) -> Result<Self> {
        let parsed = RemoteUrl::parse(url, provider)?;
        let provider = provider.unwrap_or_else(|| Provider::infer(&parsed));
        Ok(Self {
            url: parsed,
            provider,
            auth,
        })
    }
}

impl std::fmt::Display for RemoteDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.url.fmt(f)
    }
}

/// the process or thread on the other end of a connection
pub(crate) enum Peer {
    Ssh(ssh::SshPeer),
    Local(local::LocalPeer),
}

/// an open upload-pack session
pub struct Connection {
    reader: BufReader<Box<dyn Read + Send>>,
    writer: Box<dyn Write + Send>,
    peer: Peer,
}

impl Connection {
    pub(crate) fn new(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        peer: Peer,
    ) -> Self {
        Self {
            reader: BufReader::with_capacity(64 * 1024, reader),
            writer,
            peer,
        }
    }

    /// open a session to the remote's upload-pack
    pub fn open(remote: &RemoteDescriptor, settings: &Settings) -> Result<Self> {
        match &remote.url {
            RemoteUrl::Ssh { .. } => ssh::connect(remote, settings),
            RemoteUrl::Local { path } => local::connect(path, &remote.auth),
        }
    }

    pub fn reader(&mut self) -> &mut BufReader<Box<dyn Read + Send>> {
        &mut self.reader
    }

    pub fn writer(&mut self) -> &mut (dyn Write + Send) {
        self.writer.as_mut()
    }

    /// replace a generic wire failure with what the peer reports
    ///
    /// the remote usually explains itself on stderr (ssh) or through its
    /// return value (local server) after the stream breaks.
    pub fn explain(&mut self, err: Error) -> Error {
        if !matches!(
            err,
            Error::Network(_) | Error::Protocol(_) | Error::Remote(_)
        ) {
            return err;
        }
        self.hang_up();
        match &mut self.peer {
            Peer::Ssh(peer) => peer.explain(err),
            Peer::Local(peer) => peer.explain(err),
        }
    }

    /// close both directions and reap the peer
    pub fn finish(mut self) {
        self.hang_up();
        match &mut self.peer {
            Peer::Ssh(peer) => peer.wait(),
            Peer::Local(peer) => peer.wait(),
        }
    }

    fn hang_up(&mut self) {
        let _ = self.writer.flush();
        self.writer = Box::new(io::sink());
        self.reader = BufReader::new(Box::new(io::empty()));
    }
}
