//! local transport: an in-process upload-pack server on its own thread

use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use crate::error::{Error, IoResultExt, Result};
use crate::identity::public_blob;
use crate::repo::Repo;
use crate::transport::pktline::{expect_pkt, write_text};
use crate::transport::serve::{self, challenge_message, ServeOptions};
use crate::transport::{AuthMode, Connection, Peer};

/// chunks buffered in each direction before the writer blocks
const PIPE_DEPTH: usize = 64;

/// write half of an in-memory pipe
struct PipeWriter {
    tx: SyncSender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer hung up"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// read half of an in-memory pipe; end of stream once the writer is gone
struct PipeReader {
    rx: Receiver<Vec<u8>>,
    buf: Vec<u8>,
    pos: usize,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.buf.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.buf = chunk;
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = (self.buf.len() - self.pos).min(out.len());
        out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn pipe() -> (PipeWriter, PipeReader) {
    let (tx, rx) = mpsc::sync_channel(PIPE_DEPTH);
    (
        PipeWriter { tx },
        PipeReader {
            rx,
            buf: Vec::new(),
            pos: 0,
        },
    )
}

/// the server thread behind a local connection
pub(crate) struct LocalPeer {
    handle: Option<JoinHandle<Result<()>>>,
}

impl LocalPeer {
    fn join(&mut self) -> Option<Result<()>> {
        let handle = self.handle.take()?;
        Some(
            handle
                .join()
                .unwrap_or_else(|_| Err(Error::Network("upload-pack thread panicked".to_string()))),
        )
    }

    pub(crate) fn wait(&mut self) {
        if let Some(Err(e)) = self.join() {
            debug!(error = %e, "local upload-pack ended with error");
        }
    }

    pub(crate) fn explain(&mut self, err: Error) -> Error {
        match self.join() {
            Some(Err(server)) if !matches!(server, Error::Network(_)) => server,
            _ => err,
        }
    }
}

/// open a session to the repository at `path`
pub fn connect(path: &Path, auth: &AuthMode) -> Result<Connection> {
    let path = if path.is_relative() {
        std::env::current_dir().with_path(path)?.join(path)
    } else {
        path.to_path_buf()
    };
    let repo = Repo::open(&path).map_err(|e| match e {
        Error::NoRepo(p) => Error::RemoteRepoNotFound(format!(
            "'{}' does not appear to be a git repository",
            p.display()
        )),
        other => other,
    })?;
    let options = ServeOptions::for_local(&repo)?;

    let (client_writer, mut server_reader) = pipe();
    let (mut server_writer, client_reader) = pipe();
    let handle = thread::Builder::new()
        .name("higit-upload-pack".to_string())
        .spawn(move || serve::upload_pack(&repo, &mut server_reader, &mut server_writer, &options))
        .map_err(|e| Error::Network(format!("cannot start local server: {}", e)))?;
    debug!(path = %path.display(), "started local upload-pack");

    let mut conn = Connection::new(
        Box::new(client_reader),
        Box::new(client_writer),
        Peer::Local(LocalPeer {
            handle: Some(handle),
        }),
    );
    if let Err(e) = answer_handshake(&mut conn, auth) {
        return Err(conn.explain(e));
    }
    Ok(conn)
}

/// reply to the server's authentication preamble
fn answer_handshake(conn: &mut Connection, auth: &AuthMode) -> Result<()> {
    let pkt = expect_pkt(conn.reader())?;
    let line = pkt
        .as_text()
        .ok_or_else(|| Error::Protocol("expected handshake line".to_string()))?;
    if line == "auth-none" {
        return Ok(());
    }
    let nonce_hex = line
        .strip_prefix("auth-challenge ")
        .ok_or_else(|| Error::Protocol(format!("unexpected handshake {:?}", line)))?;
    let nonce = hex::decode(nonce_hex)
        .map_err(|_| Error::Protocol("malformed challenge nonce".to_string()))?;

    let signed = match auth {
        AuthMode::Key(identity) => match identity.sign(&challenge_message(&nonce)) {
            Ok(signed) => Some(signed),
            Err(Error::KeyNotFound(_)) => None,
            Err(e) => return Err(e),
        },
        AuthMode::Anonymous => None,
    };
    let response = match signed {
        Some((public, signature)) => format!(
            "auth-response {} {}",
            STANDARD.encode(public_blob(&public)?),
            STANDARD.encode(signature.to_bytes())
        ),
        None => "auth-response none".to_string(),
    };
    write_text(conn.writer(), &response)?;
    conn.writer()
        .flush()
        .map_err(crate::transport::pktline::wire_error)
}
