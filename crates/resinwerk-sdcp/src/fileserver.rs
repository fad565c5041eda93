// SPDX-License-Identifier: MIT
//
// Disposable single-route HTTP file origin.
//
// The printer pulls the uploaded file with one HTTP GET of a URL it was
// told about in the UPLOAD_FILE command.  Correctness needs only a
// byte-exact Content-Length and a stable digest, so this serves exactly
// the registered (path → file) mapping and nothing else: no keep-alive,
// no chunked framing, no content negotiation.  The route table is written
// by the session layer and read by the serve loop; a route is always
// registered strictly before its URL is disclosed to the printer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use md5::{Digest, Md5};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use resinwerk_core::{Error, Result};

/// Chunk size for both digest computation and response streaming.
const CHUNK_SIZE: usize = 64 * 1024;

/// Cap on the request head; the printer sends a one-line GET.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// One registered path → file mapping.
#[derive(Debug, Clone)]
pub struct FileRoute {
    pub file: PathBuf,
    pub size: u64,
    /// Lowercase hex MD5 of the full file content.
    pub md5: String,
}

/// Serves exactly the files explicitly registered, on an ephemeral port.
pub struct FileServer {
    port: u16,
    routes: Arc<Mutex<HashMap<String, FileRoute>>>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
}

impl FileServer {
    pub fn new() -> Self {
        Self {
            port: 0,
            routes: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(Notify::new()),
            task: None,
        }
    }

    /// Bind an ephemeral port and start accepting connections.
    pub async fn start(&mut self) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", 0))
            .await
            .map_err(|e| Error::FileServer(format!("bind: {e}")))?;
        self.port = listener
            .local_addr()
            .map_err(|e| Error::FileServer(format!("local_addr: {e}")))?
            .port();

        info!(port = self.port, "HTTP file server listening");

        let shutdown = Arc::clone(&self.shutdown);
        let routes = Arc::clone(&self.routes);
        self.task = Some(tokio::spawn(async move {
            Self::accept_loop(listener, shutdown, routes).await;
        }));
        Ok(())
    }

    /// The resolved ephemeral port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Signal the accept loop to exit and await it.
    pub async fn stop(&mut self) -> Result<()> {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::FileServer(format!("task join: {e}")))?;
        }
        Ok(())
    }

    /// Register a file under `path`, eagerly computing its size and a
    /// streamed full-content MD5 digest.  Must complete before the path
    /// is ever disclosed to the printer.
    pub async fn register_file_route(&self, path: &str, file: &Path) -> Result<FileRoute> {
        let mut f = tokio::fs::File::open(file).await?;
        let size = f.metadata().await?.len();

        let mut hasher = Md5::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = f.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let route = FileRoute {
            file: file.to_owned(),
            size,
            md5: hex::encode(hasher.finalize()),
        };

        debug!(path, size = route.size, md5 = %route.md5, "file route registered");
        self.routes
            .lock()
            .expect("route table poisoned")
            .insert(path.to_owned(), route.clone());
        Ok(route)
    }

    /// Remove a mapping; subsequent requests to that path 404.
    pub fn unregister_file_route(&self, path: &str) {
        if self
            .routes
            .lock()
            .expect("route table poisoned")
            .remove(path)
            .is_some()
        {
            debug!(path, "file route unregistered");
        }
    }

    async fn accept_loop(
        listener: TcpListener,
        shutdown: Arc<Notify>,
        routes: Arc<Mutex<HashMap<String, FileRoute>>>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.notified() => {
                    debug!("file server accept loop shutting down");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "HTTP connection");
                        let routes = Arc::clone(&routes);
                        tokio::spawn(async move {
                            // Any per-connection failure ends only this
                            // connection.
                            if let Err(e) = handle_connection(stream, routes).await {
                                warn!(peer = %peer, error = %e, "HTTP connection error");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

impl Default for FileServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read one request head, answer it, close the connection.
async fn handle_connection(
    mut stream: TcpStream,
    routes: Arc<Mutex<HashMap<String, FileRoute>>>,
) -> Result<()> {
    let mut head = Vec::with_capacity(512);
    let mut buf = [0u8; 1024];
    // Read until the header terminator; the body (if any) is ignored.
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        if head.len() > MAX_REQUEST_HEAD {
            return Err(Error::FileServer("request head too large".into()));
        }
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::FileServer("connection closed mid-request".into()));
        }
        head.extend_from_slice(&buf[..n]);
    }

    // Only method and path matter.
    let request_line = String::from_utf8_lossy(&head);
    let request_line = request_line.lines().next().unwrap_or_default();
    let mut parts = request_line.split_whitespace();
    let (method, path) = match (parts.next(), parts.next()) {
        (Some(m), Some(p)) => (m.to_owned(), p.to_owned()),
        _ => return Err(Error::FileServer(format!("bad request line: {request_line:?}"))),
    };

    let route = routes
        .lock()
        .expect("route table poisoned")
        .get(&path)
        .cloned();
    let Some(route) = route else {
        debug!(%method, %path, "no such route; 404");
        stream.write_all(b"HTTP/1.1 404 Not Found\r\n\r\n").await?;
        stream.shutdown().await?;
        return Ok(());
    };

    debug!(%method, %path, size = route.size, "serving file route");

    let header = format!(
        "HTTP/1.1 200 OK\r\n\
         Content-Type: application/octet-stream\r\n\
         Etag: {}\r\n\
         Content-Length: {}\r\n\
         \r\n",
        route.md5, route.size
    );
    stream.write_all(header.as_bytes()).await?;

    if method == "GET" {
        let mut file = tokio::fs::File::open(&route.file).await?;
        let mut chunk = vec![0u8; CHUNK_SIZE];
        let mut total: u64 = 0;
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&chunk[..n]).await?;
            total += n as u64;
        }
        debug!(%path, total, "file body written");
    }

    stream.flush().await?;
    stream.shutdown().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
