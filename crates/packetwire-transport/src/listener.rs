#[cfg(unix)]
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::PathBuf;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tracing::{debug, info};

use crate::endpoint::{Endpoint, ListenOpts};
use crate::error::{Result, TransportError};
use crate::stream::SocketStream;

/// A bound listening socket over TCP or a filesystem-path Unix domain socket.
///
/// IPC socket files created by `bind` are removed again on `Drop`, provided
/// the path still refers to the socket this listener created.
pub struct SocketListener {
    inner: ListenerInner,
    endpoint: Endpoint,
    created_inode: Option<(u64, u64)>,
}

enum ListenerInner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
}

impl SocketListener {
    /// Maximum socket path length.
    /// Unix `sockaddr_un.sun_path` is typically 108 bytes on Linux, 104 on macOS.
    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind and listen on `opts.endpoint`.
    ///
    /// For IPC endpoints, an existing socket file at the path is removed first
    /// (stale socket cleanup); any other kind of file is left alone and the
    /// bind fails.
    pub async fn bind(opts: &ListenOpts) -> Result<Self> {
        match &opts.endpoint {
            Endpoint::Tcp(addr) => {
                let listener =
                    TcpListener::bind(addr.as_str())
                        .await
                        .map_err(|source| TransportError::Bind {
                            endpoint: opts.endpoint.clone(),
                            source,
                        })?;
                // Report the resolved address so port 0 binds are usable.
                let endpoint = match listener.local_addr() {
                    Ok(local) => Endpoint::Tcp(local.to_string()),
                    Err(_) => opts.endpoint.clone(),
                };
                info!(%endpoint, "listening on tcp socket");
                Ok(Self {
                    inner: ListenerInner::Tcp(listener),
                    endpoint,
                    created_inode: None,
                })
            }
            #[cfg(unix)]
            Endpoint::Ipc(path) => Self::bind_ipc(path.clone(), opts.socket_mode),
            #[cfg(not(unix))]
            Endpoint::Ipc(_) => Err(TransportError::Bind {
                endpoint: opts.endpoint.clone(),
                source: std::io::Error::new(
                    std::io::ErrorKind::Unsupported,
                    "ipc endpoints require Unix domain sockets",
                ),
            }),
        }
    }

    #[cfg(unix)]
    fn bind_ipc(path: PathBuf, mode: u32) -> Result<Self> {
        let endpoint = Endpoint::Ipc(path.clone());
        let bind_err = |source| TransportError::Bind {
            endpoint: endpoint.clone(),
            source,
        };

        let path_bytes = path.as_os_str().len();
        if path_bytes >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: Self::MAX_PATH_LEN,
            });
        }

        // Remove stale socket if it exists, but never remove non-socket files.
        if path.exists() {
            let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;
            if metadata.file_type().is_socket() {
                debug!(?path, "removing stale socket");
                std::fs::remove_file(&path).map_err(bind_err)?;
            } else {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).map_err(bind_err)?;
        let created = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        info!(?path, "listening on unix domain socket");

        Ok(Self {
            inner: ListenerInner::Unix(listener),
            endpoint,
            created_inode: Some((created.dev(), created.ino())),
        })
    }

    /// Accept the next incoming connection.
    pub async fn accept(&self) -> Result<SocketStream> {
        let stream = match &self.inner {
            ListenerInner::Tcp(listener) => {
                let (stream, _addr) = listener.accept().await.map_err(TransportError::Accept)?;
                // Nagle off for the small header frames this crate writes.
                let _ = stream.set_nodelay(true);
                SocketStream::from_tcp(stream)
            }
            #[cfg(unix)]
            ListenerInner::Unix(listener) => {
                let (stream, _addr) = listener.accept().await.map_err(TransportError::Accept)?;
                SocketStream::from_unix(stream)
            }
        };
        debug!(endpoint = %self.endpoint, "accepted connection");
        Ok(stream)
    }

    /// The endpoint this listener is bound to (with the resolved TCP port).
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        #[cfg(unix)]
        if let (Endpoint::Ipc(path), Some((expected_dev, expected_ino))) =
            (&self.endpoint, self.created_inode)
        {
            if let Ok(metadata) = std::fs::symlink_metadata(path) {
                if metadata.file_type().is_socket()
                    && metadata.dev() == expected_dev
                    && metadata.ino() == expected_ino
                {
                    debug!(?path, "cleaning up socket file");
                    let _ = std::fs::remove_file(path);
                } else {
                    debug!(?path, "socket path identity changed; skipping cleanup");
                }
            }
        }
    }
}

impl std::fmt::Debug for SocketListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketListener")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
