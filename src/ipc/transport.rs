//! Platform-selected local transport.
//!
//! Unix domain sockets on POSIX, named pipes on Windows, behind one
//! constructor pair: [`bind`] for servers and [`connect`] for clients. The
//! address is an opaque string; no other module branches on the OS.

use std::io;

use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream usable by [`super::connection::Connection`].
pub trait IpcStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> IpcStream for T {}

/// Boxed transport stream, erasing the platform-specific type.
pub type BoxedStream = Box<dyn IpcStream>;

#[cfg(unix)]
pub use unix::{bind, connect, Listener};

#[cfg(windows)]
pub use windows::{bind, connect, Listener};

#[cfg(unix)]
mod unix {
    use std::io;
    use std::path::{Path, PathBuf};

    use tokio::net::{UnixListener, UnixStream};

    use super::BoxedStream;

    /// sun_path is 104 bytes on macOS and 108 on Linux; use the conservative
    /// limit so paths work everywhere.
    const MAX_SOCKET_PATH: usize = 104;

    /// A bound Unix domain socket listener.
    #[derive(Debug)]
    pub struct Listener {
        inner: UnixListener,
        path: PathBuf,
    }

    /// Bind a Unix domain socket at `address`, creating the parent directory
    /// and restricting the socket to owner-only access.
    pub fn bind(address: &str) -> io::Result<Listener> {
        let path = Path::new(address);
        if address.len() >= MAX_SOCKET_PATH {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "socket path too long ({} bytes, max {}): {address}",
                    address.len(),
                    MAX_SOCKET_PATH - 1
                ),
            ));
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let listener = UnixListener::bind(path)?;

        // Owner-only, same as the helper's runtime directory.
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        Ok(Listener {
            inner: listener,
            path: path.to_path_buf(),
        })
    }

    impl Listener {
        /// Accept one connection.
        pub async fn accept(&self) -> io::Result<BoxedStream> {
            let (stream, _addr) = self.inner.accept().await?;
            Ok(Box::new(stream))
        }

        /// The filesystem path this listener is bound to.
        pub fn path(&self) -> &Path {
            &self.path
        }
    }

    /// Dial the Unix domain socket at `address`.
    pub async fn connect(address: &str) -> io::Result<BoxedStream> {
        let stream = UnixStream::connect(address).await?;
        Ok(Box::new(stream))
    }
}

#[cfg(windows)]
mod windows {
    use std::io;
    use std::sync::Mutex;

    use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

    use super::BoxedStream;

    /// A named-pipe "listener".
    ///
    /// Named pipes have no accept queue; each connection needs its own
    /// server instance. The listener holds the next unconnected instance
    /// and creates a replacement after every accept.
    #[derive(Debug)]
    pub struct Listener {
        address: String,
        next: Mutex<Option<NamedPipeServer>>,
    }

    /// Create the first pipe instance at `address`.
    ///
    /// Fails if another process already owns the pipe name.
    pub fn bind(address: &str) -> io::Result<Listener> {
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(address)?;
        Ok(Listener {
            address: address.to_string(),
            next: Mutex::new(Some(first)),
        })
    }

    impl Listener {
        /// Wait for one client to connect.
        pub async fn accept(&self) -> io::Result<BoxedStream> {
            let server = self
                .next
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take()
                .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "listener exhausted"))?;
            server.connect().await?;
            let replacement = ServerOptions::new().create(&self.address)?;
            *self
                .next
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(replacement);
            Ok(Box::new(server))
        }
    }

    /// Open the client end of the named pipe at `address`.
    pub async fn connect(address: &str) -> io::Result<BoxedStream> {
        let client = ClientOptions::new().open(address)?;
        Ok(Box::new(client))
    }
}

/// Whether `address` currently exists as a filesystem/OS resource.
pub fn address_exists(address: &str) -> bool {
    std::path::Path::new(address).exists()
}

/// Remove the filesystem artifact behind `address`, if any.
///
/// On Windows, named pipes vanish with their owning process, so there is
/// nothing to remove.
pub fn remove_address(address: &str) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::fs::remove_file(address)
    }
    #[cfg(windows)]
    {
        let _ = address;
        Ok(())
    }
}
