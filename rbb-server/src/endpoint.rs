//! Listening endpoints, given as `tcp:HOST:PORT` or `unix:PATH`.
use std::{
    error::Error,
    fmt::Display,
    io,
    pin::Pin,
    str::FromStr,
    task::{Context, Poll},
};

#[cfg(unix)]
use std::path::PathBuf;

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::{TcpListener, TcpStream},
};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Endpoint {
    /// `tcp:HOST:PORT`. IPv6 hosts are written in brackets.
    Tcp { host: String, port: u16 },
    /// `unix:PATH`
    #[cfg(unix)]
    Unix(PathBuf),
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EndpointError {
    /// Neither `tcp:` nor `unix:`
    UnknownScheme(String),
    MissingPort(String),
    InvalidPort(String),
    EmptyAddress,
}

impl Display for EndpointError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointError::UnknownScheme(spec) => write!(
                f,
                "Unknown endpoint '{}', expected tcp:HOST:PORT or unix:PATH",
                spec
            ),
            EndpointError::MissingPort(spec) => write!(f, "Endpoint '{}' has no port", spec),
            EndpointError::InvalidPort(port) => write!(f, "Invalid port '{}'", port),
            EndpointError::EmptyAddress => write!(f, "Endpoint address is empty"),
        }
    }
}

impl Error for EndpointError {}

impl FromStr for Endpoint {
    type Err = EndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(address) = s.strip_prefix("tcp:") {
            let (host, port) = address
                .rsplit_once(':')
                .ok_or_else(|| EndpointError::MissingPort(s.to_string()))?;
            if host.is_empty() {
                return Err(EndpointError::EmptyAddress);
            }
            let port = port
                .parse::<u16>()
                .map_err(|_| EndpointError::InvalidPort(port.to_string()))?;
            let host = host
                .strip_prefix('[')
                .and_then(|h| h.strip_suffix(']'))
                .unwrap_or(host);
            return Ok(Endpoint::Tcp {
                host: host.to_string(),
                port,
            });
        }
        if let Some(unix) = parse_unix(s) {
            return unix;
        }
        Err(EndpointError::UnknownScheme(s.to_string()))
    }
}

#[cfg(unix)]
fn parse_unix(s: &str) -> Option<Result<Endpoint, EndpointError>> {
    let path = s.strip_prefix("unix:")?;
    if path.is_empty() {
        return Some(Err(EndpointError::EmptyAddress));
    }
    Some(Ok(Endpoint::Unix(PathBuf::from(path))))
}

#[cfg(not(unix))]
fn parse_unix(_: &str) -> Option<Result<Endpoint, EndpointError>> {
    None
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Tcp { host, port } if host.contains(':') => {
                write!(f, "tcp:[{}]:{}", host, port)
            }
            Endpoint::Tcp { host, port } => write!(f, "tcp:{}:{}", host, port),
            #[cfg(unix)]
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// A bound endpoint accepting one connection at a time
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, PathBuf),
}

impl Listener {
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Listener> {
        match endpoint {
            Endpoint::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Listener::Tcp(listener))
            }
            #[cfg(unix)]
            Endpoint::Unix(path) => {
                remove_stale_socket(path)?;
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix(listener, path.clone()))
            }
        }
    }

    /// Waits for the next client. Returns the connection and a description of the peer.
    pub async fn accept(&self) -> io::Result<(Connection, String)> {
        match self {
            Listener::Tcp(listener) => {
                let (stream, addr) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok((Connection::Tcp(stream), addr.to_string()))
            }
            #[cfg(unix)]
            Listener::Unix(listener, path) => {
                let (stream, _) = listener.accept().await?;
                Ok((Connection::Unix(stream), path.display().to_string()))
            }
        }
    }

    /// The endpoint this listener is bound to. Resolves port 0 to the assigned port.
    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Tcp(listener) => {
                let addr = listener.local_addr()?;
                Ok(Endpoint::Tcp {
                    host: addr.ip().to_string(),
                    port: addr.port(),
                })
            }
            #[cfg(unix)]
            Listener::Unix(_, path) => Ok(Endpoint::Unix(path.clone())),
        }
    }
}

/// Removes a socket file left behind by an earlier run. Other files are left alone.
#[cfg(unix)]
fn remove_stale_socket(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::FileTypeExt;

    match std::fs::symlink_metadata(path) {
        Ok(metadata) if metadata.file_type().is_socket() => {
            log::debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)
        }
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        )),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

/// An accepted client connection
#[derive(Debug)]
pub enum Connection {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
            #[cfg(unix)]
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
            #[cfg(unix)]
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
            #[cfg(unix)]
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
            #[cfg(unix)]
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[test]
fn parse_tcp_endpoint() {
    assert_eq!(
        "tcp:localhost:2222".parse::<Endpoint>().unwrap(),
        Endpoint::Tcp {
            host: "localhost".to_string(),
            port: 2222
        }
    );
    assert_eq!(
        "tcp:[::1]:2222".parse::<Endpoint>().unwrap(),
        Endpoint::Tcp {
            host: "::1".to_string(),
            port: 2222
        }
    );
}

#[test]
fn endpoint_display_round_trips() {
    for spec in ["tcp:127.0.0.1:2222", "tcp:[::1]:0"] {
        assert_eq!(spec.parse::<Endpoint>().unwrap().to_string(), spec);
    }
}

#[cfg(unix)]
#[test]
fn parse_unix_endpoint() {
    assert_eq!(
        "unix:/tmp/jtag.sock".parse::<Endpoint>().unwrap(),
        Endpoint::Unix(PathBuf::from("/tmp/jtag.sock"))
    );
    assert_eq!(
        "unix:".parse::<Endpoint>(),
        Err(EndpointError::EmptyAddress)
    );
}

#[test]
fn reject_invalid_endpoints() {
    assert!(matches!(
        "udp:localhost:1".parse::<Endpoint>(),
        Err(EndpointError::UnknownScheme(_))
    ));
    assert!(matches!(
        "tcp:localhost".parse::<Endpoint>(),
        Err(EndpointError::MissingPort(_))
    ));
    assert!(matches!(
        "tcp:localhost:99999".parse::<Endpoint>(),
        Err(EndpointError::InvalidPort(_))
    ));
    assert_eq!(
        "tcp::2222".parse::<Endpoint>(),
        Err(EndpointError::EmptyAddress)
    );
}
