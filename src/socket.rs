use std::{
    io::{self, ErrorKind, Read, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
};

use mio::net::{TcpListener, TcpStream, UnixStream};
use socket2::{Domain, Protocol, Socket, Type};

#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SocketResult {
    Continue,
    Closed,
    WouldBlock,
    Error,
}

/// non blocking read/write primitives over a raw socket
///
/// `socket_read` and `socket_write` loop until the socket has nothing more
/// to give or take, and report how far they got along with why they stopped
pub trait SocketHandler {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult);
    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult);
}

impl SocketHandler for TcpStream {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        socket_read(self, buf)
    }

    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        socket_write(self, buf)
    }
}

impl SocketHandler for UnixStream {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        socket_read(self, buf)
    }

    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        socket_write(self, buf)
    }
}

fn socket_read<S: Read>(socket: &mut S, buf: &mut [u8]) -> (usize, SocketResult) {
    let mut size = 0usize;
    loop {
        if size == buf.len() {
            return (size, SocketResult::Continue);
        }
        match socket.read(&mut buf[size..]) {
            Ok(0) => return (size, SocketResult::Closed),
            Ok(sz) => size += sz,
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock => return (size, SocketResult::WouldBlock),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe => return (size, SocketResult::Closed),
                _ => {
                    error!("SOCKET\tsocket_read error={:?}", e);
                    return (size, SocketResult::Error);
                }
            },
        }
    }
}

fn socket_write<S: Write>(socket: &mut S, buf: &[u8]) -> (usize, SocketResult) {
    let mut size = 0usize;
    loop {
        if size == buf.len() {
            return (size, SocketResult::Continue);
        }
        match socket.write(&buf[size..]) {
            Ok(0) => return (size, SocketResult::Continue),
            Ok(sz) => size += sz,
            Err(e) => match e.kind() {
                ErrorKind::WouldBlock => return (size, SocketResult::WouldBlock),
                ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe => return (size, SocketResult::Closed),
                _ => {
                    error!("SOCKET\tsocket_write error={:?}", e);
                    return (size, SocketResult::Error);
                }
            },
        }
    }
}

/// an upstream endpoint is either a TCP address or a local unix socket path
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamAddr {
    Tcp(SocketAddr),
    Unix(PathBuf),
}

impl std::fmt::Display for UpstreamAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            UpstreamAddr::Tcp(addr) => write!(f, "{addr}"),
            UpstreamAddr::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// connected (or connecting) upstream socket, dispatching over both address
/// families
pub enum UpstreamConnection {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl UpstreamConnection {
    pub fn connect(addr: &UpstreamAddr) -> io::Result<UpstreamConnection> {
        match addr {
            UpstreamAddr::Tcp(addr) => TcpStream::connect(*addr).map(UpstreamConnection::Tcp),
            UpstreamAddr::Unix(path) => {
                UnixStream::connect(Path::new(path)).map(UpstreamConnection::Unix)
            }
        }
    }

    pub fn register(
        &mut self,
        registry: &mio::Registry,
        token: mio::Token,
        interests: mio::Interest,
    ) -> io::Result<()> {
        match self {
            UpstreamConnection::Tcp(s) => registry.register(s, token, interests),
            UpstreamConnection::Unix(s) => registry.register(s, token, interests),
        }
    }

    pub fn deregister(&mut self, registry: &mio::Registry) -> io::Result<()> {
        match self {
            UpstreamConnection::Tcp(s) => registry.deregister(s),
            UpstreamConnection::Unix(s) => registry.deregister(s),
        }
    }

    /// checks the outcome of a non blocking connect once the socket reports
    /// writable
    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        match self {
            UpstreamConnection::Tcp(s) => s.take_error(),
            UpstreamConnection::Unix(s) => s.take_error(),
        }
    }
}

impl SocketHandler for UpstreamConnection {
    fn socket_read(&mut self, buf: &mut [u8]) -> (usize, SocketResult) {
        match self {
            UpstreamConnection::Tcp(s) => s.socket_read(buf),
            UpstreamConnection::Unix(s) => s.socket_read(buf),
        }
    }

    fn socket_write(&mut self, buf: &[u8]) -> (usize, SocketResult) {
        match self {
            UpstreamConnection::Tcp(s) => s.socket_write(buf),
            UpstreamConnection::Unix(s) => s.socket_write(buf),
        }
    }
}

pub fn server_bind(addr: SocketAddr) -> io::Result<TcpListener> {
    let sock = Socket::new(
        Domain::for_address(addr),
        Type::STREAM,
        Some(Protocol::TCP),
    )?;

    // set so_reuseaddr, but only on unix (mirrors what libstd does)
    if cfg!(unix) {
        sock.set_reuse_address(true)?;
    }
    sock.set_reuse_port(true)?;
    sock.set_nonblocking(true)?;

    sock.bind(&addr.into())?;
    sock.listen(1024)?;

    Ok(TcpListener::from_std(sock.into()))
}
