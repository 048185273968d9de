//! Uniform non-blocking read/write over a plain TCP socket or a TLS session.
//!
//! Mirrors `apib_io_socket.c`'s `io_Read`/`io_Write`: a positive result is
//! `Ok(n)`, a zero-length read is `Eof`, a would-block error becomes
//! `NeedRead`/`NeedWrite` (matching the operation that was attempted), and
//! anything else is `TransportError`. For TLS, "want read"/"want write" from
//! the handshake/record layer map the same way — including the case where a
//! caller-requested *write* comes back `NeedRead` because TLS renegotiation
//! needs to read a record first, and vice versa. Neither implementation ever
//! blocks; on `NeedRead`/`NeedWrite` the caller re-arms readiness and retries
//! later.

use std::io::{self, ErrorKind, Read, Write};

use mio::net::TcpStream;
use rustls::ClientConnection;

/// Result of one non-blocking socket operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStatus {
    /// The operation made progress; the accompanying count is nonzero.
    Ok,
    /// The operation would block on a read; re-register readable.
    NeedRead,
    /// The operation would block on a write; re-register writable.
    NeedWrite,
    /// The peer closed the connection (read only).
    Eof,
    /// An unrecoverable transport or TLS error.
    TransportError,
}

/// Writes `buf` to a plain-TCP `stream`, never blocking.
pub fn write_plain(stream: &mut TcpStream, buf: &[u8]) -> (IoStatus, usize) {
    match stream.write(buf) {
        Ok(0) => (IoStatus::Eof, 0),
        Ok(n) => (IoStatus::Ok, n),
        Err(e) if e.kind() == ErrorKind::WouldBlock => (IoStatus::NeedWrite, 0),
        Err(e) if e.kind() == ErrorKind::Interrupted => (IoStatus::Ok, 0),
        Err(_) => (IoStatus::TransportError, 0),
    }
}

/// Reads into `buf` from a plain-TCP `stream`, never blocking.
pub fn read_plain(stream: &mut TcpStream, buf: &mut [u8]) -> (IoStatus, usize) {
    match stream.read(buf) {
        Ok(0) => (IoStatus::Eof, 0),
        Ok(n) => (IoStatus::Ok, n),
        Err(e) if e.kind() == ErrorKind::WouldBlock => (IoStatus::NeedRead, 0),
        Err(e) if e.kind() == ErrorKind::Interrupted => (IoStatus::Ok, 0),
        Err(_) => (IoStatus::TransportError, 0),
    }
}

/// Drives one step of a TLS session against its underlying socket: pulls any
/// pending ciphertext off the wire, lets rustls process it, and copies out
/// any plaintext that becomes available. Returns `NeedWrite` if rustls has
/// outgoing bytes of its own that must be flushed before more can be read
/// (renegotiation).
pub fn read_tls(
    tls: &mut ClientConnection,
    stream: &mut TcpStream,
    out: &mut [u8],
) -> (IoStatus, usize) {
    loop {
        if tls.wants_write() {
            return (IoStatus::NeedWrite, 0);
        }

        match tls.read_tls(stream) {
            Ok(0) => return (IoStatus::Eof, 0),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                // No more ciphertext on the wire right now; see if a
                // previous read already produced plaintext to hand back.
                return drain_plaintext(tls, out);
            }
            Err(_) => return (IoStatus::TransportError, 0),
        }

        if tls.process_new_packets().is_err() {
            return (IoStatus::TransportError, 0);
        }

        let (status, n) = drain_plaintext(tls, out);
        if n > 0 || status != IoStatus::NeedRead {
            return (status, n);
        }
    }
}

fn drain_plaintext(tls: &mut ClientConnection, out: &mut [u8]) -> (IoStatus, usize) {
    match tls.reader().read(out) {
        Ok(0) => (IoStatus::NeedRead, 0),
        Ok(n) => (IoStatus::Ok, n),
        Err(e) if e.kind() == ErrorKind::WouldBlock => (IoStatus::NeedRead, 0),
        Err(_) => (IoStatus::TransportError, 0),
    }
}

/// Writes `buf` as TLS application data, flushing ciphertext to `stream`.
pub fn write_tls(
    tls: &mut ClientConnection,
    stream: &mut TcpStream,
    buf: &[u8],
) -> (IoStatus, usize) {
    if tls.wants_read() {
        // The handshake (or a renegotiation) needs incoming bytes before any
        // more application data can be queued.
        return (IoStatus::NeedRead, 0);
    }

    let n = match tls.writer().write(buf) {
        Ok(n) => n,
        Err(_) => return (IoStatus::TransportError, 0),
    };

    match flush_tls(tls, stream) {
        IoStatus::TransportError => (IoStatus::TransportError, 0),
        IoStatus::NeedRead => (IoStatus::NeedRead, 0),
        IoStatus::NeedWrite => {
            if n > 0 {
                (IoStatus::Ok, n)
            } else {
                (IoStatus::NeedWrite, 0)
            }
        }
        _ => (IoStatus::Ok, n),
    }
}

/// Flushes any ciphertext rustls has queued for `stream`, non-blocking.
pub fn flush_tls(tls: &mut ClientConnection, stream: &mut TcpStream) -> IoStatus {
    while tls.wants_write() {
        match tls.write_tls(stream) {
            Ok(0) => return IoStatus::Eof,
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => return IoStatus::NeedWrite,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(_) => return IoStatus::TransportError,
        }
    }
    IoStatus::Ok
}

/// Connects a non-blocking plain TCP socket. A connection in progress is not
/// an error at this layer; readiness for `Interest::WRITABLE` plus
/// `take_error()` coming back `None` is how the caller confirms success.
pub fn connect_plain(addr: std::net::SocketAddr) -> io::Result<TcpStream> {
    TcpStream::connect(addr)
}
