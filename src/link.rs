//! The physical connection to the server.
//!
//! Exactly one [`Link`] exists at a time. It owns the protocol client plus a
//! cloned probe handle on the same socket, used for the bounded readiness
//! poll while the connection sits in idle mode. Whether the session talks
//! TCP or a local socket is decided by the shape of the configured host: a
//! leading path separator selects a socket path.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use mpd::Client;

use crate::config::Config;
use crate::error::{Error, Result};

/// Transport streams the session can multiplex.
///
/// The probe handle shares the socket with the protocol client, so the read
/// timeout set for a poll must be restored afterwards.
pub trait Pollable: Read + Write + Sized {
    fn probe_handle(&self) -> io::Result<Self>;
    fn peek_byte(&self) -> io::Result<usize>;
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()>;

    /// Bounded readiness check: waits at most `budget` for the server to
    /// have bytes for us, then restores `restore` as the socket timeout.
    fn poll_ready(&self, budget: Duration, restore: Duration) -> io::Result<bool> {
        self.set_read_timeout(Some(budget))?;
        let ready = match self.peek_byte() {
            // Bytes waiting, or EOF the reader should run into.
            Ok(_) => true,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                false
            }
            Err(e) => return Err(e),
        };
        self.set_read_timeout(Some(restore))?;
        Ok(ready)
    }
}

impl Pollable for TcpStream {
    fn probe_handle(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn peek_byte(&self) -> io::Result<usize> {
        let mut byte = [0u8; 1];
        self.peek(&mut byte)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        TcpStream::set_read_timeout(self, timeout)
    }
}

impl Pollable for UnixStream {
    fn probe_handle(&self) -> io::Result<Self> {
        self.try_clone()
    }

    fn peek_byte(&self) -> io::Result<usize> {
        let mut byte = [0u8; 1];
        self.peek(&mut byte)
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        UnixStream::set_read_timeout(self, timeout)
    }
}

/// The live connection: protocol client plus readiness probe.
pub struct Link<S: Pollable> {
    pub client: Client<S>,
    probe: S,
    timeout: Duration,
}

impl<S: Pollable> Link<S> {
    #[must_use]
    pub fn new(client: Client<S>, probe: S, timeout: Duration) -> Self {
        Self {
            client,
            probe,
            timeout,
        }
    }

    /// Splits the link into the pieces the idle loop needs at the same
    /// time: the client (borrowed by the idle guard), the probe, and the
    /// timeout to restore after polls.
    pub fn split(&mut self) -> (&mut Client<S>, &S, Duration) {
        (&mut self.client, &self.probe, self.timeout)
    }
}

/// Whether the configured host names a local socket path.
#[must_use]
pub fn is_socket_path(host: &str) -> bool {
    host.starts_with('/')
}

fn handshake<S: Pollable>(stream: S, config: &Config) -> Result<Link<S>> {
    let probe = stream.probe_handle()?;
    let mut client = Client::new(stream)?;
    if !config.mpd_pass.is_empty() {
        client
            .login(&config.mpd_pass)
            .map_err(|e| Error::unauthenticated(e.to_string()))?;
    }
    Ok(Link::new(client, probe, config.timeout()))
}

/// Connects over TCP to `host:port` and authenticates.
pub fn connect_tcp(config: &Config) -> Result<Link<TcpStream>> {
    info!("connecting to {}:{}", config.mpd_host, config.mpd_port);
    let stream = TcpStream::connect((config.mpd_host.as_str(), config.mpd_port))
        .map_err(Error::unavailable)?;
    stream.set_read_timeout(Some(config.timeout()))?;
    stream.set_write_timeout(Some(config.timeout()))?;
    handshake(stream, config)
}

/// Connects to a local socket path and authenticates.
pub fn connect_unix(config: &Config) -> Result<Link<UnixStream>> {
    info!("connecting to socket {}", config.mpd_host);
    let stream = UnixStream::connect(&config.mpd_host).map_err(Error::unavailable)?;
    stream.set_read_timeout(Some(config.timeout()))?;
    stream.set_write_timeout(Some(config.timeout()))?;
    handshake(stream, config)
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted in-memory server for exercising the session without a
    //! network. Replies `OK` to every command, queues idle notifications
    //! only while the client is idling, and records every byte the session
    //! writes so tests can assert command ordering.

    use std::collections::VecDeque;
    use std::io::{self, Read, Write};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::Pollable;

    #[derive(Default)]
    struct Inner {
        /// Bytes the client may read next.
        input: VecDeque<u8>,
        /// Everything the client has written, verbatim.
        written: Vec<u8>,
        /// Partial command line being assembled from writes.
        line: Vec<u8>,
        /// Whether the client has an `idle` outstanding.
        idling: bool,
        /// Events waiting for the next idle window.
        events: Vec<String>,
        /// Song uris served for library listings.
        library: Vec<String>,
        /// Queue ids handed out for added songs.
        next_id: u32,
        /// Whether responses are being buffered inside a command list.
        in_list: bool,
    }

    impl Inner {
        fn respond(&mut self, line: &str) {
            let command = line.split_whitespace().next().unwrap_or_default();
            match command {
                "command_list_begin" | "command_list_ok_begin" => {
                    // Responses are held until the list closes; real MPD sends
                    // one terminal `OK` for the whole list, not one per command.
                    self.in_list = true;
                }
                "command_list_end" => {
                    self.in_list = false;
                    self.input.extend(b"OK\n");
                }
                "idle" => {
                    self.idling = true;
                    if !self.events.is_empty() {
                        self.flush_events();
                    }
                }
                "noidle" => {
                    self.flush_events();
                }
                "listall" => {
                    for uri in &self.library {
                        self.input.extend(format!("file: {uri}\n").bytes());
                    }
                    self.finish();
                }
                "addid" | "add" => {
                    self.next_id += 1;
                    self.input
                        .extend(format!("Id: {}\n", self.next_id).bytes());
                    self.finish();
                }
                "status" => {
                    self.input.extend(
                        b"volume: -1\nrepeat: 0\nrandom: 0\nsingle: 0\nconsume: 0\n\
                          playlist: 1\nplaylistlength: 0\nstate: stop\n",
                    );
                    self.finish();
                }
                _ => self.finish(),
            }
        }

        /// Emits the per-command `OK`, unless the command is part of a command
        /// list (where a single terminal `OK` is sent at `command_list_end`).
        fn finish(&mut self) {
            if !self.in_list {
                self.input.extend(b"OK\n");
            }
        }

        fn flush_events(&mut self) {
            for event in self.events.drain(..) {
                self.input.extend(format!("changed: {event}\n").bytes());
            }
            self.input.extend(b"OK\n");
            self.idling = false;
        }
    }

    /// One handle onto the shared fake socket; clones see the same state.
    #[derive(Clone)]
    pub struct FakeStream {
        inner: Arc<Mutex<Inner>>,
    }

    impl FakeStream {
        pub fn new() -> Self {
            let inner = Inner {
                input: b"OK MPD 0.23.5\n".iter().copied().collect(),
                ..Inner::default()
            };
            Self {
                inner: Arc::new(Mutex::new(inner)),
            }
        }

        /// Seeds the songs served by library listings.
        pub fn set_library<I>(&self, uris: I)
        where
            I: IntoIterator,
            I::Item: Into<String>,
        {
            self.inner.lock().unwrap().library = uris.into_iter().map(Into::into).collect();
        }

        /// Queues an idle notification, delivered at the next idle window.
        pub fn push_event(&self, subsystem: &str) {
            let mut inner = self.inner.lock().unwrap();
            inner.events.push(subsystem.to_string());
            if inner.idling {
                inner.flush_events();
            }
        }

        /// Everything the client wrote so far, lossily decoded.
        pub fn written(&self) -> String {
            String::from_utf8_lossy(&self.inner.lock().unwrap().written).into_owned()
        }
    }

    impl Read for FakeStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            if inner.input.is_empty() {
                return Err(io::Error::from(io::ErrorKind::WouldBlock));
            }
            let mut count = 0;
            while count < buf.len() {
                match inner.input.pop_front() {
                    Some(byte) => {
                        buf[count] = byte;
                        count += 1;
                    }
                    None => break,
                }
            }
            Ok(count)
        }
    }

    impl Write for FakeStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut inner = self.inner.lock().unwrap();
            inner.written.extend_from_slice(buf);
            for &byte in buf {
                if byte == b'\n' {
                    let line = String::from_utf8_lossy(&inner.line).into_owned();
                    inner.line.clear();
                    inner.respond(&line);
                } else {
                    inner.line.push(byte);
                }
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Pollable for FakeStream {
        fn probe_handle(&self) -> io::Result<Self> {
            Ok(self.clone())
        }

        fn peek_byte(&self) -> io::Result<usize> {
            let inner = self.inner.lock().unwrap();
            if inner.input.is_empty() {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            } else {
                Ok(1)
            }
        }

        fn set_read_timeout(&self, _timeout: Option<Duration>) -> io::Result<()> {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeStream;
    use super::*;

    #[test]
    fn socket_paths_are_recognized() {
        assert!(is_socket_path("/run/mpd/socket"));
        assert!(!is_socket_path("localhost"));
        assert!(!is_socket_path("music.local"));
    }

    #[test]
    fn fake_stream_answers_commands() {
        let fake = FakeStream::new();
        let mut client = Client::new(fake.clone()).expect("handshake");
        client.play().expect("play");
        assert!(fake.written().contains("play"));
    }

    #[test]
    fn probe_reports_readiness() {
        let fake = FakeStream::new();
        // The banner is still buffered: ready.
        assert!(fake
            .poll_ready(Duration::from_millis(10), Duration::from_secs(1))
            .unwrap());
        let _client = Client::new(fake.clone()).expect("handshake");
        // Banner consumed, nothing pending.
        assert!(!fake
            .poll_ready(Duration::from_millis(10), Duration::from_secs(1))
            .unwrap());
    }
}
