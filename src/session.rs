
use crate::utils;

use log::debug;
use mio::net::TcpStream;
use mio::{Interest, Token};

use std::collections::BTreeSet;
use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;

const READ_CHUNK: usize = 4096;
// A session that sends this much without ever finishing a line isn't
// speaking our protocol; see read_ready().
const MAX_PENDING_INPUT: usize = 8192;

/// One connected player.  Sessions live in an owned Vec on the game loop,
/// iterated in insertion order; nobody unlinks one mid-scan.  Instead the
/// close_pending flag gets set wherever trouble is noticed, and the loop
/// compacts the whole list once at the end of the tick.
pub struct Session {
    pub token: Token,
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub name: String,
    pub channels: BTreeSet<String>,
    pub close_pending: bool,
    pub(crate) registered_interest: Interest,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
}

impl Session {
    pub fn new(token: Token, stream: TcpStream, addr: SocketAddr) -> Session {
        Session {
            token,
            stream,
            addr,
            name: format!("guest{}", token.0),
            channels: BTreeSet::new(),
            close_pending: false,
            registered_interest: Interest::READABLE,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
        }
    }

    /// Queue a line for delivery, appending the \r\n telnet clients expect.
    /// A session whose queue would pass `cap` is flagged for close instead;
    /// letting one stalled client grow a buffer forever is how a chat server
    /// falls over at 4am.
    pub fn queue_line(&mut self, line: &str, cap: usize) {
        if self.close_pending {
            return;
        }
        if self.outbuf.len() + line.len() + 2 > cap {
            debug!(
                "Session {} is {} bytes behind; dropping it",
                self.name,
                self.outbuf.len()
            );
            self.close_pending = true;
            return;
        }
        self.outbuf.extend_from_slice(line.as_bytes());
        self.outbuf.extend_from_slice(b"\r\n");
    }

    pub fn wants_write(&self) -> bool {
        !self.outbuf.is_empty()
    }

    pub fn pending_output(&self) -> usize {
        self.outbuf.len()
    }

    pub fn desired_interest(&self) -> Interest {
        if self.wants_write() {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::READABLE
        }
    }

    /// Drain the socket and return every complete line that has arrived.
    /// EOF and real errors flag the session; the caller reaps it later.
    pub fn read_ready(&mut self) -> Vec<String> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => {
                    self.close_pending = true;
                    break;
                }
                Ok(n) => {
                    self.inbuf.extend_from_slice(&chunk[..n]);
                    if self.inbuf.len() > MAX_PENDING_INPUT {
                        debug!(
                            "Session {} sent {} bytes with no line break; dropping it",
                            self.name,
                            self.inbuf.len()
                        );
                        self.close_pending = true;
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Read error from {}: {}", self.addr, e);
                    self.close_pending = true;
                    break;
                }
            }
        }
        utils::drain_lines(&mut self.inbuf)
    }

    /// Push queued output at the socket until it's empty or would block.
    pub fn write_ready(&mut self) {
        let mut written = 0;
        while written < self.outbuf.len() {
            match self.stream.write(&self.outbuf[written..]) {
                Ok(0) => {
                    self.close_pending = true;
                    break;
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("Write error to {}: {}", self.addr, e);
                    self.close_pending = true;
                    break;
                }
            }
        }
        self.outbuf.drain(..written);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn pair() -> (Session, std::net::TcpStream) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (Session::new(Token(99), TcpStream::from_std(server), peer), client)
    }

    #[test]
    fn overflowing_the_output_cap_flags_the_session() {
        let (mut session, _client) = pair();
        session.queue_line("fits fine", 64);
        assert!(!session.close_pending);
        session.queue_line(&"x".repeat(100), 64);
        assert!(session.close_pending);
    }

    #[test]
    fn read_ready_returns_complete_lines() {
        use std::io::Write as _;
        let (mut session, mut client) = pair();
        client.write_all(b"hello\r\nwor").unwrap();
        client.flush().unwrap();
        thread::sleep(Duration::from_millis(50));
        let lines = session.read_ready();
        assert_eq!(lines, vec!["hello".to_string()]);
        assert!(!session.close_pending);

        client.write_all(b"ld\n").unwrap();
        thread::sleep(Duration::from_millis(50));
        let lines = session.read_ready();
        assert_eq!(lines, vec!["world".to_string()]);
    }

    #[test]
    fn eof_flags_the_session_for_close() {
        let (mut session, client) = pair();
        drop(client);
        thread::sleep(Duration::from_millis(50));
        let lines = session.read_ready();
        assert!(lines.is_empty());
        assert!(session.close_pending);
    }
}
