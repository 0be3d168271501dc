
//! A tiny status endpoint so ops tooling can probe the process.  `GET
//! /health` answers with a JSON body; 200 when everything we depend on is
//! connected, 503 when it isn't, 404 for any other path.  It rides the same
//! poll loop as everything else; connections are one request, one response,
//! close.

use crate::comm::HEALTH_TOKEN;
use crate::error::Result;

use log::{debug, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry, Token};

use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::Instant;

const MAX_REQUEST: usize = 4096;

/// Running totals the health body reports.  Owned by the loop, bumped as
/// traffic moves.
pub struct Stats {
    pub started: Instant,
    pub inbound: u64,
    pub outbound: u64,
}

impl Stats {
    pub fn new() -> Stats {
        Stats {
            started: Instant::now(),
            inbound: 0,
            outbound: 0,
        }
    }
}

/// Everything a response needs to say, computed by the loop at the moment
/// the request is answered.
pub struct Snapshot {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub players: usize,
    pub bridge_connected: bool,
    pub inbound: u64,
    pub outbound: u64,
}

pub struct HealthConn {
    pub token: Token,
    pub close_pending: bool,
    pub(crate) registered_interest: Interest,
    stream: TcpStream,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    responded: bool,
}

impl HealthConn {
    pub fn pending_output(&self) -> usize {
        self.outbuf.len()
    }
}

pub struct Health {
    listener: TcpListener,
    conns: Vec<HealthConn>,
}

impl Health {
    pub fn new(addr: SocketAddr) -> Result<Health> {
        Ok(Health {
            listener: TcpListener::bind(addr)?,
            conns: Vec::new(),
        })
    }

    pub fn register(&mut self, registry: &Registry) -> Result<()> {
        registry.register(&mut self.listener, HEALTH_TOKEN, Interest::READABLE)?;
        Ok(())
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    pub fn conns(&self) -> &[HealthConn] {
        &self.conns
    }

    pub fn accept_ready(&mut self, registry: &Registry, next_token: &mut usize) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, addr)) => {
                    let token = Token(*next_token);
                    *next_token += 1;
                    if let Err(e) = registry.register(&mut stream, token, Interest::READABLE) {
                        warn!("Couldn't register health probe from {}: {}", addr, e);
                        continue;
                    }
                    debug!("Health probe from {}", addr);
                    self.conns.push(HealthConn {
                        token,
                        close_pending: false,
                        registered_interest: Interest::READABLE,
                        stream,
                        inbuf: Vec::new(),
                        outbuf: Vec::new(),
                        responded: false,
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Health listener accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Service one connection's readiness.  Returns false if the token isn't
    /// one of ours.
    pub fn service(&mut self, token: Token, readable: bool, writable: bool, snapshot: &Snapshot) -> bool {
        let conn = match self.conns.iter_mut().find(|c| c.token == token) {
            Some(conn) => conn,
            None => return false,
        };

        if readable {
            let mut chunk = [0u8; 512];
            loop {
                match conn.stream.read(&mut chunk) {
                    Ok(0) => {
                        conn.close_pending = true;
                        break;
                    }
                    Ok(n) => {
                        conn.inbuf.extend_from_slice(&chunk[..n]);
                        if conn.inbuf.len() > MAX_REQUEST {
                            conn.close_pending = true;
                            break;
                        }
                    }
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => {
                        conn.close_pending = true;
                        break;
                    }
                }
            }
            if !conn.responded && request_complete(&conn.inbuf) {
                conn.outbuf = render_response(&conn.inbuf, snapshot);
                conn.responded = true;
                conn.close_pending = false;
            }
        }

        if writable {
            let mut written = 0;
            while written < conn.outbuf.len() {
                match conn.stream.write(&conn.outbuf[written..]) {
                    Ok(0) => {
                        conn.close_pending = true;
                        break;
                    }
                    Ok(n) => written += n,
                    Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                    Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => {
                        conn.close_pending = true;
                        break;
                    }
                }
            }
            conn.outbuf.drain(..written);
        }

        if conn.responded && conn.outbuf.is_empty() {
            conn.close_pending = true;
        }
        true
    }

    pub fn sync_interests(&mut self, registry: &Registry) -> Result<()> {
        for conn in self.conns.iter_mut() {
            let desired = if conn.outbuf.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            if desired != conn.registered_interest {
                registry.reregister(&mut conn.stream, conn.token, desired)?;
                conn.registered_interest = desired;
            }
        }
        Ok(())
    }

    pub fn reap(&mut self, registry: &Registry) {
        for conn in self.conns.iter_mut().filter(|c| c.close_pending) {
            if let Err(e) = registry.deregister(&mut conn.stream) {
                debug!("Deregistering health probe: {}", e);
            }
        }
        self.conns.retain(|c| !c.close_pending);
    }
}

fn request_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.windows(2).any(|w| w == b"\n\n")
}

// TODO: Parse headers if we ever serve anything beyond a status probe; for
// now the request line is all that matters.
fn render_response(request: &[u8], snapshot: &Snapshot) -> Vec<u8> {
    let head = String::from_utf8_lossy(request);
    let mut parts = head.split_whitespace();
    let method = parts.next().unwrap_or("");
    let path = parts.next().unwrap_or("");

    if method == "GET" && path == "/health" {
        let code = if snapshot.healthy {
            "200 OK"
        } else {
            "503 Service Unavailable"
        };
        let body = serde_json::json!({
            "status": if snapshot.healthy { "healthy" } else { "unhealthy" },
            "uptime": snapshot.uptime_secs,
            "connections": {
                "players": snapshot.players,
                "bridge": snapshot.bridge_connected,
            },
            "messages": {
                "inbound": snapshot.inbound,
                "outbound": snapshot.outbound,
            },
        });
        let body = serde_json::to_string_pretty(&body).unwrap_or_else(|_| "{}".to_string());
        format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            code,
            body.len(),
            body
        )
        .into_bytes()
    } else {
        let body = "Not Found";
        format!(
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )
        .into_bytes()
    }
}
