
//! The relay bridge: one extra listening socket, at most one connected relay
//! process, folded into the same poll loop as everything else.
//!
//! The relay speaks the newline-delimited JSON envelope in `protocol`.  Its
//! first message has to be an auth line when a token is configured, it's
//! expected to heartbeat periodically, and everything else it sends is chat
//! to be fanned out to whoever has joined the channel in question.

pub mod protocol;
pub mod ratelimit;

use crate::comm::{BRIDGE_CLIENT_TOKEN, BRIDGE_SERVER_TOKEN};
use crate::config::{BridgeConfig, TakeoverPolicy};
use crate::error::{CommError, Result};
use crate::utils;

use log::{debug, info, warn};
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Registry};

use protocol::{RelayMessage, AUTH_CHANNEL, HEARTBEAT_CHANNEL};
use ratelimit::RateLimiter;

use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

const READ_CHUNK: usize = 4096;

/// The currently connected relay process.
pub struct RelayClient {
    pub stream: TcpStream,
    pub addr: SocketAddr,
    pub authed: bool,
    pub close_pending: bool,
    pub connected_at: Instant,
    pub last_activity: Instant,
    pub(crate) registered_interest: Interest,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
}

/// The bridge component.  The loop holds an `Option<Bridge>`; when it's None
/// there simply is no bridge and none of this code runs.  Both sockets in
/// here are `Option`s too, so "no socket" can never be confused with a
/// socket.
pub struct Bridge {
    config: BridgeConfig,
    listener: Option<TcpListener>,
    pub client: Option<RelayClient>,
    limiter: RateLimiter,
}

// accept_one() wants to accept, maybe give up on the listener, and only then
// touch self.client; pulling the accept result out through this keeps the
// borrows untangled.
enum AcceptStep {
    Got(TcpStream, SocketAddr),
    Nothing,
    ListenerBroken,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Result<Bridge> {
        let addr: SocketAddr = config.listen_addr.parse().map_err(|e| CommError::Address {
            addr: config.listen_addr.clone(),
            reason: format!("{}", e),
        })?;
        let listener = TcpListener::bind(addr)?;
        let limiter = RateLimiter::new(config.rate_limit_per_channel);
        Ok(Bridge {
            config,
            listener: Some(listener),
            client: None,
            limiter,
        })
    }

    pub fn register(&mut self, registry: &Registry) -> Result<()> {
        if let Some(listener) = self.listener.as_mut() {
            registry.register(listener, BRIDGE_SERVER_TOKEN, Interest::READABLE)?;
        }
        Ok(())
    }

    pub fn has_listener(&self) -> bool {
        self.listener.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Bytes queued for the relay and not yet written.  This going positive
    /// is exactly what earns the client socket a spot in the write set.
    pub fn outbuf_len(&self) -> usize {
        self.client.as_ref().map(|c| c.outbuf.len()).unwrap_or(0)
    }

    /// Accept at most one pending relay connection.  Returns true when the
    /// active client changed, so the caller knows not to service the
    /// newcomer against readiness that was polled for its predecessor.
    pub fn accept_one(&mut self, registry: &Registry, now: Instant) -> bool {
        let step = loop {
            let listener = match self.listener.as_mut() {
                Some(listener) => listener,
                None => return false,
            };
            match listener.accept() {
                Ok((stream, addr)) => break AcceptStep::Got(stream, addr),
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break AcceptStep::Nothing,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e)
                    if e.kind() == ErrorKind::ConnectionAborted
                        || e.kind() == ErrorKind::ConnectionReset =>
                {
                    warn!("Transient error accepting a relay connection: {}", e);
                    break AcceptStep::Nothing;
                }
                Err(e) => {
                    warn!("Relay listener failed ({}); running on without it", e);
                    break AcceptStep::ListenerBroken;
                }
            }
        };

        let (mut stream, addr) = match step {
            AcceptStep::Got(stream, addr) => (stream, addr),
            AcceptStep::Nothing => return false,
            AcceptStep::ListenerBroken => {
                if let Some(mut listener) = self.listener.take() {
                    if let Err(e) = registry.deregister(&mut listener) {
                        debug!("Deregistering the broken relay listener: {}", e);
                    }
                }
                return false;
            }
        };

        // We only take one connection per tick, so the poll has to be told to
        // look at the listener again in case more are queued behind this one.
        if let Some(listener) = self.listener.as_mut() {
            if let Err(e) = registry.reregister(listener, BRIDGE_SERVER_TOKEN, Interest::READABLE) {
                warn!("Couldn't re-arm the relay listener: {}", e);
            }
        }

        if self.client.is_some() {
            match self.config.takeover {
                TakeoverPolicy::Reject => {
                    info!("Turned away relay connection from {}: a relay is already connected", addr);
                    drop(stream);
                    return false;
                }
                TakeoverPolicy::Replace => {
                    info!("Relay connection from {} replaces the one already connected", addr);
                    self.drop_client(registry);
                }
            }
        }

        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay for relay {}: {}", addr, e);
        }
        if let Err(e) = registry.register(&mut stream, BRIDGE_CLIENT_TOKEN, Interest::READABLE) {
            warn!("Couldn't register relay client {}: {}", addr, e);
            return false;
        }

        let authed = self.config.auth_token.is_none();
        info!(
            "Relay connected from {}{}",
            addr,
            if authed { "" } else { " (awaiting auth)" }
        );
        self.client = Some(RelayClient {
            stream,
            addr,
            authed,
            close_pending: false,
            connected_at: now,
            last_activity: now,
            registered_interest: Interest::READABLE,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
        });
        true
    }

    /// Drain the relay socket and return the chat messages that survived
    /// parsing, auth, scrubbing and the rate limiter.  The caller fans them
    /// out to sessions.
    pub fn service_input(
        &mut self,
        now: Instant,
        channels: &[String],
        max_message_len: usize,
    ) -> Vec<RelayMessage> {
        let max_buffer = self.config.max_buffer;
        let auth_token = self.config.auth_token.clone();

        let client = match self.client.as_mut() {
            Some(client) => client,
            None => return Vec::new(),
        };
        if client.close_pending {
            return Vec::new();
        }

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match client.stream.read(&mut chunk) {
                Ok(0) => {
                    info!("Relay {} hung up", client.addr);
                    client.close_pending = true;
                    break;
                }
                Ok(n) => {
                    client.inbuf.extend_from_slice(&chunk[..n]);
                    if client.inbuf.len() > max_buffer {
                        warn!(
                            "Relay {} sent {} bytes without a line break; dropping it",
                            client.addr,
                            client.inbuf.len()
                        );
                        client.close_pending = true;
                        break;
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Read error from relay {}: {}", client.addr, e);
                    client.close_pending = true;
                    break;
                }
            }
        }

        let mut inbound = Vec::new();
        for line in utils::drain_lines(&mut client.inbuf) {
            if client.close_pending {
                break;
            }
            if line.trim().is_empty() {
                continue;
            }

            let msg = match protocol::decode_line(&line) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Failed to parse message from relay: {}", e);
                    continue;
                }
            };
            client.last_activity = now;

            if msg.channel == AUTH_CHANNEL {
                match &auth_token {
                    Some(token) if *token == msg.message => {
                        if !client.authed {
                            info!("Relay {} authenticated", client.addr);
                        }
                        client.authed = true;
                    }
                    Some(_) => {
                        warn!("Relay {} presented a bad auth token; dropping it", client.addr);
                        client.close_pending = true;
                    }
                    None => debug!("Ignoring auth message; no token is configured"),
                }
                continue;
            }
            if msg.channel == HEARTBEAT_CHANNEL {
                debug!("Relay heartbeat");
                continue;
            }
            if !client.authed {
                warn!("Relay {} spoke before authenticating; dropping it", client.addr);
                client.close_pending = true;
                break;
            }

            if !channels.contains(&msg.channel) {
                debug!("Relay message for unknown channel {:?}", msg.channel);
                continue;
            }
            let name = utils::scrub(&msg.name);
            let text = utils::scrub(&msg.message);
            if name.is_empty() || text.is_empty() {
                continue;
            }
            if text.chars().count() > max_message_len {
                debug!("Dropping over-long relay message from {}", name);
                continue;
            }
            if !self.limiter.allow(&msg.channel, &name, now) {
                info!("Rate limit exceeded for {} in {}", name, msg.channel);
                continue;
            }

            inbound.push(RelayMessage {
                channel: msg.channel,
                name,
                message: text,
                emoted: msg.emoted,
            });
        }
        inbound
    }

    /// Push queued output at the relay until it's all gone or would block.
    pub fn service_output(&mut self) {
        let client = match self.client.as_mut() {
            Some(client) => client,
            None => return,
        };
        if client.close_pending {
            return;
        }

        let mut written = 0;
        while written < client.outbuf.len() {
            match client.stream.write(&client.outbuf[written..]) {
                Ok(0) => {
                    client.close_pending = true;
                    break;
                }
                Ok(n) => written += n,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("Write error to relay {}: {}", client.addr, e);
                    client.close_pending = true;
                    break;
                }
            }
        }
        client.outbuf.drain(..written);
    }

    /// Queue one message for the relay.  Returns true only when it was
    /// actually queued; with no authenticated relay connected, outbound
    /// traffic just doesn't go anywhere, same as any other channel member
    /// who isn't there to hear it.
    pub fn queue(&mut self, msg: &RelayMessage) -> bool {
        let max_buffer = self.config.max_buffer;
        let client = match self.client.as_mut() {
            Some(client) if client.authed && !client.close_pending => client,
            _ => return false,
        };

        let line = match protocol::encode_line(msg) {
            Ok(line) => line,
            Err(e) => {
                warn!("Couldn't encode a relay message: {}", e);
                return false;
            }
        };
        if client.outbuf.len() + line.len() > max_buffer {
            warn!(
                "Relay {} is {} bytes behind; dropping it",
                client.addr,
                client.outbuf.len()
            );
            client.close_pending = true;
            return false;
        }
        client.outbuf.extend_from_slice(&line);
        true
    }

    /// Time-based policy, run once per tick: the auth deadline and the idle
    /// timeout.
    pub fn check_timers(&mut self, now: Instant) {
        let auth_deadline = Duration::from_secs(self.config.auth_deadline_secs);
        let idle_timeout = Duration::from_secs(self.config.idle_timeout_secs);
        let wants_auth = self.config.auth_token.is_some();

        if let Some(client) = self.client.as_mut() {
            if wants_auth && !client.authed && now.duration_since(client.connected_at) > auth_deadline
            {
                warn!("Relay {} never authenticated; dropping it", client.addr);
                client.close_pending = true;
            }
            if idle_timeout > Duration::from_secs(0)
                && now.duration_since(client.last_activity) > idle_timeout
            {
                info!(
                    "Relay {} has been idle for over {}s; dropping it",
                    client.addr,
                    idle_timeout.as_secs()
                );
                client.close_pending = true;
            }
        }
    }

    /// Keep the poll's view of the client socket in line with whether we
    /// have bytes waiting for it.
    pub fn sync_interests(&mut self, registry: &Registry) -> Result<()> {
        if let Some(client) = self.client.as_mut() {
            let desired = if client.outbuf.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            if desired != client.registered_interest {
                registry.reregister(&mut client.stream, BRIDGE_CLIENT_TOKEN, desired)?;
                client.registered_interest = desired;
            }
        }
        Ok(())
    }

    /// End-of-tick cleanup.  Returns true if the client went away.
    pub fn reap(&mut self, registry: &Registry) -> bool {
        let doomed = self
            .client
            .as_ref()
            .map(|client| client.close_pending)
            .unwrap_or(false);
        if doomed {
            self.drop_client(registry);
        }
        doomed
    }

    fn drop_client(&mut self, registry: &Registry) {
        if let Some(mut client) = self.client.take() {
            if let Err(e) = registry.deregister(&mut client.stream) {
                debug!("Deregistering relay client {}: {}", client.addr, e);
            }
            info!("Relay {} disconnected", client.addr);
        }
    }
}
