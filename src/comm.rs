
//! The heart of the server: one thread, one poll, every socket.
//!
//! Each trip around the loop (a tick) works out which sockets we care about
//! reading or writing, waits for readiness or the tick timeout, and then
//! services exactly what came back ready.  The order of servicing inside a
//! tick is fixed and deliberate:
//!
//!   1. accept new game connections off the mother socket,
//!   2. accept at most one new relay connection on the bridge,
//!   3. process relay input,
//!   4. flush relay output,
//!   5. read and write the ordinary sessions,
//!   6. reap everything flagged for close.
//!
//! Everything runs on the one thread, so there is no locking anywhere; the
//! single bounded wait in poll() is the only place we ever stop.

use crate::bridge::protocol::RelayMessage;
use crate::bridge::Bridge;
use crate::command::Command;
use crate::config::Config;
use crate::error::{CommError, Result};
use crate::health::{Health, Snapshot, Stats};
use crate::session::Session;
use crate::utils;

use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The game listener everyone connects to.
pub const MOTHER_TOKEN: Token = Token(0);
/// The bridge's listening socket.
pub const BRIDGE_SERVER_TOKEN: Token = Token(1);
/// The bridge's single connected relay.
pub const BRIDGE_CLIENT_TOKEN: Token = Token(2);
/// The health endpoint's listening socket.
pub const HEALTH_TOKEN: Token = Token(3);
// Sessions and health probes get tokens from here on up.
const FIRST_DYNAMIC_TOKEN: usize = 16;

/// The sockets one tick intends to watch, split into the classic read and
/// write sets.  This is computed fresh from loop state, so tests can check
/// exactly who would be watched without running a poll.
#[derive(Debug, Default, PartialEq)]
pub struct InterestPlan {
    pub read: Vec<Token>,
    pub write: Vec<Token>,
}

// What one poll actually reported, bucketed for dispatch.  The fixed-order
// dispatch below reads from this rather than walking raw events, so the
// ordering contract can't quietly depend on event arrival order.
#[derive(Default)]
struct Readiness {
    mother: bool,
    bridge_server: bool,
    bridge_client_read: bool,
    bridge_client_write: bool,
    health_server: bool,
    dynamic: Vec<(Token, bool, bool)>,
}

pub struct GameLoop {
    config: Config,
    poll: Poll,
    events: Events,
    mother: TcpListener,
    sessions: Vec<Session>,
    bridge: Option<Bridge>,
    health: Option<Health>,
    stats: Stats,
    next_token: usize,
    shutdown: Arc<AtomicBool>,
}

impl GameLoop {
    /// Bind everything the config asks for and wire it into one poll.  The
    /// bridge and health endpoint are both optional components handed in via
    /// config; when absent they simply don't exist here.
    pub fn new(config: Config, shutdown: Arc<AtomicBool>) -> Result<GameLoop> {
        let poll = Poll::new()?;

        let addr = parse_addr(&config.listen_addr)?;
        let mut mother = TcpListener::bind(addr)?;
        poll.registry()
            .register(&mut mother, MOTHER_TOKEN, Interest::READABLE)?;

        let bridge = match config.bridge.clone() {
            Some(bridge_config) => {
                let mut bridge = Bridge::new(bridge_config)?;
                bridge.register(poll.registry())?;
                Some(bridge)
            }
            None => None,
        };

        let health = match config.health_addr.clone() {
            Some(health_addr) => {
                let mut health = Health::new(parse_addr(&health_addr)?)?;
                health.register(poll.registry())?;
                Some(health)
            }
            None => None,
        };

        Ok(GameLoop {
            config,
            poll,
            events: Events::with_capacity(256),
            mother,
            sessions: Vec::new(),
            bridge,
            health,
            stats: Stats::new(),
            next_token: FIRST_DYNAMIC_TOKEN,
            shutdown,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.mother.local_addr()?)
    }

    pub fn bridge_addr(&self) -> Option<SocketAddr> {
        self.bridge.as_ref().and_then(|b| b.local_addr())
    }

    pub fn health_addr(&self) -> Option<SocketAddr> {
        self.health.as_ref().and_then(|h| h.local_addr())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn bridge_connected(&self) -> bool {
        self.bridge
            .as_ref()
            .map(|b| b.client.is_some())
            .unwrap_or(false)
    }

    pub fn bridge_outbuf_len(&self) -> usize {
        self.bridge.as_ref().map(|b| b.outbuf_len()).unwrap_or(0)
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Which sockets this tick would watch, and for what.  The rules:
    ///
    /// - reads: the mother socket always; the bridge listener and relay
    ///   client when they exist; the health listener and its probes; every
    ///   session.
    /// - writes: only whoever has bytes queued.  In particular the relay
    ///   client earns write interest exactly when its outbuf is non-empty.
    ///
    /// An absent socket is an absent socket; it can't end up in either set.
    pub fn interest_plan(&self) -> InterestPlan {
        let mut plan = InterestPlan::default();
        plan.read.push(MOTHER_TOKEN);

        if let Some(bridge) = &self.bridge {
            if bridge.has_listener() {
                plan.read.push(BRIDGE_SERVER_TOKEN);
            }
            if bridge.client.is_some() {
                plan.read.push(BRIDGE_CLIENT_TOKEN);
                if bridge.outbuf_len() > 0 {
                    plan.write.push(BRIDGE_CLIENT_TOKEN);
                }
            }
        }

        if let Some(health) = &self.health {
            plan.read.push(HEALTH_TOKEN);
            for conn in health.conns() {
                plan.read.push(conn.token);
                if conn.pending_output() > 0 {
                    plan.write.push(conn.token);
                }
            }
        }

        for session in &self.sessions {
            plan.read.push(session.token);
            if session.wants_write() {
                plan.write.push(session.token);
            }
        }

        plan
    }

    /// Run until the shutdown flag goes up, then say goodbye.
    pub fn run(&mut self) -> Result<()> {
        info!("bindweed listening on {}", self.mother.local_addr()?);
        if let Some(addr) = self.bridge_addr() {
            info!("Relay bridge on {}", addr);
        }
        if let Some(addr) = self.health_addr() {
            info!("Health endpoint on http://{}/health", addr);
        }

        while !self.shutdown.load(Ordering::Relaxed) {
            self.tick()?;
        }

        info!("Shutting down with {} session(s) connected", self.sessions.len());
        let cap = self.config.max_session_outbuf;
        for session in self.sessions.iter_mut() {
            session.queue_line("The world is closing down now.  Goodbye.", cap);
            session.write_ready();
        }
        Ok(())
    }

    /// One trip around the loop.  Public so tests (and anyone embedding the
    /// loop) can step it deterministically.
    pub fn tick(&mut self) -> Result<()> {
        self.sync_interests()?;

        let timeout = Duration::from_millis(self.config.tick_ms);
        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            // A signal landing mid-poll shows up as EINTR; the flag check in
            // run() is the place that deals with whatever the signal meant.
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e.into());
        }

        let mut ready = Readiness::default();
        for event in self.events.iter() {
            let token = event.token();
            if token == MOTHER_TOKEN {
                ready.mother = true;
            } else if token == BRIDGE_SERVER_TOKEN {
                ready.bridge_server = true;
            } else if token == BRIDGE_CLIENT_TOKEN {
                if event.is_readable() {
                    ready.bridge_client_read = true;
                }
                if event.is_writable() {
                    ready.bridge_client_write = true;
                }
            } else if token == HEALTH_TOKEN {
                ready.health_server = true;
            } else {
                ready
                    .dynamic
                    .push((token, event.is_readable(), event.is_writable()));
            }
        }

        self.dispatch(&ready);
        Ok(())
    }

    // The fixed-order servicing pass.  Don't shuffle this: new game
    // connections are always in the world before any relay traffic lands,
    // relay input always lands before relay output leaves, and the reap
    // always runs last so everything flagged mid-tick goes out together.
    fn dispatch(&mut self, ready: &Readiness) {
        let now = Instant::now();

        if ready.mother {
            if let Err(e) = self.accept_sessions() {
                error!("The mother socket failed: {}", e);
                self.shutdown.store(true, Ordering::Relaxed);
            }
        }

        let mut fresh_relay = false;
        if ready.bridge_server {
            fresh_relay = self.bridge_accept(now);
        }
        // A relay accepted this tick was never polled, so any client
        // readiness we're holding belongs to its predecessor.
        if !fresh_relay {
            if ready.bridge_client_read {
                self.bridge_input(now);
            }
            if ready.bridge_client_write {
                self.bridge_output();
            }
        }

        if ready.health_server {
            self.health_accept();
        }

        for &(token, readable, writable) in &ready.dynamic {
            self.service_dynamic(token, readable, writable);
        }

        if let Some(bridge) = self.bridge.as_mut() {
            bridge.check_timers(now);
        }
        self.reap();
    }

    fn sync_interests(&mut self) -> Result<()> {
        let registry = self.poll.registry();
        for session in self.sessions.iter_mut() {
            let desired = session.desired_interest();
            if desired != session.registered_interest {
                registry.reregister(&mut session.stream, session.token, desired)?;
                session.registered_interest = desired;
            }
        }
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.sync_interests(registry)?;
        }
        if let Some(health) = self.health.as_mut() {
            health.sync_interests(registry)?;
        }
        Ok(())
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn accept_sessions(&mut self) -> Result<()> {
        loop {
            match self.mother.accept() {
                Ok((mut stream, addr)) => {
                    if self.sessions.len() >= self.config.max_sessions {
                        info!("Turning away {}: the server is full", addr);
                        let _ = std::io::Write::write_all(
                            &mut stream,
                            b"Sorry, the server is full right now.\r\n",
                        );
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("set_nodelay for {}: {}", addr, e);
                    }
                    let token = self.alloc_token();
                    self.poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)?;

                    let mut session = Session::new(token, stream, addr);
                    info!("Session {} connected from {}", session.name, addr);
                    let cap = self.config.max_session_outbuf;
                    session.queue_line(
                        &format!("Welcome to bindweed.  You are {}.", session.name),
                        cap,
                    );
                    session.queue_line(
                        &format!(
                            "Channels here: {}.  Try: name <who>, join <channel>, <channel> <text>, who, quit.",
                            self.config.channels.join(", ")
                        ),
                        cap,
                    );
                    self.sessions.push(session);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e)
                    if e.kind() == ErrorKind::ConnectionAborted
                        || e.kind() == ErrorKind::ConnectionReset =>
                {
                    warn!("Transient accept error: {}", e);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn bridge_accept(&mut self, now: Instant) -> bool {
        let registry = self.poll.registry();
        match self.bridge.as_mut() {
            Some(bridge) => bridge.accept_one(registry, now),
            None => false,
        }
    }

    fn bridge_input(&mut self, now: Instant) {
        let inbound = {
            let channels = &self.config.channels;
            let max_len = self.config.max_message_len;
            match self.bridge.as_mut() {
                Some(bridge) => bridge.service_input(now, channels, max_len),
                None => Vec::new(),
            }
        };

        for msg in inbound {
            self.stats.inbound += 1;
            let line = if msg.emoted.unwrap_or(0) != 0 {
                format!("[{}] {}", msg.channel, msg.message)
            } else {
                format!("[{}] {}: {}", msg.channel, msg.name, msg.message)
            };
            self.broadcast_line(&msg.channel, &line, None);
        }
    }

    fn bridge_output(&mut self) {
        if let Some(bridge) = self.bridge.as_mut() {
            bridge.service_output();
        }
    }

    fn health_accept(&mut self) {
        let registry = self.poll.registry();
        if let Some(health) = self.health.as_mut() {
            health.accept_ready(registry, &mut self.next_token);
        }
    }

    fn service_dynamic(&mut self, token: Token, readable: bool, writable: bool) {
        if self.sessions.iter().any(|s| s.token == token) {
            if readable {
                let lines = match self.session_mut(token) {
                    Some(session) if !session.close_pending => session.read_ready(),
                    _ => Vec::new(),
                };
                for line in lines {
                    let still_open = self
                        .session(token)
                        .map(|s| !s.close_pending)
                        .unwrap_or(false);
                    if !still_open {
                        break;
                    }
                    self.handle_session_line(token, &line);
                }
            }
            if writable {
                if let Some(session) = self.session_mut(token) {
                    session.write_ready();
                }
            }
        } else {
            let snapshot = self.snapshot();
            if let Some(health) = self.health.as_mut() {
                health.service(token, readable, writable, &snapshot);
            }
        }
    }

    fn handle_session_line(&mut self, token: Token, line: &str) {
        match Command::parse(line) {
            Command::Empty => {}
            Command::Name(name) => self.cmd_name(token, &name),
            Command::Join(channel) => self.cmd_join(token, &channel),
            Command::Leave(channel) => self.cmd_leave(token, &channel),
            Command::Emote { channel, text } => self.cmd_chat(token, &channel, &text, true),
            Command::Chat { channel, text } => self.cmd_chat(token, &channel, &text, false),
            Command::Who => self.cmd_who(token),
            Command::Quit => self.cmd_quit(token),
            Command::Huh => self.send_line(token, "Huh?"),
        }
    }

    fn cmd_name(&mut self, token: Token, name: &str) {
        let name = utils::scrub(name);
        if name.is_empty() || name.chars().count() > 24 || name.contains(char::is_whitespace) {
            self.send_line(token, "That name won't work.");
            return;
        }
        if let Some(session) = self.session_mut(token) {
            session.name = name.clone();
        }
        self.send_line(token, &format!("You are now known as {}.", name));
    }

    fn cmd_join(&mut self, token: Token, channel: &str) {
        if !self.config.channels.iter().any(|c| c == channel) {
            self.send_line(token, "No such channel.");
            return;
        }
        let (name, newly) = match self.session_mut(token) {
            Some(session) => (
                session.name.clone(),
                session.channels.insert(channel.to_string()),
            ),
            None => return,
        };
        if !newly {
            self.send_line(token, &format!("You're already on {}.", channel));
            return;
        }
        self.send_line(token, &format!("You join {}.", channel));
        self.broadcast_line(
            channel,
            &format!("[{}] {} has joined the channel.", channel, name),
            Some(token),
        );
    }

    fn cmd_leave(&mut self, token: Token, channel: &str) {
        let (name, was_on) = match self.session_mut(token) {
            Some(session) => (session.name.clone(), session.channels.remove(channel)),
            None => return,
        };
        if !was_on {
            self.send_line(token, &format!("You're not on {}.", channel));
            return;
        }
        self.send_line(token, &format!("You leave {}.", channel));
        self.broadcast_line(
            channel,
            &format!("[{}] {} has left the channel.", channel, name),
            Some(token),
        );
    }

    fn cmd_chat(&mut self, token: Token, channel: &str, text: &str, emote: bool) {
        if !self.config.channels.iter().any(|c| c == channel) {
            self.send_line(token, "Huh?");
            return;
        }
        let (name, joined) = match self.session(token) {
            Some(session) => (session.name.clone(), session.channels.contains(channel)),
            None => return,
        };
        if !joined {
            self.send_line(
                token,
                &format!("You're not on {}.  (Try: join {})", channel, channel),
            );
            return;
        }
        let text = utils::scrub(text);
        if text.is_empty() {
            return;
        }
        if text.chars().count() > self.config.max_message_len {
            self.send_line(token, "That's too long.");
            return;
        }

        let (game_line, relay_msg) = if emote {
            let acted = format!("{} {}", name, text);
            (
                format!("[{}] {}", channel, acted),
                RelayMessage::emote(channel, &name, &acted),
            )
        } else {
            (
                format!("[{}] {}: {}", channel, name, text),
                RelayMessage::chat(channel, &name, &text),
            )
        };

        self.broadcast_line(channel, &game_line, None);
        self.relay_out(&relay_msg);
    }

    fn cmd_who(&mut self, token: Token) {
        let mut lines = vec![format!("{} connected:", self.sessions.len())];
        for session in &self.sessions {
            let channels = if session.channels.is_empty() {
                "no channels".to_string()
            } else {
                session
                    .channels
                    .iter()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            lines.push(format!("  {} ({})", session.name, channels));
        }
        for line in lines {
            self.send_line(token, &line);
        }
    }

    fn cmd_quit(&mut self, token: Token) {
        self.send_line(token, "Goodbye.");
        if let Some(session) = self.session_mut(token) {
            session.close_pending = true;
        }
    }

    fn send_line(&mut self, token: Token, line: &str) {
        let cap = self.config.max_session_outbuf;
        if let Some(session) = self.session_mut(token) {
            session.queue_line(line, cap);
        }
    }

    /// Hand a line to everyone on a channel.
    fn broadcast_line(&mut self, channel: &str, line: &str, exclude: Option<Token>) {
        let cap = self.config.max_session_outbuf;
        for session in self.sessions.iter_mut() {
            if Some(session.token) == exclude {
                continue;
            }
            if session.channels.contains(channel) {
                session.queue_line(line, cap);
            }
        }
    }

    fn relay_out(&mut self, msg: &RelayMessage) {
        if let Some(bridge) = self.bridge.as_mut() {
            if bridge.queue(msg) {
                self.stats.outbound += 1;
            }
        }
    }

    fn snapshot(&self) -> Snapshot {
        let bridge_connected = self.bridge_connected();
        Snapshot {
            // With no bridge configured there's nothing to be unhealthy
            // about; with one, health means the relay is actually here.
            healthy: self.bridge.is_none() || bridge_connected,
            uptime_secs: self.stats.started.elapsed().as_secs(),
            players: self.sessions.len(),
            bridge_connected,
            inbound: self.stats.inbound,
            outbound: self.stats.outbound,
        }
    }

    fn session(&self, token: Token) -> Option<&Session> {
        self.sessions.iter().find(|s| s.token == token)
    }

    fn session_mut(&mut self, token: Token) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.token == token)
    }

    // The mark-then-compact pass.  Everything above only ever sets
    // close_pending; this is the one place connections actually go away.
    fn reap(&mut self) {
        let registry = self.poll.registry();

        if let Some(bridge) = self.bridge.as_mut() {
            bridge.reap(registry);
        }
        if let Some(health) = self.health.as_mut() {
            health.reap(registry);
        }

        for session in self.sessions.iter_mut().filter(|s| s.close_pending) {
            // One last best-effort flush so a Goodbye actually arrives.
            session.write_ready();
            if let Err(e) = registry.deregister(&mut session.stream) {
                debug!("Deregistering {}: {}", session.addr, e);
            }
            info!("Session {} from {} closed", session.name, session.addr);
        }
        self.sessions.retain(|s| !s.close_pending);
    }
}

fn parse_addr(addr: &str) -> Result<SocketAddr> {
    addr.parse().map_err(|e| CommError::Address {
        addr: addr.to_string(),
        reason: format!("{}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;

    fn test_config() -> Config {
        let mut config = Config::default();
        config.listen_addr = "127.0.0.1:0".to_string();
        config.tick_ms = 10;
        config
    }

    fn new_loop(config: Config) -> GameLoop {
        GameLoop::new(config, Arc::new(AtomicBool::new(false))).expect("couldn't build the loop")
    }

    #[test]
    fn no_bridge_means_no_bridge_tokens_anywhere() {
        let mut game = new_loop(test_config());
        for _ in 0..3 {
            game.tick().expect("tick");
        }
        let plan = game.interest_plan();
        assert!(plan.read.contains(&MOTHER_TOKEN));
        assert!(!plan.read.contains(&BRIDGE_SERVER_TOKEN));
        assert!(!plan.read.contains(&BRIDGE_CLIENT_TOKEN));
        assert!(!plan.write.contains(&BRIDGE_CLIENT_TOKEN));
    }

    #[test]
    fn unconnected_bridge_watches_only_its_listener() {
        let mut config = test_config();
        config.bridge = Some(BridgeConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..BridgeConfig::default()
        });
        let game = new_loop(config);

        let plan = game.interest_plan();
        assert!(plan.read.contains(&BRIDGE_SERVER_TOKEN));
        // No client socket exists, so it can't be in either set.
        assert!(!plan.read.contains(&BRIDGE_CLIENT_TOKEN));
        assert!(!plan.write.contains(&BRIDGE_CLIENT_TOKEN));
    }

    #[test]
    fn health_listener_appears_in_the_plan() {
        let mut config = test_config();
        config.health_addr = Some("127.0.0.1:0".to_string());
        let game = new_loop(config);
        assert!(game.interest_plan().read.contains(&HEALTH_TOKEN));
    }
}
