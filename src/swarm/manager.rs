//! The I/O loop: one thread multiplexing every connection's socket.
//!
//! [`ConnectionManager`] owns the registry outright. Everything outside the
//! loop thread talks to it through a [`ManagerHandle`], whose commands are
//! queued on a channel and applied at the top of each loop iteration, so no
//! registry state is ever shared across threads.
//!
//! One iteration:
//!
//! 1. apply queued commands (new connections, outbound lines, summaries);
//! 2. wait for readiness, bounded by the poll timeout;
//! 3. drain every readable socket, dispatching each decoded line, and flush
//!    every writable one;
//! 4. ping idle connections and drop expired ones;
//! 5. flush whatever is still queued and keep write interest registered
//!    exactly while output is pending.
//!
//! Readiness is edge-triggered, so reads and writes always continue until
//! the socket reports `WouldBlock`.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use mio::net::TcpStream;
use mio::{Events, Interest, Poll, Token, Waker};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::LivenessPolicy;
use crate::events::EventBus;
use crate::irc::connection::{Connection, ConnectionId, Liveness};
use crate::irc::dispatch::Dispatcher;

/// Readiness token reserved for cross-thread wakeups.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// Token carried by keepalive pings.
const KEEPALIVE_TOKEN: &str = "hello";

const EVENT_CAPACITY: usize = 1024;

/// A request for the I/O loop.
#[derive(Debug)]
pub enum Command {
    /// Register a connected, identified connection.
    Add(Connection<TcpStream>),
    /// Queue a raw line on every connection.
    Broadcast(String),
    /// Queue a raw line on one connection.
    SendTo(ConnectionId, String),
    /// Report every connection's summary line, in id order.
    Summary(oneshot::Sender<Vec<String>>),
}

#[derive(Debug, thiserror::Error)]
#[error("connection manager has stopped")]
pub struct ManagerClosed;

/// Cloneable, thread-safe front for a running [`ConnectionManager`].
#[derive(Debug, Clone)]
pub struct ManagerHandle {
    tx: mpsc::UnboundedSender<Command>,
    waker: Arc<Waker>,
    count: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
}

impl ManagerHandle {
    fn submit(&self, command: Command) -> Result<(), ManagerClosed> {
        self.tx.send(command).map_err(|_| ManagerClosed)?;
        // A failed wake only delays the command until the next poll timeout.
        if let Err(e) = self.waker.wake() {
            debug!("manager: wake failed: {e}");
        }
        Ok(())
    }

    /// Hand a connection to the loop. It counts toward [`len`](Self::len)
    /// from this moment on.
    pub fn add(&self, conn: Connection<TcpStream>) -> Result<(), ManagerClosed> {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.submit(Command::Add(conn)).inspect_err(|_| {
            self.count.fetch_sub(1, Ordering::SeqCst);
        })
    }

    pub fn broadcast(&self, line: &str) -> Result<(), ManagerClosed> {
        self.submit(Command::Broadcast(line.to_owned()))
    }

    pub fn send_to(&self, id: ConnectionId, line: &str) -> Result<(), ManagerClosed> {
        self.submit(Command::SendTo(id, line.to_owned()))
    }

    /// Summaries of every live connection, fetched from the loop thread.
    pub async fn summary(&self) -> Result<Vec<String>, ManagerClosed> {
        let (tx, rx) = oneshot::channel();
        self.submit(Command::Summary(tx))?;
        rx.await.map_err(|_| ManagerClosed)
    }

    /// Live connections, including ones submitted but not yet registered.
    pub fn len(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Ask the loop to exit after its current iteration.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

#[derive(Debug)]
struct Entry {
    conn: Connection<TcpStream>,
    write_interest: bool,
}

/// Interest a connection needs: always readable, writable while output waits.
fn interest_for(pending_output: bool) -> Interest {
    if pending_output {
        Interest::READABLE | Interest::WRITABLE
    } else {
        Interest::READABLE
    }
}

/// Why a connection left the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Removal {
    Closed,
    Failed,
    Expired,
}

pub struct ConnectionManager {
    poll: Poll,
    entries: HashMap<Token, Entry>,
    next_id: ConnectionId,
    commands: mpsc::UnboundedReceiver<Command>,
    bus: EventBus,
    dispatcher: Dispatcher<TcpStream>,
    liveness: LivenessPolicy,
    running: Arc<AtomicBool>,
    count: Arc<AtomicUsize>,
}

impl ConnectionManager {
    /// Build a manager and the handle that controls it. The loop does not
    /// run until [`start`](Self::start) or [`run`](Self::run).
    pub fn new(
        bus: EventBus,
        dispatcher: Dispatcher<TcpStream>,
        liveness: LivenessPolicy,
        running: Arc<AtomicBool>,
    ) -> io::Result<(Self, ManagerHandle)> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        let (tx, commands) = mpsc::unbounded_channel();
        let count = Arc::new(AtomicUsize::new(0));

        let handle = ManagerHandle {
            tx,
            waker,
            count: Arc::clone(&count),
            running: Arc::clone(&running),
        };
        let manager = Self {
            poll,
            entries: HashMap::new(),
            next_id: 0,
            commands,
            bus,
            dispatcher,
            liveness,
            running,
            count,
        };
        Ok((manager, handle))
    }

    /// Subscribe to protocol events before the loop starts.
    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.bus
    }

    /// Registered connections (excludes ones still in the command queue).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the loop on its own thread.
    pub fn start(self) -> io::Result<JoinHandle<io::Result<()>>> {
        std::thread::Builder::new()
            .name("io-loop".into())
            .spawn(move || self.run())
    }

    /// Run the loop on the calling thread until the running flag clears.
    pub fn run(mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENT_CAPACITY);
        info!("manager: I/O loop started");

        while self.running.load(Ordering::SeqCst) {
            self.process_commands();

            match self.poll.poll(&mut events, Some(self.liveness.poll_timeout)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            for event in events.iter() {
                let token = event.token();
                if token == WAKE_TOKEN {
                    continue;
                }
                if event.is_readable() || event.is_read_closed() {
                    if let Err(removal) = self.service_read(token) {
                        self.remove(token, removal);
                        continue;
                    }
                }
                if event.is_error() {
                    self.remove(token, Removal::Failed);
                    continue;
                }
                if event.is_writable() {
                    if let Err(removal) = self.service_write(token) {
                        self.remove(token, removal);
                    }
                }
            }

            self.check_liveness(Instant::now());
            self.update_interest();
        }

        self.shutdown();
        info!("manager: I/O loop stopped");
        Ok(())
    }

    /// Apply every queued command.
    pub fn process_commands(&mut self) {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::Add(conn) => self.register(conn),
                Command::Broadcast(line) => {
                    for entry in self.entries.values_mut() {
                        entry.conn.queue_send(&line);
                    }
                }
                Command::SendTo(id, line) => match self.entries.get_mut(&Token(id)) {
                    Some(entry) => entry.conn.queue_send(&line),
                    None => debug!(connection = id, "manager: send to unknown connection dropped"),
                },
                Command::Summary(reply) => {
                    let mut ids: Vec<&Token> = self.entries.keys().collect();
                    ids.sort();
                    let lines = ids.into_iter().map(|t| self.entries[t].conn.summary()).collect();
                    let _ = reply.send(lines);
                }
            }
        }
    }

    fn register(&mut self, mut conn: Connection<TcpStream>) {
        let token = Token(self.next_id);
        self.next_id += 1;

        let write_interest = conn.has_pending_output();
        let interest = interest_for(write_interest);
        if let Err(e) = self.poll.registry().register(conn.stream_mut(), token, interest) {
            warn!(connection = token.0, "manager: register failed: {e}");
            self.count.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        debug!(connection = token.0, nickname = %conn.nickname, "manager: connection registered");
        self.entries.insert(token, Entry { conn, write_interest });
    }

    /// Drain the socket, dispatching every decoded line.
    fn service_read(&mut self, token: Token) -> Result<(), Removal> {
        let Some(entry) = self.entries.get_mut(&token) else {
            return Ok(());
        };
        loop {
            match entry.conn.read_available() {
                Ok(Some(lines)) => {
                    for line in lines {
                        if let Err(e) =
                            self.dispatcher.dispatch(&line, token.0, &mut entry.conn, &mut self.bus)
                        {
                            debug!(connection = token.0, "manager: unhandled line {line:?}: {e}");
                        }
                    }
                }
                Ok(None) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(Removal::Closed),
                Err(e) => {
                    debug!(connection = token.0, "manager: read failed: {e}");
                    return Err(Removal::Failed);
                }
            }
        }
    }

    fn service_write(&mut self, token: Token) -> Result<(), Removal> {
        match self.entries.get_mut(&token) {
            Some(entry) => flush_until_blocked(token, &mut entry.conn),
            None => Ok(()),
        }
    }

    /// Ping idle connections; drop ones past the hard limit.
    fn check_liveness(&mut self, now: Instant) {
        let mut expired = Vec::new();
        for (token, entry) in &mut self.entries {
            match entry.conn.liveness(now, &self.liveness) {
                Liveness::Alive => {}
                Liveness::NeedsPing => {
                    debug!(connection = token.0, "manager: idle, sending keepalive");
                    entry.conn.send_ping(KEEPALIVE_TOKEN);
                }
                Liveness::Expired => expired.push(*token),
            }
        }
        for token in expired {
            self.remove(token, Removal::Expired);
        }
    }

    /// Flush pending output and keep write interest in step with it.
    fn update_interest(&mut self) {
        let mut failed = Vec::new();
        let registry = self.poll.registry();
        for (token, entry) in &mut self.entries {
            if entry.conn.has_pending_output() && flush_until_blocked(*token, &mut entry.conn).is_err() {
                failed.push(*token);
                continue;
            }
            let wanted = entry.conn.has_pending_output();
            if wanted != entry.write_interest {
                match registry.reregister(entry.conn.stream_mut(), *token, interest_for(wanted)) {
                    Ok(()) => entry.write_interest = wanted,
                    Err(e) => {
                        debug!(connection = token.0, "manager: reregister failed: {e}");
                        failed.push(*token);
                    }
                }
            }
        }
        for token in failed {
            self.remove(token, Removal::Failed);
        }
    }

    fn remove(&mut self, token: Token, reason: Removal) {
        let Some(mut entry) = self.entries.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(entry.conn.stream_mut());
        self.count.fetch_sub(1, Ordering::SeqCst);
        match reason {
            Removal::Expired => {
                info!(connection = token.0, nickname = %entry.conn.nickname, "manager: connection timed out")
            }
            Removal::Closed | Removal::Failed => {
                info!(connection = token.0, nickname = %entry.conn.nickname, ?reason, "manager: connection lost")
            }
        }
    }

    /// Say goodbye on every connection and release them.
    fn shutdown(&mut self) {
        let tokens: Vec<Token> = self.entries.keys().copied().collect();
        for token in tokens {
            if let Some(entry) = self.entries.get_mut(&token) {
                entry.conn.send_quit("shutting down");
                let _ = flush_until_blocked(token, &mut entry.conn);
            }
            self.remove(token, Removal::Closed);
        }

        // Adds that never reached the registry still hold a slot in `count`.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Add(mut conn) = command {
                conn.send_quit("shutting down");
                let _ = flush_until_blocked(Token(self.next_id), &mut conn);
                self.count.fetch_sub(1, Ordering::SeqCst);
                debug!(nickname = %conn.nickname, "manager: queued connection released");
            }
        }
    }
}

/// Write until the buffer empties or the socket would block.
fn flush_until_blocked(token: Token, conn: &mut Connection<TcpStream>) -> Result<(), Removal> {
    while conn.has_pending_output() {
        match conn.flush() {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => {
                debug!(connection = token.0, "manager: write failed: {e}");
                return Err(Removal::Failed);
            }
        }
    }
    Ok(())
}
