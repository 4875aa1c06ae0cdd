//! Single-threaded, edge-triggered I/O readiness reactor.
//!
//! One background thread owns an [`mio::Poll`] instance; every other thread
//! reaches it through an `mpsc` control channel paired with a [`mio::Waker`]
//! so a registration is never stuck longer than one bounded poll wait. This
//! is the process-wide singleton described in §4.2 — construct one with
//! [`Reactor::start`] and pass it down explicitly, never lazily.

use crate::error::ReactorError;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub mod events {
    pub const READABLE: u32 = 0b01;
    pub const WRITABLE: u32 = 0b10;
}

const WAKE_TOKEN: Token = Token(usize::MAX);
const POLL_TIMEOUT_MS: u64 = 100;
const POLL_SIZE: usize = 32;

pub type Callback = Box<dyn Fn(u32) + Send + Sync>;

pub struct PollRequest {
    pub fd: RawFd,
    pub events: u32,
    pub timeout_ms: i64,
    pub callback: Callback,
}

enum Command {
    Register(PollRequest),
    Unregister(RawFd),
    Shutdown,
}

struct Registration {
    fd: RawFd,
    deadline: Option<Instant>,
    callback: Callback,
}

/// Process-wide readiness multiplexer. Cheap to clone (it's a thin handle);
/// construct exactly one and share it by reference.
pub struct Reactor {
    tx: mpsc::Sender<Command>,
    waker: Arc<Waker>,
    known_fds: Arc<Mutex<std::collections::HashSet<RawFd>>>,
    shutdown: Arc<AtomicBool>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub fn start() -> Result<Self, ReactorError> {
        let poll = Poll::new().map_err(ReactorError::Poll)?;
        let waker =
            Arc::new(Waker::new(poll.registry(), WAKE_TOKEN).map_err(ReactorError::Waker)?);
        let (tx, rx) = mpsc::channel::<Command>();
        let shutdown = Arc::new(AtomicBool::new(false));
        let known_fds = Arc::new(Mutex::new(std::collections::HashSet::new()));

        let loop_shutdown = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("reactor".into())
            .spawn(move || {
                tracing::info!("reactor thread started");
                run_loop(poll, rx, loop_shutdown);
                tracing::info!("reactor thread exiting");
            })
            .map_err(ReactorError::Spawn)?;

        Ok(Reactor {
            tx,
            waker,
            known_fds,
            shutdown,
            join: Mutex::new(Some(join)),
        })
    }

    /// `timeout_ms == 0` fires immediately on the reactor thread without
    /// ever touching the readiness set; `< 0` registers permanently;
    /// `> 0` registers with a deadline and auto-unregisters on expiry.
    pub fn register(&self, fd: RawFd, events: u32, timeout_ms: i64, callback: Callback) -> bool {
        if fd < 0 || self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        if timeout_ms != 0 {
            self.known_fds.lock().expect("poisoned").insert(fd);
        }
        let sent = self
            .tx
            .send(Command::Register(PollRequest {
                fd,
                events,
                timeout_ms,
                callback,
            }))
            .is_ok();
        if !sent {
            self.known_fds.lock().expect("poisoned").remove(&fd);
            return false;
        }
        let _ = self.waker.wake();
        true
    }

    pub fn unregister(&self, fd: RawFd) -> bool {
        if fd < 0 || self.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        {
            let mut known = self.known_fds.lock().expect("poisoned");
            if !known.remove(&fd) {
                return false;
            }
        }
        let sent = self.tx.send(Command::Unregister(fd)).is_ok();
        let _ = self.waker.wake();
        sent
    }

    /// Idempotent: sets the flag, nudges the reactor thread, joins it.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.tx.send(Command::Shutdown);
        let _ = self.waker.wake();
        if let Some(handle) = self.join.lock().expect("poisoned").take() {
            let _ = handle.join();
        }
    }
}

fn run_loop(mut poll: Poll, rx: mpsc::Receiver<Command>, shutdown: Arc<AtomicBool>) {
    let mut events = Events::with_capacity(POLL_SIZE);
    let mut registrations: HashMap<Token, Registration> = HashMap::new();
    let mut fd_to_token: HashMap<RawFd, Token> = HashMap::new();
    let mut next_token: usize = 0;

    'outer: loop {
        let wait_timeout = next_deadline(&registrations)
            .map(|d| d.min(Duration::from_millis(POLL_TIMEOUT_MS)))
            .unwrap_or(Duration::from_millis(POLL_TIMEOUT_MS));

        if let Err(e) = poll.poll(&mut events, Some(wait_timeout)) {
            if e.kind() != std::io::ErrorKind::Interrupted {
                tracing::warn!("reactor poll error: {e}");
            }
            continue;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                while let Ok(cmd) = rx.try_recv() {
                    match cmd {
                        Command::Register(req) => {
                            apply_register(
                                &mut poll,
                                &mut registrations,
                                &mut fd_to_token,
                                &mut next_token,
                                req,
                            );
                        }
                        Command::Unregister(fd) => {
                            apply_unregister(&mut poll, &mut registrations, &mut fd_to_token, fd);
                        }
                        Command::Shutdown => {
                            for (_, reg) in registrations.drain() {
                                let mut fd = reg.fd;
                                let _ = poll.registry().deregister(&mut SourceFd(&fd));
                            }
                            break 'outer;
                        }
                    }
                }
                continue;
            }

            if let Some(token_reg) = registrations.get_mut(&event.token()) {
                let mut mask = 0u32;
                if event.is_readable() {
                    mask |= events::READABLE;
                }
                if event.is_writable() {
                    mask |= events::WRITABLE;
                }
                (token_reg.callback)(mask);
                // An observed event satisfies the "fire if idle" contract;
                // stop treating this registration as having a deadline.
                token_reg.deadline = None;
            }
        }

        if shutdown.load(Ordering::SeqCst) {
            for (_, reg) in registrations.drain() {
                let mut fd = reg.fd;
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
            }
            break;
        }

        let now = Instant::now();
        let expired: Vec<Token> = registrations
            .iter()
            .filter(|(_, reg)| reg.deadline.is_some_and(|d| d <= now))
            .map(|(token, _)| *token)
            .collect();

        for token in expired {
            if let Some(reg) = registrations.remove(&token) {
                (reg.callback)(0);
                let mut fd = reg.fd;
                let _ = poll.registry().deregister(&mut SourceFd(&fd));
                fd_to_token.remove(&reg.fd);
            }
        }
    }
}

fn apply_register(
    poll: &mut Poll,
    registrations: &mut HashMap<Token, Registration>,
    fd_to_token: &mut HashMap<RawFd, Token>,
    next_token: &mut usize,
    req: PollRequest,
) {
    if req.timeout_ms == 0 {
        (req.callback)(0);
        return;
    }

    // Replace any prior registration for this fd.
    if let Some(old_token) = fd_to_token.remove(&req.fd) {
        if let Some(old) = registrations.remove(&old_token) {
            let mut fd = old.fd;
            let _ = poll.registry().deregister(&mut SourceFd(&fd));
        }
    }

    let token = Token(*next_token);
    *next_token += 1;

    let mut interest_bits = None;
    if req.events & events::READABLE != 0 {
        interest_bits = Some(Interest::READABLE);
    }
    if req.events & events::WRITABLE != 0 {
        interest_bits = Some(interest_bits.map_or(Interest::WRITABLE, |i| i | Interest::WRITABLE));
    }
    let interest = interest_bits.unwrap_or(Interest::READABLE);

    let mut fd = req.fd;
    if let Err(e) = poll.registry().register(&mut SourceFd(&fd), token, interest) {
        tracing::warn!("reactor: failed to register fd {fd}: {e}");
        return;
    }

    let deadline = if req.timeout_ms > 0 {
        Some(Instant::now() + Duration::from_millis(req.timeout_ms as u64))
    } else {
        None
    };

    fd_to_token.insert(req.fd, token);
    registrations.insert(
        token,
        Registration {
            fd: req.fd,
            deadline,
            callback: req.callback,
        },
    );
}

fn apply_unregister(
    poll: &mut Poll,
    registrations: &mut HashMap<Token, Registration>,
    fd_to_token: &mut HashMap<RawFd, Token>,
    fd: RawFd,
) {
    if let Some(token) = fd_to_token.remove(&fd) {
        if let Some(reg) = registrations.remove(&token) {
            let mut fd = reg.fd;
            let _ = poll.registry().deregister(&mut SourceFd(&fd));
        }
    }
}

fn next_deadline(registrations: &HashMap<Token, Registration>) -> Option<Duration> {
    let now = Instant::now();
    registrations
        .values()
        .filter_map(|reg| reg.deadline)
        .map(|d| d.saturating_duration_since(now))
        .min()
}
