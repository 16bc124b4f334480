//! A point-to-point data-link engine: framing with byte stuffing and
//! CRC-16-CCITT, a modulo-16 sliding window with retransmission on timeout,
//! and a heartbeat-supervised connection lifecycle, turning a lossy byte
//! channel into an in-order, duplicate-free stream between two peers.
//!
//! The physical layer is abstract: install a transmit hook with
//! [`DataLink::set_tx`] and feed inbound frames to [`DataLink::rx`].
//! Everything the engine reports upward arrives on the [`Event`] stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

mod err;
pub use err::*;

pub mod link;
pub use link::{
    Config, DisconnectReason, Event, FrameErrorKind, FrameType, LinkState, Stats, MAX_DATA,
    MAX_WINDOW, SEQ_MOD,
};

use link::{Engine, SendStatus};

/// Engine tick period; retransmission and heartbeat deadlines are checked at
/// this granularity.
const TICK: Duration = Duration::from_millis(10);
/// Slack on caller-side waits so the tick thread always times out first.
const WAIT_SLACK: Duration = Duration::from_millis(500);

type TxHook = Box<dyn FnMut(&[u8]) + Send>;

struct Shared {
    engine: Mutex<Engine>,
    tx: Mutex<Option<TxHook>>,
    conn_var: Condvar,
    send_var: Condvar,
    shutdown: AtomicBool,
}

impl Shared {
    /// Pushes everything the engine queued onto the wire and wakes blocked
    /// callers. Neither lock is held while the hook runs, so a loopback peer
    /// may call straight back into `rx` on this thread; frames emitted while
    /// the hook is busy up-stack are parked and picked up by the enclosing
    /// flush or the next tick.
    fn flush(&self) {
        loop {
            let frames = self.engine.lock().unwrap().take_outbox();
            if frames.is_empty() {
                break;
            }

            let hook = self.tx.lock().unwrap().take();
            match hook {
                Some(mut hook) => {
                    for frame in &frames {
                        hook(frame);
                    }
                    *self.tx.lock().unwrap() = Some(hook);
                }
                None => {
                    trace!("tx hook missing or busy; parking {} frames", frames.len());
                    self.engine.lock().unwrap().requeue_outbox(frames);
                    break;
                }
            }
        }
        self.conn_var.notify_all();
        self.send_var.notify_all();
    }
}

/// One peer of the link. Not `Clone`: wrap it in an [`Arc`] to share it
/// between the physical-layer reader and the application.
pub struct DataLink {
    shared: Arc<Shared>,
    events: Mutex<Option<Receiver<Event>>>,
    ticker: Option<thread::JoinHandle<()>>,
}

impl DataLink {
    pub fn new(config: Config) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            engine: Mutex::new(Engine::new(config, events_tx, Instant::now())),
            tx: Mutex::new(None),
            conn_var: Condvar::new(),
            send_var: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });

        let ticker = {
            let shared = shared.clone();
            thread::spawn(move || {
                while !shared.shutdown.load(Ordering::Acquire) {
                    thread::sleep(TICK);
                    shared.engine.lock().unwrap().on_tick(Instant::now());
                    shared.flush();
                }
            })
        };

        DataLink {
            shared,
            events: Mutex::new(Some(events_rx)),
            ticker: Some(ticker),
        }
    }

    /// The event stream. There is a single subscriber: the first call takes
    /// the receiver, later calls return `None`.
    pub fn take_events(&self) -> Option<Receiver<Event>> {
        self.events.lock().unwrap().take()
    }

    /// Installs the physical-layer transmit hook. Set once, before the link
    /// comes up.
    pub fn set_tx<F>(&self, hook: F) -> Result<(), Error>
    where
        F: FnMut(&[u8]) + Send + 'static,
    {
        let mut tx = self.shared.tx.lock().unwrap();
        if tx.is_some() {
            return Err(Error::TxHookInstalled);
        }
        *tx = Some(Box::new(hook));
        Ok(())
    }

    /// Physical-layer upcall: one frame worth of (possibly damaged) bytes.
    pub fn rx(&self, bytes: &[u8]) {
        self.shared
            .engine
            .lock()
            .unwrap()
            .on_rx(bytes, Instant::now());
        self.shared.flush();
    }

    pub fn state(&self) -> LinkState {
        self.shared.engine.lock().unwrap().state()
    }

    pub fn stats(&self) -> Stats {
        self.shared.engine.lock().unwrap().stats()
    }

    /// Active open. Blocks until the handshake completes or the connection
    /// timeout expires.
    pub fn connect(&self) -> Result<(), Error> {
        self.require_tx()?;
        let timeout = {
            let mut engine = self.shared.engine.lock().unwrap();
            engine.start_connect(Instant::now())?;
            engine.config().connect_timeout
        };
        self.shared.flush();

        let engine = self.shared.engine.lock().unwrap();
        let (engine, _) = self
            .shared
            .conn_var
            .wait_timeout_while(engine, timeout + WAIT_SLACK, |engine| {
                engine.state() == LinkState::Connecting
            })
            .unwrap();
        match engine.state() {
            LinkState::Connected => Ok(()),
            _ => Err(Error::ConnectionTimeout),
        }
    }

    /// Answers a surfaced [`Event::ConnectionRequest`]. Returns whether the
    /// link came up.
    pub fn accept(&self, remote_seq: u8) -> bool {
        if self.require_tx().is_err() {
            return false;
        }
        let accepted = self
            .shared
            .engine
            .lock()
            .unwrap()
            .accept(remote_seq, Instant::now());
        self.shared.flush();
        accepted
    }

    /// Graceful close. Blocks for the DISC_ACK round trip, forcing the local
    /// teardown after the disconnect timeout; never fails on a link that is
    /// already down.
    pub fn disconnect(&self) -> Result<(), Error> {
        let (wait, timeout) = {
            let mut engine = self.shared.engine.lock().unwrap();
            (
                engine.start_disconnect(Instant::now()),
                engine.config().disconnect_timeout,
            )
        };
        self.shared.flush();
        if !wait {
            return Ok(());
        }

        let engine = self.shared.engine.lock().unwrap();
        let _ = self
            .shared
            .conn_var
            .wait_timeout_while(engine, timeout + WAIT_SLACK, |engine| {
                engine.state() == LinkState::Disconnecting
            })
            .unwrap();
        Ok(())
    }

    /// Queues `payload` and blocks until it has been framed and handed to
    /// the physical layer -- not until it is acknowledged. A frame that
    /// later exhausts its retries surfaces as [`Event::TransmissionFailed`].
    pub fn send(&self, payload: &[u8]) -> Result<(), Error> {
        self.require_tx()?;
        let ticket = self
            .shared
            .engine
            .lock()
            .unwrap()
            .queue_send(payload.to_vec(), Instant::now())?;
        self.shared.flush();

        let mut engine = self.shared.engine.lock().unwrap();
        loop {
            if let Some(status) = engine.take_status(ticket) {
                return match status {
                    SendStatus::Dispatched => Ok(()),
                    SendStatus::Rejected => Err(Error::Disconnected),
                };
            }
            engine = self.shared.send_var.wait(engine).unwrap();
        }
    }

    fn require_tx(&self) -> Result<(), Error> {
        if self.shared.tx.lock().unwrap().is_some() {
            Ok(())
        } else {
            Err(Error::TxHookMissing)
        }
    }
}

impl Drop for DataLink {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
    }
}
