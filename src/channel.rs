//! Client side of the backend pipe: connection lifecycle, request encoding and
//! the per-connection reader thread.

use crate::config::ChannelConfig;
use crate::error::{ConnectError, DisconnectReason, SendError};
use crate::event::ChannelObserver;
use crate::reader::{ReadExit, Reader};
use crate::transport;
use aether_proto::{Event, Request};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One live connection. Dropped once both the channel and the reader thread
/// have let go of it.
struct Link {
    /// Write half; shares the socket with the reader's stream.
    stream: UnixStream,
    write_lock: Mutex<()>,
    cancelled: Arc<AtomicBool>,
    waker: mio::Waker,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Link {
    /// Stop the reader and release the socket. Joins the reader unless called
    /// from the reader thread itself.
    fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        let _ = self.stream.shutdown(Shutdown::Both);
        let _ = self.waker.wake();

        let handle = lock(&self.reader).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("Reader thread panicked");
            }
        }
    }
}

struct Shared {
    state: Mutex<ConnectionState>,
    /// Bumped under the `state` lock whenever a pending connect is abandoned.
    connect_epoch: AtomicU64,
    link: Mutex<Option<Arc<Link>>>,
    observers: RwLock<Vec<Arc<dyn ChannelObserver>>>,
}

impl Shared {
    fn observers(&self) -> Vec<Arc<dyn ChannelObserver>> {
        self.observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn dispatch(&self, event: Event) {
        let observers = self.observers();
        match event {
            Event::ConsoleOutput(line) => {
                for observer in &observers {
                    observer.on_console_output(&line);
                }
            }
            Event::StatusUpdate(status) => {
                for observer in &observers {
                    observer.on_status_update(&status);
                }
            }
            Event::AnalysisResult(result) => {
                for observer in &observers {
                    observer.on_analysis_result(result);
                }
            }
        }
    }

    /// Remove the current link from the channel. With `expected` set, only
    /// that link is removed; a newer connection is left alone.
    fn detach(&self, expected: Option<&Arc<Link>>) -> Option<Arc<Link>> {
        let mut slot = lock(&self.link);
        if let (Some(current), Some(expected)) = (slot.as_ref(), expected) {
            if !Arc::ptr_eq(current, expected) {
                return None;
            }
        }
        let link = slot.take()?;
        *lock(&self.state) = ConnectionState::Disconnected;
        Some(link)
    }

    /// Tear the connection down and tell observers why. Whoever detaches the
    /// link first reports; later callers are no-ops.
    fn end(&self, expected: Option<&Arc<Link>>, reason: DisconnectReason) {
        let Some(link) = self.detach(expected) else {
            return;
        };
        link.close();

        match &reason {
            DisconnectReason::Requested | DisconnectReason::PeerClosed => {
                log::info!("Channel disconnected: {}", reason)
            }
            _ => log::warn!("Channel disconnected: {}", reason),
        }

        let observers = self.observers();
        if let DisconnectReason::Faulted(err) = &reason {
            for observer in &observers {
                observer.on_faulted(err);
            }
        }
        for observer in &observers {
            observer.on_disconnected(&reason);
        }
    }
}

/// The frontend's end of the backend pipe.
///
/// All methods take `&self`; a `Channel` can be shared across threads behind
/// an `Arc`. Sends are serialized so frames never interleave on the wire.
pub struct Channel {
    config: ChannelConfig,
    shared: Arc<Shared>,
}

impl Channel {
    pub fn new(config: ChannelConfig) -> Self {
        Self {
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(ConnectionState::Disconnected),
                connect_epoch: AtomicU64::new(0),
                link: Mutex::new(None),
                observers: RwLock::new(Vec::new()),
            }),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn pipe_path(&self) -> PathBuf {
        self.config.pipe_path()
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Register an observer. Applies to frames dispatched after this returns.
    pub fn subscribe(&self, observer: Arc<dyn ChannelObserver>) {
        self.shared
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Open the pipe, waiting up to `timeout` for the backend to accept, and
    /// start the reader thread. A `disconnect()` issued meanwhile makes this
    /// return `ConnectError::Cancelled`.
    pub fn connect(&self, timeout: Duration) -> Result<(), ConnectError> {
        let epoch = {
            let mut state = lock(&self.shared.state);
            match *state {
                ConnectionState::Connected => return Err(ConnectError::AlreadyConnected),
                ConnectionState::Connecting => return Err(ConnectError::InProgress),
                ConnectionState::Disconnected => *state = ConnectionState::Connecting,
            }
            self.shared.connect_epoch.load(Ordering::SeqCst)
        };

        let path = self.pipe_path();
        log::debug!("Connecting to {:?} (timeout {:?})", path, timeout);
        match self.open_link(&path, timeout, epoch) {
            Ok(()) => {
                log::info!("Connected to {:?}", path);
                Ok(())
            }
            Err(e) => {
                let mut state = lock(&self.shared.state);
                if self.shared.connect_epoch.load(Ordering::SeqCst) == epoch
                    && *state == ConnectionState::Connecting
                {
                    *state = ConnectionState::Disconnected;
                }
                log::warn!("Connect to {:?} failed: {}", path, e);
                Err(e)
            }
        }
    }

    fn open_link(
        &self,
        path: &std::path::Path,
        timeout: Duration,
        epoch: u64,
    ) -> Result<(), ConnectError> {
        let abandoned = || self.shared.connect_epoch.load(Ordering::SeqCst) != epoch;
        let stream = transport::connect(path, timeout, &abandoned)?;
        let writer = stream.try_clone()?;
        let cancelled = Arc::new(AtomicBool::new(false));
        let (mut reader, waker) = Reader::new(
            stream,
            self.config.max_frame_len,
            self.config.read_buffer_size,
            cancelled.clone(),
        )?;

        // The reader waits for its link, so the handle is in place before
        // anyone else can see the connection.
        let (start_tx, start_rx) = mpsc::channel::<Arc<Link>>();
        let shared = self.shared.clone();
        let handle = thread::Builder::new()
            .name("aether-ipc-reader".to_string())
            .spawn(move || {
                let Ok(link) = start_rx.recv() else {
                    return;
                };
                let exit = panic::catch_unwind(AssertUnwindSafe(|| {
                    reader.run(|event| shared.dispatch(event))
                }));
                let reason = match exit {
                    Ok(ReadExit::Cancelled) => return,
                    Ok(ReadExit::PeerClosed) => DisconnectReason::PeerClosed,
                    Ok(ReadExit::Io(e)) => DisconnectReason::Io(e.kind()),
                    Ok(ReadExit::Protocol(err)) => DisconnectReason::Faulted(err),
                    Err(_) => {
                        log::error!("Observer panicked on the reader thread");
                        DisconnectReason::ObserverPanicked
                    }
                };
                shared.end(Some(&link), reason);
            })?;

        let link = Arc::new(Link {
            stream: writer,
            write_lock: Mutex::new(()),
            cancelled,
            waker,
            reader: Mutex::new(Some(handle)),
        });

        let installed = {
            let mut slot = lock(&self.shared.link);
            let mut state = lock(&self.shared.state);
            if abandoned() || *state != ConnectionState::Connecting {
                false
            } else {
                *slot = Some(link.clone());
                *state = ConnectionState::Connected;
                true
            }
        };
        if !installed {
            drop(start_tx);
            link.close();
            return Err(ConnectError::Cancelled);
        }

        // The reader is parked in recv() until this lands.
        let _ = start_tx.send(link);
        Ok(())
    }

    fn current_link(&self) -> Result<Arc<Link>, SendError> {
        lock(&self.shared.link).clone().ok_or(SendError::NotConnected)
    }

    fn write_request(&self, link: &Arc<Link>, request: Request) -> Result<(), SendError> {
        let frame = request.to_frame();
        let bytes = frame
            .encode(self.config.max_frame_len)
            .map_err(|e| SendError::InvalidArgument(e.to_string()))?;

        let result = {
            let _guard = lock(&link.write_lock);
            if link.cancelled.load(Ordering::SeqCst) {
                return Err(SendError::NotConnected);
            }
            transport::write_all(&link.stream, &bytes)
        };

        match result {
            Ok(()) => {
                log::debug!("Sent frame 0x{:02x} ({} bytes)", frame.opcode, frame.payload.len());
                Ok(())
            }
            Err(e) => {
                self.shared.end(Some(link), DisconnectReason::Io(e.kind()));
                Err(SendError::Io(e))
            }
        }
    }

    /// Ask the backend to attach to `process_name`.
    pub fn send_inject(&self, process_name: &str) -> Result<(), SendError> {
        let link = self.current_link()?;
        if process_name.is_empty() {
            return Err(SendError::InvalidArgument(
                "process name is empty".to_string(),
            ));
        }
        if process_name.contains('\0') {
            return Err(SendError::InvalidArgument(
                "process name contains NUL".to_string(),
            ));
        }
        self.write_request(&link, Request::Inject(process_name.to_string()))
    }

    /// Run `script` on the backend. An empty script is passed through; the
    /// backend decides whether it is valid.
    pub fn send_execute_script(&self, script: &str) -> Result<(), SendError> {
        let link = self.current_link()?;
        self.write_request(&link, Request::ExecuteScript(script.to_string()))
    }

    /// Request a safety verdict for `script`; answered by `on_analysis_result`.
    pub fn send_analyze_script(&self, script: &str) -> Result<(), SendError> {
        let link = self.current_link()?;
        self.write_request(&link, Request::AnalyzeScript(script.to_string()))
    }

    pub fn send_configure(&self, value: f64) -> Result<(), SendError> {
        let link = self.current_link()?;
        if !value.is_finite() {
            return Err(SendError::InvalidArgument(format!(
                "configure value must be finite, got {}",
                value
            )));
        }
        self.write_request(&link, Request::Configure(value))
    }

    pub fn send_shutdown(&self) -> Result<(), SendError> {
        let link = self.current_link()?;
        self.write_request(&link, Request::Shutdown)
    }

    /// Close the connection if there is one, or abandon a connect in progress
    /// on another thread. Safe to call repeatedly, and from an observer
    /// callback.
    pub fn disconnect(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state == ConnectionState::Connecting {
                self.shared.connect_epoch.fetch_add(1, Ordering::SeqCst);
                *state = ConnectionState::Disconnected;
            }
        }
        self.shared.end(None, DisconnectReason::Requested);
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.disconnect();
    }
}
