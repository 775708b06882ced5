//! Process-wide PipeWire connections, one per daemon fd.
//!
//! Every capture stream on the same fd shares a single [`Connection`],
//! which owns the PipeWire main loop on a dedicated thread. Streams are
//! created on that thread through a request channel; nothing outside the
//! loop thread ever touches a PipeWire object directly.

use std::collections::HashMap;
use std::os::fd::{FromRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pipewire::context::Context;
use pipewire::main_loop::MainLoop;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::stream::{LoopStream, StreamCommand, StreamEvent, StreamSpec};

/// Object id of the core itself in error events.
const CORE_OBJECT_ID: u32 = 0;

/// How long `fetch` waits for the daemon round-trip before reporting the
/// connection unusable.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// PipeWire server version, parsed from the core info event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ServerVersion(pub u32, pub u32, pub u32);

impl ServerVersion {
    pub fn parse(s: &str) -> Option<Self> {
        let mut it = s.split('.').map(|p| p.parse::<u32>().ok());
        Some(ServerVersion(it.next()??, it.next()??, it.next()??))
    }

    /// Modifier-aware format negotiation.
    pub fn supports_dmabuf_modifiers(self) -> bool {
        self >= ServerVersion(0, 3, 33)
    }

    /// Dropping a single rejected modifier instead of the whole DMA-BUF
    /// path during renegotiation.
    pub fn supports_modifier_drop(self) -> bool {
        self >= ServerVersion(0, 3, 40)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The daemon went away (EPIPE on the core). Terminal.
    Broken,
}

enum LoopRequest {
    CreateStream(StreamSpec),
    StreamCommand { id: u64, command: StreamCommand },
    Terminate,
}

#[derive(Default)]
struct SharedState {
    state: Option<ConnectionState>,
    error: Option<String>,
    server_version: Option<ServerVersion>,
}

/// A shared handle to one PipeWire daemon connection.
pub struct Connection {
    fd: i32,
    shared: Arc<Mutex<SharedState>>,
    requests: Mutex<Option<pipewire::channel::Sender<LoopRequest>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

static REGISTRY: Lazy<Mutex<HashMap<i32, Weak<Connection>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

impl Connection {
    /// Fetch the shared connection for `fd`, creating it on first use.
    /// `fd == 0` means the default daemon socket; any other fd is dup'ed
    /// once and owned by the connection, so callers keep their copy.
    ///
    /// Always returns a handle. A failed init leaves [`Connection::error`]
    /// set and the connection unusable; callers must check before
    /// creating streams.
    pub fn fetch(fd: i32) -> Arc<Connection> {
        let mut registry = REGISTRY.lock();
        if let Some(existing) = registry.get(&fd).and_then(Weak::upgrade) {
            return existing;
        }
        let conn = Arc::new(Connection::connect(fd));
        registry.insert(fd, Arc::downgrade(&conn));
        conn
    }

    /// Drop all registry entries. Connections still referenced elsewhere
    /// stay alive; only the bookkeeping is cleared. Intended for tests.
    pub fn reset_registry() {
        REGISTRY.lock().clear();
    }

    fn connect(fd: i32) -> Connection {
        let shared = Arc::new(Mutex::new(SharedState {
            state: Some(ConnectionState::Connecting),
            ..Default::default()
        }));
        let (request_tx, request_rx) = pipewire::channel::channel::<LoopRequest>();
        let (init_tx, init_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);

        let shared_loop = shared.clone();
        let thread = std::thread::Builder::new()
            .name("pipewire-loop".to_string())
            .spawn(move || run_loop(fd, shared_loop, request_rx, init_tx))
            .ok();

        let connection = Connection {
            fd,
            shared,
            requests: Mutex::new(Some(request_tx)),
            thread: Mutex::new(thread),
        };

        match init_rx.recv_timeout(CONNECT_TIMEOUT) {
            Ok(Ok(())) => {
                info!(fd, "connected to PipeWire daemon");
            }
            Ok(Err(e)) => {
                warn!(fd, error = %e, "PipeWire connection failed");
                let mut s = connection.shared.lock();
                s.state = Some(ConnectionState::Disconnected);
                s.error = Some(e);
            }
            Err(_) => {
                let mut s = connection.shared.lock();
                s.state = Some(ConnectionState::Disconnected);
                s.error = Some("timed out waiting for the PipeWire daemon".into());
            }
        }
        connection
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state.unwrap_or(ConnectionState::Disconnected)
    }

    pub fn error(&self) -> Option<String> {
        self.shared.lock().error.clone()
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.shared.lock().server_version
    }

    /// Schedule stream creation on the loop thread.
    pub(crate) fn create_stream(&self, spec: StreamSpec) -> Result<()> {
        if let Some(err) = self.error() {
            return Err(Error::Negotiation(err));
        }
        self.send(LoopRequest::CreateStream(spec))
    }

    pub(crate) fn send_stream_command(&self, id: u64, command: StreamCommand) -> Result<()> {
        self.send(LoopRequest::StreamCommand { id, command })
    }

    fn send(&self, request: LoopRequest) -> Result<()> {
        let guard = self.requests.lock();
        let sender = guard
            .as_ref()
            .ok_or_else(|| Error::Negotiation("connection closed".into()))?;
        sender
            .send(request)
            .map_err(|_| Error::Negotiation("PipeWire loop is gone".into()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        REGISTRY.lock().remove(&self.fd);
        if let Some(sender) = self.requests.lock().take() {
            let _ = sender.send(LoopRequest::Terminate);
        }
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
    }
}

fn run_loop(
    fd: i32,
    shared: Arc<Mutex<SharedState>>,
    request_rx: pipewire::channel::Receiver<LoopRequest>,
    init_tx: crossbeam_channel::Sender<std::result::Result<(), String>>,
) {
    pipewire::init();

    let mainloop = match MainLoop::new(None) {
        Ok(l) => l,
        Err(e) => {
            let _ = init_tx.send(Err(format!("MainLoop: {e}")));
            return;
        }
    };
    let context = match Context::new(&mainloop) {
        Ok(c) => c,
        Err(e) => {
            let _ = init_tx.send(Err(format!("Context: {e}")));
            return;
        }
    };
    let core = if fd == 0 {
        context.connect(None)
    } else {
        let dup = unsafe { libc::dup(fd) };
        if dup < 0 {
            let _ = init_tx.send(Err(format!(
                "dup({fd}): {}",
                std::io::Error::last_os_error()
            )));
            return;
        }
        context.connect_fd(unsafe { OwnedFd::from_raw_fd(dup) }, None)
    };
    let core = match core {
        Ok(c) => Rc::new(c),
        Err(e) => {
            let _ = init_tx.send(Err(format!("connect: {e}")));
            return;
        }
    };

    // Streams created against this connection; events fan out to their
    // senders when the core itself breaks.
    let subscribers: Rc<std::cell::RefCell<Vec<crossbeam_channel::Sender<StreamEvent>>>> =
        Default::default();
    let streams: Rc<std::cell::RefCell<HashMap<u64, LoopStream>>> = Default::default();

    // Round-trip to the daemon so the info event (and with it the server
    // version) has landed before fetch() returns.
    let pending = core.sync(0).ok();

    let _core_listener = {
        let shared = shared.clone();
        let subscribers = subscribers.clone();
        let mainloop_quit = mainloop.clone();
        let init_tx = init_tx.clone();
        core.add_listener_local()
            .info({
                let shared = shared.clone();
                move |core_info| {
                    let version = core_info.version().to_string();
                    debug!(fd, version, "PipeWire core info");
                    shared.lock().server_version = ServerVersion::parse(&version);
                }
            })
            .done({
                let shared = shared.clone();
                move |id, seq| {
                    if id == CORE_OBJECT_ID && Some(seq) == pending {
                        shared.lock().state = Some(ConnectionState::Connected);
                        let _ = init_tx.send(Ok(()));
                    }
                }
            })
            .error(move |id, _seq, res, message| {
                if id == CORE_OBJECT_ID && res == -libc::EPIPE {
                    warn!(fd, "PipeWire daemon connection broken (EPIPE)");
                    shared.lock().state = Some(ConnectionState::Broken);
                    for tx in subscribers.borrow().iter() {
                        let _ = tx.try_send(StreamEvent::PipeBroken);
                    }
                    mainloop_quit.quit();
                } else {
                    warn!(fd, id, res, message, "PipeWire core error");
                    shared.lock().error = Some(message.to_string());
                }
            })
            .register()
    };

    let _attached = {
        let core = core.clone();
        let shared = shared.clone();
        let subscribers = subscribers.clone();
        let streams = streams.clone();
        let loop_mainloop = mainloop.clone();
        request_rx.attach(mainloop.loop_(), move |request| match request {
            LoopRequest::CreateStream(spec) => {
                let id = spec.id;
                subscribers.borrow_mut().push(spec.events.clone());
                let version = shared.lock().server_version;
                match LoopStream::create(&core, spec, version) {
                    Ok(stream) => {
                        streams.borrow_mut().insert(id, stream);
                    }
                    Err(e) => {
                        warn!(fd, error = %e, "stream creation failed");
                    }
                }
            }
            LoopRequest::StreamCommand { id, command } => {
                let disconnect = matches!(command, StreamCommand::Disconnect);
                if let Some(stream) = streams.borrow().get(&id) {
                    stream.handle(command);
                }
                if disconnect {
                    streams.borrow_mut().remove(&id);
                }
            }
            LoopRequest::Terminate => {
                debug!(fd, "terminating PipeWire loop");
                streams.borrow_mut().clear();
                loop_mainloop.quit();
            }
        })
    };

    mainloop.run();

    streams.borrow_mut().clear();
    let mut s = shared.lock();
    if s.state != Some(ConnectionState::Broken) {
        s.state = Some(ConnectionState::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_parse_and_gates() {
        let v = ServerVersion::parse("0.3.77").unwrap();
        assert_eq!(v, ServerVersion(0, 3, 77));
        assert!(v.supports_dmabuf_modifiers());
        assert!(v.supports_modifier_drop());

        let old = ServerVersion::parse("0.3.39").unwrap();
        assert!(old.supports_dmabuf_modifiers());
        assert!(!old.supports_modifier_drop());

        let ancient = ServerVersion::parse("0.3.24").unwrap();
        assert!(!ancient.supports_dmabuf_modifiers());

        assert!(ServerVersion::parse("1.2").is_none());
        assert!(ServerVersion::parse("garbage").is_none());
        assert!(ServerVersion(1, 0, 0).supports_modifier_drop());
    }
}
