//! One worker process: a single-threaded, poll-driven event loop.
//!
//! A worker owns three kinds of sockets:
//! - outgoing control connections, one to every worker including itself,
//!   used to send "configuration changed" notifications;
//! - incoming control connections accepted on its own control socket, each
//!   with a receive machine that applies what it is told about;
//! - admin connections carrying configuration requests.
//!
//! Every loop turn rebuilds the poll set, dispatches readiness, and finally
//! drains the posted-event queue so that notifications scheduled by a write
//! request go out before the next wait.

use crate::admin::{AdminConn, AdminError};
use crate::poller::{NONE, Poller, READ, Readiness, WRITE};
use basalt_config::BasaltConfig;
use basalt_engine::{JsonConfigEngine, Method, Request, RequestGateway, Response};
use basalt_notify::{
    ConfigEngine, ConnectionRegistry, ControlConnection, Delivery, PostedEvents, ReceiveMachine,
    RecvFailure, SendProgress, WorkerId,
};
use basalt_shm::{ConfigStore, StoreError};
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Wait between connection attempts to a sibling that is not listening.
const RECONNECT_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("failed to open the config store")]
    Store(#[from] StoreError),

    #[error("failed to bind '{path}'")]
    Bind {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("poll failed")]
    Poll(#[source] io::Error),
}

struct Inbound {
    stream: UnixStream,
    machine: ReceiveMachine,
}

pub struct Worker {
    id: WorkerId,
    config: BasaltConfig,
    store: Arc<ConfigStore>,
    engine: JsonConfigEngine,
    gateway: RequestGateway,
    registry: ConnectionRegistry<UnixStream>,
    posted: PostedEvents,
    control: UnixListener,
    admin: UnixListener,
    inbound: Vec<Inbound>,
    admins: Vec<AdminConn>,
    poller: Poller,
    next_connect: Vec<Instant>,
}

fn bind(path: &Path) -> Result<UnixListener, WorkerError> {
    let bind_err = |source| WorkerError::Bind {
        path: path.to_owned(),
        source,
    };
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(bind_err(e)),
    }
    let listener = UnixListener::bind(path).map_err(bind_err)?;
    listener.set_nonblocking(true).map_err(bind_err)?;
    Ok(listener)
}

fn connect(path: &Path) -> io::Result<UnixStream> {
    let stream = UnixStream::connect(path)?;
    stream.set_nonblocking(true)?;
    Ok(stream)
}

impl Worker {
    /// Attaches to the existing store, binds this worker's sockets and
    /// applies whatever configuration is already installed.
    pub fn start(id: WorkerId, config: &BasaltConfig) -> Result<Self, WorkerError> {
        let store = Arc::new(ConfigStore::open(&config.shm_file_path, config.lock_spin)?);
        let control = bind(&config.control_socket(id))?;
        let admin = bind(&config.admin_socket(id))?;

        let mut engine = JsonConfigEngine::new();
        if let Some(bytes) = store.snapshot() {
            match engine.parse(&bytes).and_then(|parsed| engine.apply(parsed)) {
                Ok(()) => info!(worker = id, bytes = bytes.len(), "initial configuration applied"),
                Err(e) => error!(worker = id, error = %e, "initial configuration rejected"),
            }
        }

        info!(worker = id, workers = config.workers, "worker started");

        let now = Instant::now();
        Ok(Self {
            id,
            gateway: RequestGateway::new(Arc::clone(&store)),
            store,
            engine,
            registry: ConnectionRegistry::with_workers(config.workers),
            posted: PostedEvents::new(),
            control,
            admin,
            inbound: Vec::new(),
            admins: Vec::new(),
            poller: Poller::new(),
            next_connect: vec![now; config.workers],
            config: config.clone(),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn engine(&self) -> &JsonConfigEngine {
        &self.engine
    }

    pub fn store(&self) -> &ConfigStore {
        &self.store
    }

    /// Siblings this worker can currently notify.
    pub fn connected_peers(&self) -> usize {
        self.registry.live().count()
    }

    /// Runs a configuration request as if it had arrived on the admin socket.
    pub fn handle(&mut self, method: &Method, path: &str, body: &[u8]) -> Response {
        let req = Request { method, path, body };
        self.gateway
            .handle(req, &self.engine, &mut self.registry, &mut self.posted)
    }

    /// Loops until `stop` returns true.
    pub fn run_until(&mut self, mut stop: impl FnMut() -> bool) -> Result<(), WorkerError> {
        let timeout = Duration::from_millis(self.config.poll_timeout_ms);
        while !stop() {
            self.run_once(timeout)?;
        }
        Ok(())
    }

    /// Runs until the master process goes away.
    pub fn run(&mut self) -> Result<(), WorkerError> {
        // SAFETY: getppid has no preconditions and cannot fail.
        let parent = unsafe { libc::getppid() };
        self.run_until(move || unsafe { libc::getppid() != parent })?;
        info!(worker = self.id, "master gone, worker exiting");
        Ok(())
    }

    /// One loop turn: wait up to `timeout`, dispatch, drain posted events.
    pub fn run_once(&mut self, timeout: Duration) -> Result<(), WorkerError> {
        self.connect_peers();

        self.poller.clear();
        let control_tok = self.poller.register(&self.control, READ);
        let admin_tok = self.poller.register(&self.admin, READ);
        let inbound_toks: Vec<usize> = self
            .inbound
            .iter()
            .map(|ib| self.poller.register(&ib.stream, READ))
            .collect();
        let admin_toks: Vec<usize> = self
            .admins
            .iter()
            .map(|c| {
                let interest = if c.wants_write() { READ | WRITE } else { READ };
                self.poller.register(c.stream(), interest)
            })
            .collect();
        let outgoing: Vec<(WorkerId, usize)> = self
            .registry
            .live()
            .map(|conn| {
                let interest = if conn.wants_write() { WRITE } else { NONE };
                (conn.peer(), self.poller.register(conn.transport(), interest))
            })
            .collect();

        self.poller.wait(timeout).map_err(WorkerError::Poll)?;

        let inbound_ready: Vec<Readiness> =
            inbound_toks.iter().map(|&t| self.poller.readiness(t)).collect();
        let admin_ready: Vec<Readiness> =
            admin_toks.iter().map(|&t| self.poller.readiness(t)).collect();

        self.on_inbound(&inbound_ready);
        for (peer, tok) in outgoing {
            let ready = self.poller.readiness(tok);
            self.on_outgoing(peer, ready);
        }
        self.on_admin(&admin_ready);

        if self.poller.readiness(control_tok).readable() {
            for stream in accept_all(&self.control, "control") {
                self.inbound.push(Inbound {
                    stream,
                    machine: ReceiveMachine::new(),
                });
            }
        }
        if self.poller.readiness(admin_tok).readable() {
            for stream in accept_all(&self.admin, "admin") {
                self.admins.push(AdminConn::new(stream));
            }
        }

        let sent = self.registry.run_posted(&mut self.posted, &self.store);
        if sent > 0 {
            debug!(worker = self.id, sent, "posted notifications sent");
        }
        Ok(())
    }

    fn connect_peers(&mut self) {
        let now = Instant::now();
        for peer in 0..self.config.workers {
            if self.registry.is_connected(peer) || now < self.next_connect[peer] {
                continue;
            }
            let path = self.config.control_socket(peer);
            match connect(&path) {
                Ok(stream) => {
                    debug!(worker = self.id, peer, "control connection established");
                    if let Some(old) = self.registry.insert(ControlConnection::new(peer, stream)) {
                        old.close(&self.store);
                    }
                }
                Err(e) => {
                    debug!(worker = self.id, peer, error = %e, "control connect failed, will retry");
                    self.next_connect[peer] = now + RECONNECT_DELAY;
                }
            }
        }
    }

    fn on_inbound(&mut self, ready: &[Readiness]) {
        let id = self.id;
        let store = &self.store;
        let engine = &mut self.engine;
        let mut ready = ready.iter();
        self.inbound.retain_mut(|ib| {
            let Some(r) = ready.next() else {
                return true;
            };
            if !r.readable() {
                return true;
            }
            match ib.machine.on_read_ready(&mut ib.stream, store, &mut *engine) {
                Ok(Delivery::Applied { bytes }) => {
                    debug!(worker = id, bytes, "configuration change applied");
                    true
                }
                Ok(_) => true,
                Err(RecvFailure::Closed | RecvFailure::Io(_)) => {
                    debug!(worker = id, "inbound control connection dropped");
                    false
                }
                Err(_) => true,
            }
        });
    }

    fn on_outgoing(&mut self, peer: WorkerId, ready: Readiness) {
        let lost = if ready.hangup() {
            true
        } else if ready.writable() {
            match self.registry.get_mut(peer) {
                Some(conn) => {
                    conn.set_write_ready();
                    conn.on_write_ready(&self.store) == SendProgress::Failed
                }
                None => false,
            }
        } else {
            false
        };

        if !lost {
            return;
        }
        if let Some(conn) = self.registry.remove(peer) {
            warn!(worker = self.id, peer, "control connection lost");
            conn.close(&self.store);
            self.next_connect[peer] = Instant::now() + RECONNECT_DELAY;
        }
    }

    fn on_admin(&mut self, ready: &[Readiness]) {
        let gateway = &self.gateway;
        let engine = &self.engine;
        let registry = &mut self.registry;
        let posted = &mut self.posted;
        let mut ready = ready.iter();
        self.admins.retain_mut(|conn| {
            let Some(r) = ready.next() else {
                return true;
            };
            if r.readable() {
                match conn.on_readable() {
                    Ok(reqs) => {
                        for req in reqs {
                            let request = Request {
                                method: &req.method,
                                path: &req.path,
                                body: &req.body,
                            };
                            let resp = gateway.handle(request, engine, &mut *registry, &mut *posted);
                            debug!(method = %req.method, path = req.path, status = resp.status.code(), "admin request");
                            conn.respond(&resp);
                        }
                    }
                    Err(AdminError::Io(e)) => {
                        debug!(error = %e, "admin connection dropped");
                        return false;
                    }
                    Err(e) => {
                        warn!(error = %e, "admin request rejected");
                        conn.reject(&e);
                    }
                }
            }
            if conn.wants_write() {
                if let Err(e) = conn.on_writable() {
                    debug!(error = %e, "admin connection dropped");
                    return false;
                }
            }
            !conn.finished()
        });
    }

}

/// Accepts every pending connection on `listener`.
///
/// Accept failures such as running out of descriptors are logged and end
/// this round; the listener stays registered and is retried next turn.
fn accept_all(listener: &UnixListener, kind: &'static str) -> Vec<UnixStream> {
    let mut accepted = Vec::new();
    loop {
        match listener.accept() {
            Ok((stream, _)) => match stream.set_nonblocking(true) {
                Ok(()) => accepted.push(stream),
                Err(e) => warn!(kind, error = %e, "dropping accepted connection"),
            },
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!(kind, error = %e, "accept failed");
                break;
            }
        }
    }
    accepted
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.registry.close_all(&self.store);
        for path in [self.config.control_socket(self.id), self.config.admin_socket(self.id)] {
            let _ = std::fs::remove_file(path);
        }
    }
}
