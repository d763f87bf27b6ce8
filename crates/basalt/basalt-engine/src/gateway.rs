//! Configuration requests: read, replace, remove.
//!
//! `GET` answers from the local document. `PUT` and `DELETE` stage a new
//! whole document and broadcast it; this worker picks it up like every other
//! one, when its own notification arrives. Writes are refused with
//! `Conflict` while an earlier broadcast still has undelivered notifications.

use crate::document::{ConfigDocument, DocumentError};
use basalt_notify::{
    BroadcastError, Broadcaster, ConnectionRegistry, PostedEvents, Transport, WriteGate,
};
use basalt_shm::ConfigStore;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Method {
    Get,
    Put,
    Delete,
    Other(String),
}

impl Method {
    pub fn parse(s: &str) -> Self {
        match s {
            "GET" => Method::Get,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            other => Method::Other(other.to_owned()),
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Method::Get => f.write_str("GET"),
            Method::Put => f.write_str("PUT"),
            Method::Delete => f.write_str("DELETE"),
            Method::Other(m) => f.write_str(m),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    NoContent,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    Conflict,
    InternalError,
}

impl Status {
    pub fn code(self) -> u16 {
        match self {
            Status::Ok => 200,
            Status::NoContent => 204,
            Status::BadRequest => 400,
            Status::NotFound => 404,
            Status::MethodNotAllowed => 405,
            Status::Conflict => 409,
            Status::InternalError => 500,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Request<'a> {
    pub method: &'a Method,
    pub path: &'a str,
    pub body: &'a [u8],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub body: Vec<u8>,
}

impl Response {
    fn json(status: Status, value: serde_json::Value) -> Self {
        let mut body = value.to_string().into_bytes();
        body.push(b'\n');
        Self { status, body }
    }

    fn success(msg: &str) -> Self {
        Self::json(Status::Ok, json!({ "success": msg }))
    }

    fn error(status: Status, msg: impl fmt::Display) -> Self {
        Self::json(status, json!({ "error": msg.to_string() }))
    }

    fn empty(status: Status) -> Self {
        Self {
            status,
            body: Vec::new(),
        }
    }
}

impl From<DocumentError> for Response {
    fn from(e: DocumentError) -> Self {
        let status = match &e {
            DocumentError::InvalidJson(_) | DocumentError::Rejected(_) => Status::BadRequest,
            DocumentError::NotFound { .. } => Status::NotFound,
            DocumentError::Encode(_) => Status::InternalError,
        };
        let detail = match &e {
            DocumentError::InvalidJson(src) => format!("{e}: {src}"),
            _ => e.to_string(),
        };
        Self::error(status, detail)
    }
}

pub struct RequestGateway {
    gate: WriteGate,
    broadcaster: Broadcaster,
}

impl RequestGateway {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            gate: WriteGate::new(Arc::clone(&store)),
            broadcaster: Broadcaster::new(store),
        }
    }

    pub fn gate(&self) -> &WriteGate {
        &self.gate
    }

    pub fn handle<D, T>(
        &self,
        req: Request<'_>,
        doc: &D,
        registry: &mut ConnectionRegistry<T>,
        posted: &mut PostedEvents,
    ) -> Response
    where
        D: ConfigDocument,
        T: Transport,
    {
        let staged = match req.method {
            Method::Get => {
                return match doc.read(req.path) {
                    Ok(body) => Response {
                        status: Status::Ok,
                        body,
                    },
                    Err(e) => e.into(),
                };
            }
            Method::Put => {
                if let Err(e) = self.gate.check() {
                    return self.conflict(req, e);
                }
                if req.body.is_empty() {
                    return Response::empty(Status::NoContent);
                }
                doc.stage_put(req.path, req.body)
            }
            Method::Delete => {
                if let Err(e) = self.gate.check() {
                    return self.conflict(req, e);
                }
                doc.stage_delete(req.path)
            }
            Method::Other(m) => {
                return Response::error(Status::MethodNotAllowed, format!("method {m} is not allowed"));
            }
        };

        let staged = match staged {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(method = %req.method, path = req.path, error = %e, "config write refused");
                return e.into();
            }
        };

        match self.broadcaster.broadcast(&staged, registry, posted) {
            Ok(report) => {
                info!(
                    method = %req.method,
                    path = req.path,
                    generation = report.generation,
                    "config write accepted"
                );
                Response::success("Reconfiguration done.")
            }
            Err(e) => {
                error!(method = %req.method, path = req.path, error = %e, "config write failed");
                Response::error(Status::InternalError, e)
            }
        }
    }

    fn conflict(&self, req: Request<'_>, e: BroadcastError) -> Response {
        warn!(method = %req.method, path = req.path, error = %e, "config write conflict");
        Response::error(Status::Conflict, e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::JsonDocument;
    use basalt_notify::ControlConnection;
    use basalt_shm::StoreOptions;
    use std::io::{self, Read, Write};

    /// Accepts every write.
    struct Sink;

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Read for Sink {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::WouldBlock.into())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<ConfigStore>,
        gateway: RequestGateway,
        registry: ConnectionRegistry<Sink>,
        posted: PostedEvents,
    }

    fn fixture(arena_size: u64, peers: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(
            ConfigStore::create(
                dir.path().join("store"),
                StoreOptions {
                    arena_size,
                    ..StoreOptions::default()
                },
            )
            .unwrap(),
        );
        let mut registry = ConnectionRegistry::with_workers(peers);
        for peer in 0..peers {
            registry.insert(ControlConnection::new(peer, Sink));
        }
        Fixture {
            gateway: RequestGateway::new(Arc::clone(&store)),
            store,
            registry,
            posted: PostedEvents::new(),
            _dir: dir,
        }
    }

    impl Fixture {
        fn send(&mut self, method: Method, path: &str, body: &[u8], doc: &JsonDocument) -> Response {
            let req = Request {
                method: &method,
                path,
                body,
            };
            self.gateway
                .handle(req, doc, &mut self.registry, &mut self.posted)
        }
    }

    #[test]
    fn get_reads_the_local_document() {
        let mut f = fixture(1 << 16, 0);
        let doc = JsonDocument::new(json!({"routes": []}));

        let r = f.send(Method::Get, "/routes", b"", &doc);
        assert_eq!(r.status, Status::Ok);
        assert_eq!(r.body, b"[]");

        let r = f.send(Method::Get, "/listeners", b"", &doc);
        assert_eq!(r.status, Status::NotFound);
    }

    #[test]
    fn put_broadcasts_the_whole_document() {
        let mut f = fixture(1 << 16, 2);
        let doc = JsonDocument::new(json!({"routes": []}));

        let r = f.send(Method::Put, "/listeners", br#"{"*:80": {"pass": "routes"}}"#, &doc);
        assert_eq!(r.status, Status::Ok, "{}", String::from_utf8_lossy(&r.body));
        assert_eq!(f.store.refcount(), 2);
        assert_eq!(f.posted.len(), 2);

        let blob: serde_json::Value =
            serde_json::from_slice(&f.store.snapshot().unwrap()).unwrap();
        assert_eq!(blob, json!({"routes": [], "listeners": {"*:80": {"pass": "routes"}}}));
        // The local copy waits for its own notification.
        assert!(doc.get("/listeners").is_err());
    }

    #[test]
    fn writes_conflict_while_a_broadcast_is_outstanding() {
        let mut f = fixture(1 << 16, 1);
        let doc = JsonDocument::default();
        assert_eq!(f.send(Method::Put, "/a", b"1", &doc).status, Status::Ok);

        let installs = f.store.stats().unwrap().installs;
        assert_eq!(f.send(Method::Put, "/b", b"2", &doc).status, Status::Conflict);
        assert_eq!(f.send(Method::Delete, "/a", b"", &doc).status, Status::Conflict);
        assert_eq!(f.store.stats().unwrap().installs, installs);

        // Reads are never gated.
        assert_eq!(f.send(Method::Get, "/", b"", &doc).status, Status::Ok);

        f.registry.run_posted(&mut f.posted, &f.store);
        f.store.snapshot_and_release().unwrap();
        assert_eq!(f.send(Method::Delete, "/", b"", &doc).status, Status::Ok);
    }

    #[test]
    fn request_errors_map_to_statuses() {
        let mut f = fixture(1 << 16, 1);
        let doc = JsonDocument::new(json!({"routes": []}));

        assert_eq!(f.send(Method::Put, "/routes", b"", &doc).status, Status::NoContent);
        assert_eq!(f.send(Method::Put, "/routes", b"[{", &doc).status, Status::BadRequest);
        assert_eq!(f.send(Method::Put, "/x/y", b"1", &doc).status, Status::NotFound);
        assert_eq!(f.send(Method::Delete, "/nope", b"", &doc).status, Status::NotFound);
        assert_eq!(
            f.send(Method::parse("POST"), "/", b"{}", &doc).status,
            Status::MethodNotAllowed
        );
        // None of the above reached the store.
        assert_eq!(f.store.stats().unwrap().installs, 0);
    }

    #[test]
    fn store_failure_is_an_internal_error() {
        let mut f = fixture(256, 1);
        let doc = JsonDocument::default();
        let big = format!("\"{}\"", "x".repeat(4096));

        let r = f.send(Method::Put, "/big", big.as_bytes(), &doc);
        assert_eq!(r.status, Status::InternalError);
        assert_eq!(f.store.refcount(), 0);
        assert!(f.posted.is_empty());
    }

    #[test]
    fn status_codes() {
        let codes: Vec<u16> = [
            Status::Ok,
            Status::NoContent,
            Status::BadRequest,
            Status::NotFound,
            Status::MethodNotAllowed,
            Status::Conflict,
            Status::InternalError,
        ]
        .into_iter()
        .map(Status::code)
        .collect();
        assert_eq!(codes, [200, 204, 400, 404, 405, 409, 500]);
    }
}
