//! Routing state built from the configuration document.
//!
//! Parsing turns the bytes into a typed `RouterConf` and then compiles it
//! into a `RoutingTable`; every reference (`pass` targets) is resolved at
//! that point, so a configuration that would not route cannot reach
//! `apply`. Requests in flight keep the table they started with through the
//! `Arc` handed out by `JsonConfigEngine::table`.

use crate::document::{ConfigDocument, DocumentError, JsonDocument};
use basalt_notify::{ConfigEngine, EngineError};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RouterConf {
    #[serde(default)]
    pub listeners: BTreeMap<String, ListenerConf>,
    #[serde(default)]
    pub routes: Vec<RouteConf>,
    #[serde(default)]
    pub applications: BTreeMap<String, ApplicationConf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListenerConf {
    pub pass: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RouteConf {
    #[serde(default, rename = "match")]
    pub matcher: MatchConf,
    pub action: ActionConf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MatchConf {
    pub host: Option<String>,
    pub method: Option<String>,
    /// Exact URI, or a prefix when it ends with `*`.
    pub uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ActionConf {
    pub pass: Option<String>,
    #[serde(rename = "return")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ApplicationConf {
    #[serde(rename = "type")]
    pub kind: String,
}

/// Where a request ends up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Routes,
    Application(String),
    Return(u16),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CompiledRoute {
    matcher: MatchConf,
    target: Target,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingTable {
    listeners: BTreeMap<String, Target>,
    routes: Vec<CompiledRoute>,
}

fn resolve_pass(pass: &str, conf: &RouterConf) -> Result<Target, String> {
    if pass == "routes" {
        return Ok(Target::Routes);
    }
    match pass.strip_prefix("applications/") {
        Some(name) if conf.applications.contains_key(name) => {
            Ok(Target::Application(name.to_owned()))
        }
        Some(name) => Err(format!("application \"{name}\" is not defined")),
        None => Err(format!("invalid pass target \"{pass}\"")),
    }
}

impl MatchConf {
    fn matches(&self, host: &str, method: &str, uri: &str) -> bool {
        let host_ok = self.host.as_deref().is_none_or(|h| h.eq_ignore_ascii_case(host));
        let method_ok = self
            .method
            .as_deref()
            .is_none_or(|m| m.eq_ignore_ascii_case(method));
        let uri_ok = self.uri.as_deref().is_none_or(|u| match u.strip_suffix('*') {
            Some(prefix) => uri.starts_with(prefix),
            None => u == uri,
        });
        host_ok && method_ok && uri_ok
    }
}

impl RoutingTable {
    pub fn compile(conf: &RouterConf) -> Result<Self, String> {
        let mut routes = Vec::with_capacity(conf.routes.len());
        for (i, route) in conf.routes.iter().enumerate() {
            let target = match (&route.action.pass, route.action.status) {
                (Some(pass), None) => match resolve_pass(pass, conf)? {
                    Target::Routes => return Err(format!("route {i} passes back to routes")),
                    t => t,
                },
                (None, Some(status)) if (100..=999).contains(&status) => Target::Return(status),
                (None, Some(status)) => return Err(format!("route {i}: invalid status {status}")),
                _ => return Err(format!("route {i}: action needs exactly one of pass or return")),
            };
            routes.push(CompiledRoute {
                matcher: route.matcher.clone(),
                target,
            });
        }

        let mut listeners = BTreeMap::new();
        for (addr, listener) in &conf.listeners {
            let target = resolve_pass(&listener.pass, conf)
                .map_err(|e| format!("listener \"{addr}\": {e}"))?;
            listeners.insert(addr.clone(), target);
        }

        Ok(Self { listeners, routes })
    }

    /// Final target for a request accepted on `listener`. `None` when the
    /// listener is unknown or no route matches.
    pub fn resolve(&self, listener: &str, host: &str, method: &str, uri: &str) -> Option<&Target> {
        match self.listeners.get(listener)? {
            Target::Routes => self
                .routes
                .iter()
                .find(|r| r.matcher.matches(host, method, uri))
                .map(|r| &r.target),
            direct => Some(direct),
        }
    }

    pub fn listeners(&self) -> usize {
        self.listeners.len()
    }

    pub fn routes(&self) -> usize {
        self.routes.len()
    }
}

/// Output of `parse`, consumed by `apply`.
#[derive(Debug)]
pub struct ParsedConfig {
    document: JsonDocument,
    table: RoutingTable,
}

/// Reference `ConfigEngine` for JSON documents.
#[derive(Debug, Default)]
pub struct JsonConfigEngine {
    document: JsonDocument,
    table: Arc<RoutingTable>,
    applied: u64,
}

impl JsonConfigEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn document(&self) -> &JsonDocument {
        &self.document
    }

    pub fn table(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table)
    }

    /// Configurations applied since start.
    pub fn applied(&self) -> u64 {
        self.applied
    }
}

impl ConfigEngine for JsonConfigEngine {
    type Parsed = ParsedConfig;

    fn parse(&self, bytes: &[u8]) -> Result<ParsedConfig, EngineError> {
        let root: Value =
            serde_json::from_slice(bytes).map_err(|e| EngineError::Parse(e.to_string()))?;
        if !root.is_object() {
            return Err(EngineError::Parse("configuration must be an object".into()));
        }
        let conf = RouterConf::deserialize(&root).map_err(|e| EngineError::Parse(e.to_string()))?;
        let table = RoutingTable::compile(&conf).map_err(EngineError::Parse)?;
        Ok(ParsedConfig {
            document: JsonDocument::new(root),
            table,
        })
    }

    fn apply(&mut self, parsed: ParsedConfig) -> Result<(), EngineError> {
        self.document = parsed.document;
        self.table = Arc::new(parsed.table);
        self.applied += 1;
        info!(
            listeners = self.table.listeners(),
            routes = self.table.routes(),
            applied = self.applied,
            "router configuration applied"
        );
        Ok(())
    }
}

/// Staged edits are validated like a received configuration would be, so a
/// write that every worker would reject is refused up front.
impl ConfigDocument for JsonConfigEngine {
    fn read(&self, path: &str) -> Result<Vec<u8>, DocumentError> {
        self.document.read(path)
    }

    fn stage_put(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, DocumentError> {
        let staged = self.document.stage_put(path, body)?;
        self.parse(&staged)?;
        Ok(staged)
    }

    fn stage_delete(&self, path: &str) -> Result<Vec<u8>, DocumentError> {
        let staged = self.document.stage_delete(path)?;
        self.parse(&staged)?;
        Ok(staged)
    }
}
