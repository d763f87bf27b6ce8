//! Configuration collaborators: the JSON document, the router engine that
//! applies it, and the request gateway that turns edits into broadcasts.

mod document;
mod gateway;
mod router;

pub use document::{ConfigDocument, DocumentError, JsonDocument};
pub use gateway::{Method, Request, RequestGateway, Response, Status};
pub use router::{
    ActionConf, ApplicationConf, JsonConfigEngine, ListenerConf, MatchConf, ParsedConfig,
    RouteConf, RouterConf, RoutingTable, Target,
};
