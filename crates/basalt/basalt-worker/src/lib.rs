//! Worker process runtime: event loop, control and admin sockets.

mod admin;
mod poller;
mod worker;

pub use admin::{
    AdminError, AdminRequest, MAX_BODY, encode_request, encode_response, parse_request, request,
};
pub use worker::{Worker, WorkerError};
