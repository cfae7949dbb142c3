//! Edge proxy: the single ingress routing requests by path prefix

pub mod routes;
pub mod server;

pub use routes::{forward_headers, Route, RouteRule, RouteTable};
pub use server::{EdgeProxy, DEFAULT_LISTEN, DEFAULT_READ_TIMEOUT};
