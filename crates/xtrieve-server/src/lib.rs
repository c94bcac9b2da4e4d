//! The Xtrieve record server.
//!
//! A thin harness around [`xtrieve_engine::Engine`]: accept TCP
//! connections, decode one framed request at a time, dispatch it on a
//! blocking thread (operations may park in lock waits), and write the
//! framed response back. Requests on one connection execute strictly in
//! order; connections run in parallel.

pub mod config;
pub mod protocol;
pub mod server;
pub mod session;

pub use config::ServerConfig;
pub use server::Server;
