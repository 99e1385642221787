//! # obs-server
//!
//! JSON-lines RPC transport for the observatory daemons.
//!
//! - [`serve`] runs the accept loop for one daemon until its worker stops
//! - [`DaemonProxy`] is the client; it also implements the `obs_core::control` traits so
//!   a daemon in another process can stand in for an in-process handle
//! - the method tables for each daemon live in `handlers`
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! let (dome, _worker) = DomeDaemon::start(hardware, settings, timing);
//! let listener = obs_server::bind("127.0.0.1:9001").await?;
//! obs_server::serve(listener, Arc::new(dome)).await?;
//! ```

mod handlers;
pub mod protocol;
pub mod proxy;
pub mod server;

pub use protocol::{Params, Request, Response, RpcError};
pub use proxy::DaemonProxy;
pub use server::{bind, dispatch, serve, RpcDaemon};
