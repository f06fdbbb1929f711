//! duplex-rpc: bidirectional RPC over a persistent WebSocket.
//!
//! A server exposes named handler bundles ("waiters") to many clients,
//! and every client symmetrically exposes waiters the server can call
//! back into over the same connection.  Calls are correlated
//! request/response pairs; liveness rides on a one-byte heartbeat frame;
//! admission is a shared secret presented as a single-use bcrypt token
//! with replay protection; frames are lightly obfuscated (not encrypted
//! -- put TLS underneath for confidentiality).
//!
//! ```no_run
//! use duplex_rpc::{Client, Server, ServerWaiter, Waiter};
//!
//! # async fn run() -> Result<(), duplex_rpc::RpcError> {
//! let echo: ServerWaiter = Waiter::new().handle("Echo", |_conn, input| async move { Ok(input) });
//! let server = Server::new(9000, "secret").register_waiter("test", echo);
//! let running = server.bind().await?;
//!
//! let handle = Client::new(format!("{}", running.local_addr()), "secret")
//!     .start()
//!     .await?;
//! let out = handle.call("test", "echo", Default::default()).await?;
//! # let _ = out;
//! # Ok(())
//! # }
//! ```

pub mod call;
pub mod client;
pub mod codec;
pub mod connection;
pub mod context;
pub mod error;
pub mod manager;
pub mod replay;
pub mod server;
pub mod waiter;

pub use client::{Client, ClientHandle, admission_token};
pub use codec::JsonMap;
pub use connection::Connection;
pub use context::Context;
pub use error::RpcError;
pub use manager::Manager;
pub use replay::{Admission, ReplayGuard};
pub use server::{RunningServer, Server};
pub use waiter::{ClientWaiter, HandlerError, ServerWaiter, Waiter};
