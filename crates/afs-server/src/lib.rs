//! AFS server library
//!
//! Sessions, the request dispatcher and the newline-delimited JSON listener
//! in front of `afs-engine`.

pub mod constants;
pub mod listener;
pub mod rpc;
pub mod session_table;

pub use listener::serve;
pub use rpc::{ApiServer, ErrorBody, Request, Response};
pub use session_table::{SessionTable, WorkerHandle};
