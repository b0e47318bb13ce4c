#![forbid(unsafe_code)]
//! Asynchronous 9P2000 client library for Rust.
//!
//! This crate speaks the Plan 9 file protocol over any tokio byte stream:
//! it negotiates a session, multiplexes concurrent requests by tag, and
//! manages the fids the server hands out.
//!
//! # Overview
//!
//! - [`Conn`] owns the stream. Requests from any number of tasks travel
//!   over it at once; a single receive loop routes each reply to the task
//!   waiting on its tag.
//! - [`Fid`] is a handle on one server fid: walk, open, create, read,
//!   write, stat, wstat, clunk, remove.
//! - [`Fsys`] wraps the root fid of an attached tree and works by path name.
//!
//! # Example
//!
//! ```no_run
//! use plan9::{dial::dial_addr, OREAD};
//!
//! #[tokio::main]
//! async fn main() -> plan9::Result<()> {
//!     let conn = dial_addr("tcp!localhost!564").await?;
//!     let fsys = conn.attach(None, "glenda", "").await?;
//!
//!     let mut fid = fsys.open("/lib/motd", OREAD).await?;
//!     let mut buf = Vec::new();
//!     fid.read_to_end(&mut buf).await?;
//!     fid.close().await?;
//!
//!     print!("{}", String::from_utf8_lossy(&buf));
//!     fsys.close().await
//! }
//! ```
//!
//! # Cancellation
//!
//! There are no timeouts. [`Conn::rpc_until`] races a request against any
//! future and, if the future wins, flushes the request with `Tflush` and
//! waits for `Rflush`. A request whose future is simply dropped is flushed
//! in the background; its tag is not reused until the flush completes.
//!
//! # Errors
//!
//! `Rerror` replies surface as [`Error::Remote`] and leave the connection
//! usable. A transport failure or an undecodable reply hangs up the
//! connection: every waiting request fails with [`Error::Hungup`], exactly
//! once, and so does every later one.
pub mod conn;
pub mod dial;
pub mod error;
pub mod fcall;
pub mod fid;
pub mod fsys;
pub mod pool;
pub mod serialize;
#[macro_use]
pub mod utils;

pub use crate::conn::{Config, Conn};
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::fid::Fid;
pub use crate::fsys::Fsys;
pub use crate::utils::Result;
