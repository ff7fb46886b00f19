//! anvild: the resource compilation server.
//!
//! A long-running daemon that turns source asset descriptors into compiled
//! runtime artifacts on demand. Clients request resources over a framed TCP
//! transport; the server compiles them by spawning the external resource
//! compiler, keeps them current against their transitive compile
//! dependencies via a file watcher, and can package a set of maps into the
//! full runtime install closure for a shipping build.
//!
//! Module map:
//! - [`settings`]: ini configuration
//! - [`request`]: compilation request records and their lifecycle
//! - [`task`]: the compiler worker pool
//! - [`deps`]: the compile-dependency inversion index
//! - [`registry`]: injected collaborators (compilers, modules, descriptors)
//! - [`watcher`]: file-system change batching
//! - [`packaging`]: the install-dependency closure walk
//! - [`net`]: the framed transport
//! - [`server`]: the aggregate driving all of the above, one tick at a time

pub mod deps;
pub mod error;
pub mod net;
pub mod packaging;
pub mod registry;
pub mod request;
pub mod server;
pub mod settings;
pub mod task;
pub mod watcher;

pub use error::{Result, ServerError};
pub use server::{Collaborators, ResourceServer, ServerContext};
pub use settings::ServerSettings;
