//! A deterministic SPMD task runtime. Every rank executes the same program and
//! submits the same kernel calls; scopes decide which rank runs each call, and
//! the runtime moves tile versions between ranks as the decisions require.

pub mod channel;
pub mod config;
pub mod context;
pub mod controller;
pub mod error;
pub mod logging;
pub mod memory;
pub mod model;
pub mod types;

pub use crate::config::RuntimeConfig;
pub use crate::context::{Context, ScopeGuard};
pub use crate::controller::binding::{Arg, Invocation, ScalarFuture, Tile};
pub use crate::controller::scope::ScopeKind;
pub use crate::error::{Error, Result};
pub use crate::types::{Dim2, Rank};
