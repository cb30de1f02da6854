//! End-to-end harness for the Shadows node.
//!
//! A suite spawns the compiled node, waits for its readiness line, opens an
//! Ethereum JSON-RPC client plus a typed chain API over a dedicated WebSocket,
//! and tears everything down once the suite body is done.

#[macro_use]
extern crate serde_derive;

#[macro_use]
extern crate hiro_system_kit;

#[macro_use]
pub mod errors;

pub mod blocks;
pub mod chain;
pub mod config;
pub mod eth;
pub mod lifecycle;
pub mod logging;
pub mod process;
pub mod readiness;
pub mod rpc;
pub mod transport;
pub mod types_bundle;

#[cfg(test)]
pub(crate) mod test_support;

pub use blocks::{create_and_finalize_block, create_and_finalize_block_via_eth};
pub use chain::{ChainApi, RuntimeVersion};
pub use config::{HarnessConfig, HarnessConfigBuilder, NodeProfile, Provider};
pub use errors::{HarnessError, HarnessErrorExt, HarnessResult};
pub use eth::{BlockTag, EthRpc};
pub use lifecycle::{describe_with_shadows, Context, SharedContext, SuiteLifecycle, SuiteState};
pub use logging::LogCtx;
pub use process::{LogBuffer, LogStream, NodeProcess};
pub use readiness::{Readiness, ReadinessDetector};
pub use transport::Transports;
pub use types_bundle::TypesBundle;
