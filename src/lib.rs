//! Client for the remote transfer protocol, push direction.
//!
//! A [`RemoteDestination`] opens one connection to the destination, runs the
//! `init`/`bootstrap` handshake, and hands out one writer per data kind
//! (entities, links, configuration, assets). Writers batch their input and
//! stream it as step events; `close` or `rollback` ends the session.

pub mod config;
pub mod error;
pub mod remote;
pub mod streaming;
pub mod transport;

pub use config::{Auth, ConfigFile, ProviderOptions, RestoreOptions, Strategy};
pub use error::{ConnectionError, ProviderError, Result};
pub use remote::{transfer_address, LifecycleState, RemoteDestination};
pub use streaming::{Asset, AssetWriter, Step, StepWriter};
