//! Launch-time bootstrap orchestration.
//!
//! On every start the runtime decides, under a deadline, whether the host
//! application shows its native experience ([`ApplicationState::Standby`]) or
//! redirects to a resolved endpoint ([`ApplicationState::Ready`]). The inputs
//! are install attribution, a remote verification check and live
//! connectivity. [`Bootstrap`] wires one instance of each component.

pub mod attribution;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod connectivity;
pub mod error;
pub mod orchestrator;
pub mod push;
pub mod resolver;
pub mod settings;
pub mod signals;
pub mod verification;

pub use attribution::{AttributionMerger, AttributionRecord, DeepLinkRecord};
pub use bootstrap::{Bootstrap, BootstrapParts};
pub use config::Config;
pub use orchestrator::{ApplicationState, StateOrchestrator};
pub use signals::{Signal, SignalHub};
