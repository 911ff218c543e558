//! Core library for the rpi-provisioner tool.
//!
//! The crate provisions a Raspberry Pi over one SSH session per run. Every
//! action is an idempotent [`step::Step`] that probes live state before
//! mutating, and a [`layer`] orchestrator sequences the steps of each phase
//! (layer 1 hardening, layer 2 bootstrap) while collecting soft failures and
//! operator follow-ups. The [`network`] reconciler moves interfaces to static
//! addressing, and [`discovery`] scans a subnet for hosts accepting a login.

pub mod boot;
pub mod config;
pub mod discovery;
pub mod keys;
pub mod layer;
pub mod layer1;
pub mod layer2;
pub mod network;
pub mod report;
pub mod session;
pub mod shell;
pub mod step;
pub mod test_support;

pub use boot::{BootError, BootReport, BootRequest, WifiCredentials, prepare_boot};
pub use config::{ConfigError, ProvisionerConfig};
pub use discovery::{DiscoveryError, DiscoveryRequest, discover, discover_blocking};
pub use keys::{AuthorizedKey, KeySource, KeySourceError, MergePolicy, UriKeySource};
pub use layer::{Layer, LayerError, LayerReport, StepRecord};
pub use layer1::{DeployerAccount, HardeningOrchestrator, HardeningRequest};
pub use layer2::{BootstrapOrchestrator, BootstrapRequest};
pub use network::{NetworkError, NetworkReconciler, NetworkStep, StaticAddressing};
pub use report::{ConsoleReporter, Mark, Reporter, StepStatus};
pub use session::{
    CommandOutput, Connector, Credential, RemoteSession, SessionError, SshConnector, SshTarget,
};
pub use step::{Advisory, Applied, Probe, Step, StepContext, StepError, StepOutcome};
