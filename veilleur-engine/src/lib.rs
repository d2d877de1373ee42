//! Veilleur engine - host lifecycle orchestration for lab fleets
//!
//! Wakes networked Windows workstations over broadcast, verifies they came
//! up, applies and verifies software updates, samples session state and
//! load, shuts down unoccupied hosts with confirmation, and merges every
//! stage's per-host outcome into one canonical record set plus a fleet
//! summary. Reporting, persistence and the dashboard consume that record
//! set; they live outside this workspace.

pub mod aggregate;
pub mod config;
pub mod cycle;
pub mod error;
pub mod load;
pub mod model;
pub mod pool;
pub mod probe;
pub mod remote;
pub mod session;
pub mod shutdown;
pub mod update;
pub mod wake;

pub use aggregate::{ResultAggregator, StageInputs};
pub use config::{FleetConfig, ProviderKind, RecheckPolicy};
pub use cycle::{Collaborators, CycleOptions, FleetCycle};
pub use error::EngineError;
pub use model::{
    FleetReport, FleetSummary, HostGroup, HostIdentity, HostLifecycleRecord, OverallStatus,
    ProbeResult, Reachability, ShutdownOutcome, ShutdownStatus, UpdateEntry, UpdateStatus,
    WakeStatus,
};
pub use probe::{Prober, ReadinessProbe};
pub use remote::{Credential, CredentialProvider, KeyringCredentials, RemoteExecutor};
pub use session::SessionInspector;
pub use shutdown::ShutdownOrchestrator;
pub use update::{UpdateOrchestrator, UpdateProvider};
pub use wake::{UdpWakeSender, WakeOrchestrator, WakeSender};
