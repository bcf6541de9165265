pub mod lifecycle;
pub mod monitor;
pub mod platform;
pub mod resilience;
pub mod service;
pub mod supervisor;

pub use lifecycle::{LifecycleState, TunnelDeps, TunnelEvent, TunnelStatus};
pub use monitor::{BindingSnapshot, NetworkBinding, NetworkMonitor};
pub use platform::{
    Connectivity, HostService, InterfaceBuilder, NetworkEvent, NetworkHandle, NetworkInfo,
    NetworkListener, NetworkType, PackageNotFound, TunInterface,
};
pub use resilience::{RestartDecision, RestartPolicy};
pub use service::{ServiceControl, TunnelService};
pub use supervisor::{ExitCause, ExitReport, LaunchSpec, ProcessInfo, ProcessSupervisor};
