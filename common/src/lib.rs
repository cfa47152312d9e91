pub mod config;
pub mod connectivity;
pub mod engine;
pub mod local_cycle;
pub mod output;
pub mod presentation;
pub mod reconciler;
pub mod state;
pub mod topics;
pub mod types;

pub use config::{
    DeviceConfig, LocalCycleTiming, NetworkConfig, OfflinePolicy, PinConfig, RuntimeConfig,
    SignalConfig,
};
pub use connectivity::{ConnectivityMonitor, ConnectivityTransition, Reachability};
pub use engine::{EngineAction, InboundEvent, SignalEngine};
pub use output::{DisplayContent, Frame, Glyph, Lamps, SignalOutput};
pub use reconciler::{reconcile, Field, FieldPath, ReconcileReport, ValidationError};
pub use state::RemoteState;
pub use topics::*;
pub use types::{ConnectivityState, HeadStatus, OperationalStatus, PresentationMode, SignalColor};
