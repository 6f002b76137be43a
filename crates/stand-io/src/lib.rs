pub mod bridge;
pub mod metrics;
pub mod protocol;
pub mod sweep;

pub use bridge::{BridgeConfig, BridgeError, BridgeStats, SerialBridge};
pub use metrics::{init_metrics, observe_snapshot, serve_metrics};
pub use protocol::{LineFramer, LinkLine};
pub use sweep::{run_sweep, LinkPort, SweepError, SweepPlan, SweepPoint, SweepReport, TcpLink};
