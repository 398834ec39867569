pub mod controller;
pub mod heartbeat;
pub mod registry;

pub use controller::Coordinator;
pub use heartbeat::HeartbeatWorker;
pub use registry::{ResourceHandle, ResourceRegistry};
