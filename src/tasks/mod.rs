mod heartbeat;
mod maintenance;

pub use heartbeat::HeartbeatTask;
pub use maintenance::MaintenanceTask;
