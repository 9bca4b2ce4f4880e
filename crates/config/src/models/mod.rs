pub mod api_observability;
pub mod app_config;
pub mod message_queue;
pub mod simulation;

pub use api_observability::*;
pub use app_config::*;
pub use message_queue::*;
pub use simulation::*;
