pub mod cache;
pub mod config;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod server;

pub use cache::{CacheCoordinator, Durability, GetResult};
pub use config::AppConfig;
pub use observability::init_tracing;
pub use server::{AppState, BackgroundTasks, LexicacheServer, ServerBuilder, build_app};
