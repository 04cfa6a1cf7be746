pub mod datasources;
pub mod execute;
pub mod identity;
pub mod middleware;
mod routes;
pub mod sandbox;

use axum::Router;
use std::sync::Arc;

use crate::executor::CommandExecutor;
use crate::sandbox::SandboxPool;
use crate::service::DataSourceService;

#[derive(Clone)]
pub struct AppState {
    /// Process-wide sandbox pool; destroyed on shutdown.
    pub pool: Arc<SandboxPool>,
    pub datasources: Arc<DataSourceService>,
    pub executor: Arc<CommandExecutor>,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}
