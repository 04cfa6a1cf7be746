use anyhow::Result;
use async_trait::async_trait;

use super::{ConnectionTestResult, DataSource};

/// Owner-scoped access to data source records. Every lookup takes the
/// caller's id; a record owned by someone else is indistinguishable from
/// one that does not exist.
#[async_trait]
pub trait DataSourceRepository: Send + Sync {
    async fn list_for_owner(&self, owner_id: &str) -> Vec<DataSource>;
    async fn get_for_owner(&self, owner_id: &str, id: &str) -> Option<DataSource>;
    async fn save(&self, datasource: DataSource) -> Result<()>;
    async fn delete_for_owner(&self, owner_id: &str, id: &str) -> Result<bool>;
    /// Store the outcome of a connection test. Returns false when the
    /// record is gone or belongs to another owner.
    async fn record_test(&self, owner_id: &str, id: &str, result: ConnectionTestResult) -> Result<bool>;
    async fn load_all(&self) -> Result<()>;
}
