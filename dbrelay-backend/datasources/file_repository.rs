use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use super::repository::DataSourceRepository;
use super::{ConnectionTestResult, DataSource};

/// File-based store for data sources: in-memory `RwLock<HashMap>` backed by
/// one JSON file per record under `<data_dir>/datasources/`.
pub struct FileDataSourceRepository {
    datasources: RwLock<HashMap<String, DataSource>>,
    dir: PathBuf,
}

impl FileDataSourceRepository {
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            datasources: RwLock::new(HashMap::new()),
            dir: base_dir.as_ref().join("datasources"),
        }
    }

    fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    fn write_file(&self, datasource: &DataSource) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&datasource.id);
        let content = serde_json::to_string_pretty(datasource)?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, content)?;
        std::fs::rename(&tmp_path, &path)?;
        Ok(())
    }
}

#[async_trait]
impl DataSourceRepository for FileDataSourceRepository {
    async fn list_for_owner(&self, owner_id: &str) -> Vec<DataSource> {
        let mut list: Vec<DataSource> = self
            .datasources
            .read()
            .await
            .values()
            .filter(|ds| ds.owner_id == owner_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        list
    }

    async fn get_for_owner(&self, owner_id: &str, id: &str) -> Option<DataSource> {
        self.datasources
            .read()
            .await
            .get(id)
            .filter(|ds| ds.owner_id == owner_id)
            .cloned()
    }

    async fn save(&self, datasource: DataSource) -> Result<()> {
        let mut map = self.datasources.write().await;
        self.write_file(&datasource)?;
        map.insert(datasource.id.clone(), datasource);
        Ok(())
    }

    async fn delete_for_owner(&self, owner_id: &str, id: &str) -> Result<bool> {
        let mut map = self.datasources.write().await;
        if !map.get(id).is_some_and(|ds| ds.owner_id == owner_id) {
            return Ok(false);
        }
        map.remove(id);
        let path = self.path_for(id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(true)
    }

    async fn record_test(&self, owner_id: &str, id: &str, result: ConnectionTestResult) -> Result<bool> {
        // Lock held across the write so disk and memory change together.
        let mut map = self.datasources.write().await;
        let Some(ds) = map.get_mut(id).filter(|ds| ds.owner_id == owner_id) else {
            return Ok(false);
        };
        let mut updated = ds.clone();
        updated.last_test = Some(result);
        updated.updated_at = Utc::now();

        self.write_file(&updated)?;
        *ds = updated;
        Ok(true)
    }

    /// Load all data source JSON files from disk into the in-memory map.
    async fn load_all(&self) -> Result<()> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            return Ok(());
        }

        let mut map = HashMap::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<DataSource>(&content) {
                    Ok(ds) => {
                        map.insert(ds.id.clone(), ds);
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "failed to parse datasource file");
                    }
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to read datasource file");
                }
            }
        }

        tracing::info!(count = map.len(), "loaded datasources");
        *self.datasources.write().await = map;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) fn sample_datasource(id: &str, owner_id: &str, connection: super::DataSourceConfig) -> DataSource {
    DataSource {
        id: id.to_string(),
        owner_id: owner_id.to_string(),
        name: format!("{id} db"),
        connection,
        documentation: vec![],
        last_test: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    }
}
