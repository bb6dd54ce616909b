use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::{fs, sync::Mutex};

use super::{ProgressKey, ProgressStore, SimulationState, StoreError};

/// One JSON document per (student, scenario), replaced atomically through a temp file
/// and rename so readers never observe a half-written turn.
#[derive(Debug)]
pub struct JsonFileProgressStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileProgressStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            write_lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &ProgressKey) -> PathBuf {
        self.root.join(format!(
            "{}__{}.json",
            file_component(&key.student_id),
            file_component(&key.scenario_id)
        ))
    }

    async fn read(&self, path: &Path) -> Result<Option<SimulationState>, StoreError> {
        match fs::read_to_string(path).await {
            Ok(content) if content.trim().is_empty() => Ok(None),
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn file_component(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[async_trait]
impl ProgressStore for JsonFileProgressStore {
    async fn load(&self, key: &ProgressKey) -> Result<SimulationState, StoreError> {
        let path = self.path_for(key);
        Ok(self
            .read(&path)
            .await?
            .unwrap_or_else(|| SimulationState::new(key.clone())))
    }

    async fn save(&self, state: &SimulationState) -> Result<u64, StoreError> {
        let _guard = self.write_lock.lock().await;
        let path = self.path_for(&state.key);

        let found = self.read(&path).await?.map(|stored| stored.version).unwrap_or(0);
        if found != state.version {
            return Err(StoreError::VersionConflict {
                key: state.key.to_string(),
                expected: state.version,
                found,
            });
        }

        let mut stored = state.clone();
        stored.version = found + 1;
        let payload = serde_json::to_vec_pretty(&stored)?;

        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, payload).await?;
        fs::rename(&tmp_path, &path).await?;

        tracing::trace!(key = %state.key, version = stored.version, "progress saved");
        Ok(stored.version)
    }

    async fn reset(&self, key: &ProgressKey) -> Result<bool, StoreError> {
        let _guard = self.write_lock.lock().await;
        match fs::remove_file(self.path_for(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}
