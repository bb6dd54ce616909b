use std::{
    collections::{hash_map::Entry, HashMap},
    fs,
    path::Path,
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::{Scenario, ScenarioError};

/// Read-only access to scenario templates.
#[async_trait]
pub trait ScenarioStore: Send + Sync {
    async fn get_scenario(&self, id: &str) -> Result<Arc<Scenario>, ScenarioError>;

    async fn list_scenarios(&self) -> Result<Vec<ScenarioSummary>, ScenarioError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSummary {
    pub id: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    pub scene_count: usize,
    pub persona_count: usize,
}

impl From<&Scenario> for ScenarioSummary {
    fn from(scenario: &Scenario) -> Self {
        Self {
            id: scenario.id.clone(),
            title: scenario.title.clone(),
            industry: scenario.industry.clone(),
            scene_count: scenario.scenes.len(),
            persona_count: scenario.personas.len(),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryScenarioStore {
    scenarios: RwLock<HashMap<String, Arc<Scenario>>>,
}

impl InMemoryScenarioStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scenarios<I>(scenarios: I) -> Result<Self, ScenarioError>
    where
        I: IntoIterator<Item = Scenario>,
    {
        let mut map = HashMap::new();
        for scenario in scenarios {
            let scenario = scenario.validated()?;
            match map.entry(scenario.id.clone()) {
                Entry::Occupied(_) => {
                    return Err(ScenarioError::Invalid {
                        scenario: scenario.id,
                        reason: "another document already uses this scenario id".into(),
                    })
                }
                Entry::Vacant(slot) => {
                    slot.insert(Arc::new(scenario));
                }
            }
        }
        Ok(Self {
            scenarios: RwLock::new(map),
        })
    }

    /// Loads every `*.yaml`, `*.yml` and `*.json` document in `dir`.
    /// A document that fails to parse or validate aborts the whole load.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, ScenarioError> {
        let mut scenarios = Vec::new();
        let mut paths: Vec<_> = fs::read_dir(dir.as_ref())?
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .collect();
        paths.sort();

        for path in paths {
            let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or_default();
            let scenario = match extension {
                "yaml" | "yml" => Scenario::from_yaml_str(&fs::read_to_string(&path)?)?,
                "json" => Scenario::from_json_str(&fs::read_to_string(&path)?)?,
                _ => continue,
            };
            tracing::debug!(scenario = %scenario.id, path = %path.display(), "loaded scenario");
            scenarios.push(scenario);
        }

        Self::with_scenarios(scenarios)
    }

    /// Adds or replaces a scenario.
    pub async fn insert(&self, scenario: Scenario) -> Result<(), ScenarioError> {
        let scenario = scenario.validated()?;
        self.scenarios
            .write()
            .await
            .insert(scenario.id.clone(), Arc::new(scenario));
        Ok(())
    }
}

#[async_trait]
impl ScenarioStore for InMemoryScenarioStore {
    async fn get_scenario(&self, id: &str) -> Result<Arc<Scenario>, ScenarioError> {
        self.scenarios
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ScenarioError::NotFound(id.to_string()))
    }

    async fn list_scenarios(&self) -> Result<Vec<ScenarioSummary>, ScenarioError> {
        let scenarios = self.scenarios.read().await;
        let mut summaries: Vec<_> = scenarios
            .values()
            .map(|scenario| ScenarioSummary::from(scenario.as_ref()))
            .collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }
}
