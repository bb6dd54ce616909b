//! Scenario documents: the immutable template a simulation runs through.
//!
//! A scenario is authored elsewhere and loaded from YAML or JSON. Loading always
//! validates, so every `Scenario` handed to the orchestrator has contiguous scene
//! order indices, resolvable persona references and in-range personality traits.

use std::collections::HashSet;

use evalexpr::DefaultNumericTypes;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod store;

pub use store::{InMemoryScenarioStore, ScenarioStore, ScenarioSummary};

pub const TRAIT_MIN: u8 = 1;
pub const TRAIT_MAX: u8 = 5;

fn default_version() -> String {
    "0.1".to_string()
}

fn default_min_matches() -> usize {
    1
}

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("scenario not found: {0}")]
    NotFound(String),
    #[error("failed to parse scenario YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse scenario JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid scenario '{scenario}': {reason}")]
    Invalid { scenario: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Scenario {
    #[serde(default = "default_version")]
    pub version: String,
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    /// Case background shared with every persona prompt.
    #[serde(default)]
    pub context: String,
    pub personas: Vec<Persona>,
    pub scenes: Vec<Scene>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Scene {
    pub id: String,
    pub order: usize,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// The student's objective, shown verbatim in help and progress replies.
    pub goal: String,
    pub criteria: GoalCriteria,
    /// Persona ids present in the scene. Declaration order is response order.
    pub personas: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_turns: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GoalCriteria {
    /// Free-text rubric judged by a model.
    Description { text: String },
    /// Met once at least `min_matches` of the keywords appear in student messages.
    Keywords {
        any_of: Vec<String>,
        #[serde(default = "default_min_matches")]
        min_matches: usize,
    },
    /// Boolean expression over `student_turns`, `persona_turns` and `student_words`.
    Expression { expr: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub traits: PersonalityTraits,
    #[serde(default)]
    pub background: String,
    #[serde(default)]
    pub goals: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct PersonalityTraits {
    pub assertiveness: u8,
    pub cooperativeness: u8,
    pub openness: u8,
    pub risk_tolerance: u8,
    pub emotional_stability: u8,
}

impl PersonalityTraits {
    pub fn new(
        assertiveness: u8,
        cooperativeness: u8,
        openness: u8,
        risk_tolerance: u8,
        emotional_stability: u8,
    ) -> Self {
        Self {
            assertiveness,
            cooperativeness,
            openness,
            risk_tolerance,
            emotional_stability,
        }
    }

    pub fn axes(&self) -> [(&'static str, u8); 5] {
        [
            ("assertiveness", self.assertiveness),
            ("cooperativeness", self.cooperativeness),
            ("openness", self.openness),
            ("risk_tolerance", self.risk_tolerance),
            ("emotional_stability", self.emotional_stability),
        ]
    }

    fn out_of_range(&self) -> Option<(&'static str, u8)> {
        self.axes()
            .into_iter()
            .find(|(_, value)| !(TRAIT_MIN..=TRAIT_MAX).contains(value))
    }
}

impl Default for PersonalityTraits {
    fn default() -> Self {
        Self::new(3, 3, 3, 3, 3)
    }
}

impl Persona {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role: None,
            traits: PersonalityTraits::default(),
            background: String::new(),
            goals: String::new(),
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_traits(mut self, traits: PersonalityTraits) -> Self {
        self.traits = traits;
        self
    }

    pub fn with_background(mut self, background: impl Into<String>) -> Self {
        self.background = background.into();
        self
    }

    pub fn with_goals(mut self, goals: impl Into<String>) -> Self {
        self.goals = goals.into();
        self
    }

    /// Name plus role, e.g. "Dana Whitfield (COO)".
    pub fn display_name(&self) -> String {
        match &self.role {
            Some(role) if !role.trim().is_empty() => format!("{} ({})", self.name, role),
            _ => self.name.clone(),
        }
    }
}

impl Scene {
    pub fn new(
        id: impl Into<String>,
        order: usize,
        title: impl Into<String>,
        goal: impl Into<String>,
        criteria: GoalCriteria,
    ) -> Self {
        Self {
            id: id.into(),
            order,
            title: title.into(),
            description: String::new(),
            goal: goal.into(),
            criteria,
            personas: Vec::new(),
            timeout_turns: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_personas<I, S>(mut self, personas: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.personas = personas.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout_turns(mut self, turns: u32) -> Self {
        self.timeout_turns = Some(turns);
        self
    }
}

impl Scenario {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            id: id.into(),
            title: title.into(),
            industry: None,
            context: String::new(),
            personas: Vec::new(),
            scenes: Vec::new(),
        }
    }

    pub fn with_industry(mut self, industry: impl Into<String>) -> Self {
        self.industry = Some(industry.into());
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn with_persona(mut self, persona: Persona) -> Self {
        self.personas.push(persona);
        self
    }

    pub fn with_scene(mut self, scene: Scene) -> Self {
        self.scenes.push(scene);
        self
    }

    pub fn from_yaml_str(input: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_yaml::from_str(input)?;
        scenario.validated()
    }

    pub fn from_json_str(input: &str) -> Result<Self, ScenarioError> {
        let scenario: Scenario = serde_json::from_str(input)?;
        scenario.validated()
    }

    pub fn to_yaml_string(&self) -> Result<String, ScenarioError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn json_schema() -> schemars::schema::RootSchema {
        schemars::schema_for!(Scenario)
    }

    pub fn scene(&self, index: usize) -> Option<&Scene> {
        self.scenes.get(index)
    }

    pub fn scene_count(&self) -> usize {
        self.scenes.len()
    }

    pub fn persona(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|persona| persona.id == id)
    }

    /// Personas of a scene in declaration order.
    pub fn scene_personas(&self, scene: &Scene) -> Result<Vec<&Persona>, ScenarioError> {
        scene
            .personas
            .iter()
            .map(|id| {
                self.persona(id).ok_or_else(|| ScenarioError::Invalid {
                    scenario: self.id.clone(),
                    reason: format!("scene '{}' references unknown persona '{id}'", scene.id),
                })
            })
            .collect()
    }

    /// Sorts scenes by order index and checks every structural invariant.
    pub fn validated(mut self) -> Result<Self, ScenarioError> {
        self.scenes.sort_by_key(|scene| scene.order);
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ScenarioError> {
        let invalid = |reason: String| ScenarioError::Invalid {
            scenario: self.id.clone(),
            reason,
        };

        if self.id.trim().is_empty() {
            return Err(invalid("scenario id must not be empty".into()));
        }
        if self.scenes.is_empty() {
            return Err(invalid("scenario has no scenes".into()));
        }

        let mut persona_ids = HashSet::new();
        for persona in &self.personas {
            if !persona_ids.insert(persona.id.as_str()) {
                return Err(invalid(format!("duplicate persona id '{}'", persona.id)));
            }
            if persona.name.trim().is_empty() {
                return Err(invalid(format!("persona '{}' has an empty name", persona.id)));
            }
            if let Some((axis, value)) = persona.traits.out_of_range() {
                return Err(invalid(format!(
                    "persona '{}' trait {axis}={value} outside {TRAIT_MIN}..={TRAIT_MAX}",
                    persona.id
                )));
            }
        }

        let mut scene_ids = HashSet::new();
        for (index, scene) in self.scenes.iter().enumerate() {
            if scene.order != index {
                return Err(invalid(format!(
                    "scene order indices must be unique and contiguous from 0; scene '{}' has order {} at position {index}",
                    scene.id, scene.order
                )));
            }
            if !scene_ids.insert(scene.id.as_str()) {
                return Err(invalid(format!("duplicate scene id '{}'", scene.id)));
            }
            if scene.personas.is_empty() {
                return Err(invalid(format!("scene '{}' has no personas", scene.id)));
            }
            if let Some(unknown) = scene.personas.iter().find(|id| !persona_ids.contains(id.as_str())) {
                return Err(invalid(format!(
                    "scene '{}' references unknown persona '{unknown}'",
                    scene.id
                )));
            }
            if scene.timeout_turns == Some(0) {
                return Err(invalid(format!("scene '{}' timeout_turns must be positive", scene.id)));
            }
            validate_criteria(&scene.criteria).map_err(|reason| {
                invalid(format!("scene '{}' criteria: {reason}", scene.id))
            })?;
        }

        Ok(())
    }
}

fn validate_criteria(criteria: &GoalCriteria) -> Result<(), String> {
    match criteria {
        GoalCriteria::Description { text } => {
            if text.trim().is_empty() {
                return Err("description must not be empty".into());
            }
        }
        GoalCriteria::Keywords { any_of, min_matches } => {
            if any_of.iter().all(|keyword| keyword.trim().is_empty()) {
                return Err("keyword list must not be empty".into());
            }
            if *min_matches == 0 || *min_matches > any_of.len() {
                return Err(format!(
                    "min_matches must be between 1 and {}",
                    any_of.len()
                ));
            }
        }
        GoalCriteria::Expression { expr } => {
            evalexpr::build_operator_tree::<DefaultNumericTypes>(expr)
                .map_err(|err| format!("expression does not parse: {err}"))?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// Two scenes; the first can only be left by timing out after three turns.
    pub fn two_scene_scenario() -> Scenario {
        Scenario::new("launch", "Product launch")
            .with_industry("Consumer electronics")
            .with_context("A mid-size manufacturer is deciding whether to delay a launch.")
            .with_persona(
                Persona::new("dana", "Dana Whitfield")
                    .with_role("COO")
                    .with_traits(PersonalityTraits::new(5, 2, 2, 2, 4))
                    .with_background("Runs operations and hates surprises.")
                    .with_goals("Protect the supply plan."),
            )
            .with_persona(
                Persona::new("raj", "Raj Patel")
                    .with_role("CMO")
                    .with_traits(PersonalityTraits::new(2, 5, 4, 4, 3))
                    .with_background("Owns the launch campaign.")
                    .with_goals("Ship before the holidays."),
            )
            .with_scene(
                Scene::new(
                    "kickoff",
                    0,
                    "Kickoff",
                    "Get both executives to state their launch constraints.",
                    GoalCriteria::Keywords {
                        any_of: vec!["zanzibar".into()],
                        min_matches: 1,
                    },
                )
                .with_description("The leadership team meets in the boardroom.")
                .with_personas(["dana", "raj"])
                .with_timeout_turns(3),
            )
            .with_scene(
                Scene::new(
                    "decision",
                    1,
                    "Decision",
                    "Recommend a launch date.",
                    GoalCriteria::Keywords {
                        any_of: vec!["recommend".into(), "date".into()],
                        min_matches: 2,
                    },
                )
                .with_description("Dana asks for a final recommendation.")
                .with_personas(["dana"])
                .with_timeout_turns(2),
            )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::two_scene_scenario;
    use super::*;

    #[test]
    fn fixture_is_valid() {
        two_scene_scenario().validate().expect("fixture validates");
    }

    #[test]
    fn scenes_are_sorted_by_order_on_load() {
        let mut scenario = two_scene_scenario();
        scenario.scenes.reverse();
        let scenario = scenario.validated().expect("valid after sort");
        assert_eq!(scenario.scenes[0].id, "kickoff");
    }

    #[test]
    fn rejects_gaps_in_scene_order() {
        let mut scenario = two_scene_scenario();
        scenario.scenes[1].order = 2;
        let error = scenario.validated().unwrap_err();
        assert!(matches!(error, ScenarioError::Invalid { reason, .. } if reason.contains("contiguous")));
    }

    #[test]
    fn rejects_unknown_persona_reference() {
        let mut scenario = two_scene_scenario();
        scenario.scenes[0].personas.push("ghost".into());
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn rejects_out_of_range_traits() {
        let mut scenario = two_scene_scenario();
        scenario.personas[0].traits.openness = 9;
        let error = scenario.validate().unwrap_err();
        assert!(error.to_string().contains("openness=9"));
    }

    #[test]
    fn rejects_unparseable_expression() {
        let mut scenario = two_scene_scenario();
        scenario.scenes[0].criteria = GoalCriteria::Expression {
            expr: "student_turns >= (".into(),
        };
        assert!(scenario.validate().is_err());
    }

    #[test]
    fn parses_yaml_with_default_min_matches() {
        let yaml = r#"
id: mini
title: Mini case
personas:
  - id: ana
    name: Ana
    traits: { assertiveness: 3, cooperativeness: 4, openness: 5, risk_tolerance: 2, emotional_stability: 3 }
scenes:
  - id: only
    order: 0
    title: Only scene
    goal: Ask about the budget.
    criteria: { kind: keywords, any_of: [budget] }
    personas: [ana]
"#;
        let scenario = Scenario::from_yaml_str(yaml).expect("parses");
        assert_eq!(scenario.version, "0.1");
        assert_eq!(
            scenario.scenes[0].criteria,
            GoalCriteria::Keywords { any_of: vec!["budget".into()], min_matches: 1 }
        );
        assert!(scenario.scenes[0].timeout_turns.is_none());
    }

    #[test]
    fn scene_personas_follow_declaration_order() {
        let scenario = two_scene_scenario();
        let names: Vec<_> = scenario
            .scene_personas(&scenario.scenes[0])
            .expect("resolves")
            .into_iter()
            .map(|persona| persona.name.as_str())
            .collect();
        assert_eq!(names, vec!["Dana Whitfield", "Raj Patel"]);
    }
}
