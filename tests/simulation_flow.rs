use std::{path::Path, sync::Arc};

use casesim::{
    providers::scripted::ScriptedProvider, ChatOrchestrator, CriteriaGoalEvaluator, GoalCriteria,
    InMemoryProgressStore, InMemoryScenarioStore, JsonFileProgressStore, LayeredGoalEvaluator,
    LlmGoalEvaluator, Persona, ProgressKey, ProgressStore, ProviderResponseGenerator, Scenario,
    Scene, SimulationConfig, SimulationError, SimulationPhase, TurnOutcome,
};

async fn send_as_ana(orchestrator: &ChatOrchestrator, text: &str) -> Result<TurnOutcome, SimulationError> {
    orchestrator.handle_message("ana", "product-launch", text).await
}

fn product_launch() -> Scenario {
    let path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("scenarios")
        .join("product_launch.yaml");
    let raw = std::fs::read_to_string(path).expect("scenario file");
    Scenario::from_yaml_str(&raw).expect("valid scenario")
}

#[tokio::test]
async fn student_completes_product_launch_and_progress_survives_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let personas = Arc::new(ScriptedProvider::new().with_fallback("Mei Chen: Noted, go on."));
    let judge = Arc::new(ScriptedProvider::from_replies([
        "```json\n{\"met\": true, \"confidence\": 0.92, \"reason\": \"clear, justified recommendation\"}\n```",
    ]));
    let config = SimulationConfig::default().with_model("test-model");

    let orchestrator = ChatOrchestrator::new(
        Arc::new(InMemoryScenarioStore::with_scenarios([product_launch()]).expect("store")),
        Arc::new(JsonFileProgressStore::open(dir.path()).await.expect("progress store")),
        Arc::new(ProviderResponseGenerator::from_config(personas.clone(), &config)),
        Arc::new(LayeredGoalEvaluator::new(Arc::new(LlmGoalEvaluator::new(
            judge.clone(),
            "judge-model",
        )))),
    )
    .with_config(config);

    let send = |text: &'static str| send_as_ana(&orchestrator, text);

    let intro = send("begin").await.expect("begin");
    assert!(intro
        .narration
        .as_deref()
        .unwrap_or_default()
        .contains("Understanding the constraints"));

    let discovery = send("How many units can you ship, and how much advertising is booked?")
        .await
        .expect("discovery");
    assert!(discovery.scene_transitioned);
    assert_eq!(discovery.responses.len(), 2);
    // The generator strips the echoed speaker prefix only for the matching persona.
    assert_eq!(discovery.responses[0].text, "Mei Chen: Noted, go on.");

    for text in [
        "If we delay six weeks, what does that do to inventory carrying costs and retailer penalties?",
        "And if we ship sixty percent of the planned units on time, how does the margin change?",
        "Which of those two options keeps this quarter's cash position closest to the board's target?",
    ] {
        send(text).await.expect("numbers turn");
    }
    let after_numbers = send("progress").await.expect("progress");
    assert_eq!(after_numbers.progress.scene_index, 2);
    assert!(judge.requests().is_empty());

    let finale = send("I recommend a reduced launch on the original date, with the campaign focused on preorders.")
        .await
        .expect("recommendation");
    assert_eq!(finale.responses.len(), 3);
    assert!(finale.progress.completed);
    assert_eq!(judge.requests().len(), 1);

    assert!(matches!(
        send("one more thing").await,
        Err(SimulationError::InvalidState(_))
    ));

    let reopened = JsonFileProgressStore::open(dir.path()).await.expect("reopen");
    let state = reopened
        .load(&ProgressKey::new("ana", "product-launch"))
        .await
        .expect("load");
    assert_eq!(state.phase, SimulationPhase::Completed);
    assert_eq!(state.completed_scenes, vec![true, true, true]);
    // One entry per persona reply: 2 + 3 * 2 + 3.
    assert_eq!(state.log.len(), 11);
    assert_eq!(casesim::student_messages(&state.log).count(), 5);
}

#[tokio::test]
async fn unsatisfiable_first_scene_times_out_after_three_turns() {
    let scenario = Scenario::new("timeout-case", "Timeout case")
        .with_persona(Persona::new("lee", "Lee Ortiz").with_role("Plant manager"))
        .with_scene(
            Scene::new(
                "stuck",
                0,
                "Stuck",
                "An objective nobody can reach.",
                GoalCriteria::Expression { expr: "false".into() },
            )
            .with_personas(["lee"])
            .with_timeout_turns(3),
        )
        .with_scene(
            Scene::new(
                "next",
                1,
                "Next",
                "Say anything.",
                GoalCriteria::Keywords {
                    any_of: vec!["anything".into()],
                    min_matches: 1,
                },
            )
            .with_personas(["lee"]),
        );

    let progress = Arc::new(InMemoryProgressStore::new());
    let orchestrator = ChatOrchestrator::new(
        Arc::new(InMemoryScenarioStore::with_scenarios([scenario]).expect("store")),
        progress.clone(),
        Arc::new(ProviderResponseGenerator::new(
            Arc::new(ScriptedProvider::new().with_fallback("Hm.")),
            "test-model",
        )),
        Arc::new(CriteriaGoalEvaluator::new()),
    );

    orchestrator
        .handle_message("s1", "timeout-case", "begin")
        .await
        .expect("begin");
    for text in ["first", "second", "third"] {
        orchestrator
            .handle_message("s1", "timeout-case", text)
            .await
            .expect("turn");
    }

    let state = progress
        .load(&ProgressKey::new("s1", "timeout-case"))
        .await
        .expect("load");
    assert_eq!(state.phase, SimulationPhase::InScene);
    assert_eq!(state.scene_index, 1);
    assert_eq!(state.completed_scenes, vec![true, false]);
    assert_eq!(state.turn_count, 0);

    // Another student is unaffected.
    let other = orchestrator
        .progress("s2", "timeout-case")
        .await
        .expect("progress");
    assert_eq!(other.phase, SimulationPhase::NotStarted);
}
