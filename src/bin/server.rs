use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use casesim::{
    providers::{openai::OpenAI, scripted::ScriptedProvider},
    ChatOrchestrator, CriteriaGoalEvaluator, GoalEvaluator, InMemoryMetricsCollector,
    InMemoryScenarioStore, JsonFileProgressStore, LLMProvider, LayeredGoalEvaluator,
    LlmGoalEvaluator, ProviderResponseGenerator, Scenario, SimulationConfig, SimulationError,
};
use serde::{Deserialize, Serialize};
use std::{env, net::SocketAddr, sync::Arc};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const OFFLINE_REPLY: &str =
    "(offline) I'd need to think about that. Set OPENAI_API_KEY to hear from me properly.";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "info,casesim=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let scenarios_dir = env::var("CASESIM_SCENARIOS_DIR").unwrap_or_else(|_| "scenarios".into());
    let progress_dir =
        env::var("CASESIM_PROGRESS_DIR").unwrap_or_else(|_| ".casesim/progress".into());
    let addr: SocketAddr = env::var("CASESIM_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:3002".into())
        .parse()?;

    let scenarios = Arc::new(InMemoryScenarioStore::load_dir(&scenarios_dir)?);
    let progress = Arc::new(JsonFileProgressStore::open(&progress_dir).await?);
    let config = SimulationConfig::from_env();

    let (provider, evaluator): (Arc<dyn LLMProvider>, Arc<dyn GoalEvaluator>) =
        match OpenAI::from_env() {
            Ok(openai) => {
                let provider: Arc<dyn LLMProvider> = Arc::new(openai);
                let judge = LlmGoalEvaluator::new(provider.clone(), config.model.clone());
                (provider.clone(), Arc::new(LayeredGoalEvaluator::new(Arc::new(judge))))
            }
            Err(err) => {
                tracing::warn!(error = %err, "no model provider configured; personas will give canned replies");
                (
                    Arc::new(ScriptedProvider::new().with_fallback(OFFLINE_REPLY)),
                    Arc::new(CriteriaGoalEvaluator::new()),
                )
            }
        };
    tracing::info!(provider = provider.name(), model = %config.model, "model provider ready");

    let generator = Arc::new(ProviderResponseGenerator::from_config(provider, &config));
    let metrics = Arc::new(InMemoryMetricsCollector::new());
    let orchestrator = ChatOrchestrator::new(scenarios, progress, generator, evaluator)
        .with_config(config)
        .with_metrics_collector(metrics);

    let app_state = Arc::new(AppState { orchestrator });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/api/scenarios", get(list_scenarios))
        .route("/api/scenarios/schema", get(scenario_schema))
        .route("/api/scenarios/{id}", get(get_scenario))
        .route("/api/scenarios/{id}/messages", post(post_message))
        .route(
            "/api/scenarios/{id}/progress/{student}",
            get(get_progress).delete(reset_progress),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, scenarios = %scenarios_dir, progress = %progress_dir, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}

struct AppState {
    orchestrator: ChatOrchestrator,
}

#[derive(Deserialize)]
struct MessageRequest {
    student_id: String,
    message: String,
}

#[derive(Serialize)]
struct ApiResponse<T> {
    data: T,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    success: bool,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(ApiResponse {
        data,
        message: None,
        success: true,
    })
    .into_response()
}

fn failure(status: StatusCode, message: String) -> Response {
    (
        status,
        Json(ApiResponse {
            data: (),
            message: Some(message),
            success: false,
        }),
    )
        .into_response()
}

fn error_response(error: SimulationError) -> Response {
    let status = match &error {
        SimulationError::ScenarioNotFound(_) => StatusCode::NOT_FOUND,
        SimulationError::InvalidState(_) | SimulationError::VersionConflict { .. } => {
            StatusCode::CONFLICT
        }
        SimulationError::GenerationFailed { .. } => StatusCode::SERVICE_UNAVAILABLE,
        SimulationError::Storage(_)
        | SimulationError::InvalidScenario(_)
        | SimulationError::Prompt(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
        tracing::error!(error = %error, "request failed");
    }
    failure(status, error.to_string())
}

async fn list_scenarios(State(state): State<Arc<AppState>>) -> Response {
    match state.orchestrator.scenarios().list_scenarios().await {
        Ok(summaries) => ok(summaries),
        Err(err) => error_response(err.into()),
    }
}

async fn scenario_schema() -> Response {
    ok(Scenario::json_schema())
}

async fn get_scenario(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.orchestrator.scenarios().get_scenario(&id).await {
        Ok(scenario) => ok(scenario.as_ref()),
        Err(err) => error_response(err.into()),
    }
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Response {
    if request.student_id.trim().is_empty() {
        return failure(StatusCode::BAD_REQUEST, "student_id must not be empty".into());
    }

    match state
        .orchestrator
        .handle_message(&request.student_id, &id, &request.message)
        .await
    {
        Ok(outcome) => ok(outcome),
        Err(err) => error_response(err),
    }
}

async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path((id, student)): Path<(String, String)>,
) -> Response {
    match state.orchestrator.progress(&student, &id).await {
        Ok(summary) => ok(summary),
        Err(err) => error_response(err),
    }
}

async fn reset_progress(
    State(state): State<Arc<AppState>>,
    Path((id, student)): Path<(String, String)>,
) -> impl IntoResponse {
    match state.orchestrator.reset(&student, &id).await {
        Ok(existed) => Json(ApiResponse {
            data: serde_json::json!({ "reset": existed }),
            message: Some(if existed { "Progress reset" } else { "No progress recorded" }.into()),
            success: true,
        })
        .into_response(),
        Err(err) => error_response(err),
    }
}
