//! Dieah Context Server
//!
//! HTTP API over conversations, archive search and maintenance.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use dieah_context::{
    session::SessionSummary, system::SystemStats, AssembledPrompt, Config, ContextSystem,
    Conversation, Error, HashingEmbedder, Outcome, PreferenceCategory, PreferenceEntry,
    RankedChunk, TurnRecord,
};

/// Largest `limit` accepted by `POST /search`
const MAX_SEARCH_LIMIT: usize = 100;

/// A live conversation and when a request last touched it
struct Slot {
    conversation: Mutex<Conversation>,
    /// Seconds since server start
    last_seen: AtomicU64,
}

/// Application state shared across handlers
struct AppState {
    system: ContextSystem,
    conversations: RwLock<HashMap<Uuid, Arc<Slot>>>,
    started: Instant,
}

impl AppState {
    fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

type SharedState = Arc<AppState>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match std::env::var("DIEAH_CONFIG") {
        Ok(path) => Config::load(path)?,
        Err(_) => Config::default(),
    };
    tracing::info!("Starting Dieah Context Server on port {}", config.server_port);
    tracing::info!("Data directory: {:?}", config.data_dir);

    let port = config.server_port;
    let compaction_interval = Duration::from_secs(config.compaction_interval_secs.max(1));
    let idle_limit = config.conversation_idle_secs.max(1);

    // Initialize components
    let system = match std::env::var("DIEAH_EMBEDDER").as_deref() {
        Ok("hashing") => {
            tracing::info!("Using hashing embedder");
            let embedder = Arc::new(HashingEmbedder::new(config.embedding_dimensions));
            ContextSystem::open_with_embedder(config, embedder).await?
        }
        _ => ContextSystem::open(config).await?,
    };

    let state = Arc::new(AppState {
        system,
        conversations: RwLock::new(HashMap::new()),
        started: Instant::now(),
    });

    tokio::spawn(compaction_loop(state.clone(), compaction_interval));
    tokio::spawn(expiry_loop(state.clone(), idle_limit));

    // Build router
    let app = Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        // Archive
        .route("/search", post(search))
        .route("/compact", post(compact))
        // Conversations
        .route("/conversations", post(create_conversation))
        .route("/conversations/:id", axum::routing::delete(end_conversation))
        .route("/conversations/:id/prepare", post(prepare))
        .route("/conversations/:id/exchanges", post(record_exchange))
        .route("/conversations/:id/session", get(session_summary))
        .route("/conversations/:id/preferences", get(preferences))
        .route(
            "/conversations/:id/preferences/:key/reinforce",
            post(reinforce_preference),
        )
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!("Server listening on http://127.0.0.1:{}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down, draining background tasks");
    state.system.shutdown().await;

    Ok(())
}

async fn compaction_loop(state: SharedState, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    // First tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if let Err(e) = state.system.compact().await {
            tracing::warn!(error = %e, "Scheduled compaction failed");
        }
    }
}

async fn expiry_loop(state: SharedState, idle_limit: u64) {
    let mut ticker = tokio::time::interval(Duration::from_secs((idle_limit / 4).max(1)));
    loop {
        ticker.tick().await;
        let now = state.uptime_secs();
        let expired: Vec<Arc<Slot>> = {
            let mut conversations = state.conversations.write().await;
            let ids = idle_conversations(&conversations, now, idle_limit);
            ids.iter().filter_map(|id| conversations.remove(id)).collect()
        };
        for slot in expired {
            let mut conversation = slot.conversation.lock().await;
            tracing::info!(conversation = %conversation.id(), "Ending idle conversation");
            conversation.end_session().await;
        }
    }
}

/// Conversations not touched for more than `idle_limit` seconds
fn idle_conversations(conversations: &HashMap<Uuid, Arc<Slot>>, now: u64, idle_limit: u64) -> Vec<Uuid> {
    conversations
        .iter()
        .filter(|(_, slot)| now.saturating_sub(slot.last_seen.load(Ordering::Relaxed)) > idle_limit)
        .map(|(id, _)| *id)
        .collect()
}

fn status_for(error: &Error) -> StatusCode {
    match error {
        Error::InvalidExchange(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
        Error::BudgetExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        Error::EmbeddingUnavailable(_) | Error::IndexUnavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: Error) -> StatusCode {
    let status = status_for(&error);
    if status.is_server_error() {
        tracing::error!(error = %error, "Request failed");
    } else {
        tracing::debug!(error = %error, "Request rejected");
    }
    status
}

async fn conversation(state: &SharedState, id: &str) -> Result<Arc<Slot>, StatusCode> {
    let uuid = Uuid::parse_str(id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let slot = state
        .conversations
        .read()
        .await
        .get(&uuid)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)?;
    slot.last_seen.store(state.uptime_secs(), Ordering::Relaxed);
    Ok(slot)
}

// === Handlers ===

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    system: SystemStats,
    conversations: usize,
}

async fn stats(State(state): State<SharedState>) -> Result<Json<StatsResponse>, StatusCode> {
    let system = state.system.stats().await.map_err(reject)?;
    let conversations = state.conversations.read().await.len();
    Ok(Json(StatsResponse {
        system,
        conversations,
    }))
}

// --- Archive handlers ---

#[derive(Debug, Deserialize)]
struct SearchRequest {
    query: String,
    limit: Option<usize>,
}

async fn search(
    State(state): State<SharedState>,
    Json(req): Json<SearchRequest>,
) -> Json<Vec<RankedChunk>> {
    let limit = req.limit.map(|limit| limit.min(MAX_SEARCH_LIMIT));
    Json(state.system.search(&req.query, limit).await)
}

#[derive(Debug, Serialize)]
struct CompactResponse {
    removed: usize,
}

async fn compact(State(state): State<SharedState>) -> Result<Json<CompactResponse>, StatusCode> {
    let removed = state.system.compact().await.map_err(reject)?;
    Ok(Json(CompactResponse { removed }))
}

// --- Conversation handlers ---

#[derive(Debug, Deserialize)]
struct CreateConversationRequest {
    owner: String,
    system_prompt: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateConversationResponse {
    id: Uuid,
    session_id: String,
}

async fn create_conversation(
    State(state): State<SharedState>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<Json<CreateConversationResponse>, StatusCode> {
    if req.owner.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let mut conversation = state.system.conversation(&req.owner).map_err(reject)?;
    if let Some(prompt) = req.system_prompt {
        conversation = conversation.with_system_prompt(prompt);
    }

    let response = CreateConversationResponse {
        id: conversation.id(),
        session_id: conversation.window().session_id().to_string(),
    };
    state
        .conversations
        .write()
        .await
        .insert(
            response.id,
            Arc::new(Slot {
                conversation: Mutex::new(conversation),
                last_seen: AtomicU64::new(state.uptime_secs()),
            }),
        );

    Ok(Json(response))
}

#[derive(Debug, Deserialize)]
struct PrepareRequest {
    query: String,
}

async fn prepare(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<PrepareRequest>,
) -> Result<Json<AssembledPrompt>, StatusCode> {
    let slot = conversation(&state, &id).await?;
    let conversation = slot.conversation.lock().await;
    let prompt = conversation.prepare(&req.query).await.map_err(reject)?;
    Ok(Json(prompt))
}

#[derive(Debug, Deserialize)]
struct RecordExchangeRequest {
    user: String,
    assistant: String,
}

async fn record_exchange(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<RecordExchangeRequest>,
) -> Result<Json<TurnRecord>, StatusCode> {
    let slot = conversation(&state, &id).await?;
    let mut conversation = slot.conversation.lock().await;
    let record = conversation
        .record(&req.user, &req.assistant)
        .await
        .map_err(reject)?;
    Ok(Json(record))
}

async fn session_summary(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<SessionSummary>, StatusCode> {
    let slot = conversation(&state, &id).await?;
    let summary = slot.conversation.lock().await.session_summary();
    Ok(Json(summary))
}

async fn preferences(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<BTreeMap<PreferenceCategory, Vec<PreferenceEntry>>>, StatusCode> {
    let slot = conversation(&state, &id).await?;
    let profile = slot.conversation.lock().await.profile();
    Ok(Json(profile))
}

#[derive(Debug, Deserialize)]
struct ReinforceRequest {
    outcome: Outcome,
}

#[derive(Debug, Serialize)]
struct ReinforceResponse {
    key: String,
    confidence: f64,
    removed: bool,
}

async fn reinforce_preference(
    State(state): State<SharedState>,
    Path((id, key)): Path<(String, String)>,
    Json(req): Json<ReinforceRequest>,
) -> Result<Json<ReinforceResponse>, StatusCode> {
    let slot = conversation(&state, &id).await?;
    let mut conversation = slot.conversation.lock().await;
    let confidence = conversation
        .reinforce(&key, req.outcome)
        .await
        .ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(ReinforceResponse {
        removed: conversation.preferences().get(&key).is_none(),
        key,
        confidence,
    }))
}

async fn end_conversation(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, StatusCode> {
    let uuid = Uuid::parse_str(&id).map_err(|_| StatusCode::BAD_REQUEST)?;
    let slot = state
        .conversations
        .write()
        .await
        .remove(&uuid)
        .ok_or(StatusCode::NOT_FOUND)?;

    slot.conversation.lock().await.end_session().await;
    Ok(StatusCode::NO_CONTENT)
}
