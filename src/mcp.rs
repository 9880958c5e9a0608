use std::sync::{Arc, atomic::AtomicBool};

use rmcp::{
    ServerHandler,
    ServiceExt,
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{
        CallToolResult,
        Content,
        Implementation,
        ServerCapabilities,
        ServerInfo,
    },
    tool,
    tool_handler,
    tool_router,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::{
    config::ServiceConfig,
    data_dir::DataDir,
    document_db::DocumentDb,
    error,
    ingestion::{LoadedDocument, ingest_document},
    manager::{EvictOutcome, IndexCacheManager},
    store::{SearchHit, SearchMethod},
    text_util::{DEFAULT_PREVIEW_MAX_CHARS, preview},
};

const DEFAULT_SEARCH_LIMIT: usize = 5;

struct DocchatState {
    db: Arc<DocumentDb>,
    manager: IndexCacheManager,
}

#[derive(Clone)]
pub struct DocchatMcpServer {
    state: Arc<DocchatState>,
    tool_router: ToolRouter<Self>,
}

impl DocchatMcpServer {
    fn new(state: DocchatState) -> Self {
        Self {
            state: Arc::new(state),
            tool_router: Self::tool_router(),
        }
    }
}

#[tool_router(router = tool_router)]
impl DocchatMcpServer {
    /// Chunk a document and add it to a user's index.
    #[tool(
        name = "docchat_ingest",
        description = "Store a plain-text document for a user, split it into chunks and index them for retrieval."
    )]
    pub async fn docchat_ingest(
        &self,
        params: Parameters<IngestParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let document = LoadedDocument::new(&params.filename, &params.text);
        let cancel = AtomicBool::new(false);

        let report = ingest_document(
            &self.state.db,
            &self.state.manager,
            &params.user_id,
            &document,
            &cancel,
            |_, _| {},
        )
        .await
        .map_err(|e| match e {
            error::Error::Input(msg) => rmcp::ErrorData::invalid_params(msg, None),
            other => mcp_error("ingestion failed", other),
        })?;

        let summary = format!(
            "Ingested \"{}\" for {}: {} of {} chunks added, {} failed",
            report.filename,
            params.user_id,
            report.processed() - report.failures.len(),
            report.chunks_total,
            report.failures.len()
        );
        let structured = serde_json::to_value(&report)
            .map_err(|e| mcp_error("failed to serialize ingest report", e))?;

        Ok(CallToolResult {
            content: vec![Content::text(summary)],
            structured_content: Some(structured),
            is_error: Some(false),
            meta: None,
        })
    }

    /// Rank a user's chunks against a query.
    #[tool(
        name = "docchat_search",
        description = "Find the chunks of a user's documents most similar to a query. Falls back to keyword overlap when vectors are unavailable."
    )]
    pub async fn docchat_search(
        &self,
        params: Parameters<SearchParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let params = params.0;
        let limit = params.limit.unwrap_or(DEFAULT_SEARCH_LIMIT);

        let store = self.state.manager.get_store(&params.user_id).await;
        let hits = store.search_similar(&params.query, limit).await;

        let summary = format_search_summary(&hits, &params.query);
        let structured = serde_json::to_value(SearchResponse {
            query: params.query,
            result_count: hits.len(),
            results: hits.into_iter().map(SearchResultItem::from).collect(),
        })
        .map_err(|e| mcp_error("failed to serialize search results", e))?;

        Ok(CallToolResult {
            content: vec![Content::text(summary)],
            structured_content: Some(structured),
            is_error: Some(false),
            meta: None,
        })
    }

    /// Report what the index cache currently holds.
    #[tool(
        name = "docchat_stats",
        description = "Show index cache statistics: live stores, capacity and per-user access counts."
    )]
    pub async fn docchat_stats(&self) -> Result<CallToolResult, rmcp::ErrorData> {
        let stats = self.state.manager.stats().await;
        let summary = format!(
            "{} of {} stores live ({} draining), vector backend {}",
            stats.active_count, stats.capacity, stats.draining, stats.backend
        );
        let structured = serde_json::to_value(&stats)
            .map_err(|e| mcp_error("failed to serialize stats", e))?;

        Ok(CallToolResult {
            content: vec![Content::text(summary)],
            structured_content: Some(structured),
            is_error: Some(false),
            meta: None,
        })
    }

    /// Flush and drop a user's index from memory.
    #[tool(
        name = "docchat_evict",
        description = "Flush a user's index to disk and remove it from the in-memory cache."
    )]
    pub async fn docchat_evict(
        &self,
        params: Parameters<EvictParams>,
    ) -> Result<CallToolResult, rmcp::ErrorData> {
        let user_id = params.0.user_id;
        let (outcome, message) = match self.state.manager.evict(&user_id).await {
            EvictOutcome::NotCached => ("not_cached", format!("{user_id} was not cached")),
            EvictOutcome::Persisted => ("persisted", format!("Evicted {user_id}")),
            EvictOutcome::Dropped(e) => (
                "dropped",
                format!("Evicted {user_id}, but unsaved changes were lost: {e}"),
            ),
        };

        Ok(CallToolResult {
            content: vec![Content::text(message)],
            structured_content: Some(json!({ "userId": user_id, "outcome": outcome })),
            is_error: Some(false),
            meta: None,
        })
    }
}

#[tool_handler(router = self.tool_router)]
impl ServerHandler for DocchatMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "docchat".to_string(),
                title: Some("docchat MCP".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "Use docchat_ingest to add a user's documents and docchat_search to retrieve context for that user's questions."
                    .to_string(),
            ),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngestParams {
    /// Opaque identifier of the document owner.
    pub user_id: String,
    /// Name to record for the document.
    pub filename: String,
    /// Full document text.
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SearchParams {
    /// Opaque identifier of the user whose documents are searched.
    pub user_id: String,
    /// Natural-language query.
    pub query: String,
    /// Maximum number of results (default: 5).
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct EvictParams {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    query: String,
    result_count: usize,
    results: Vec<SearchResultItem>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SearchResultItem {
    chunk_id: u64,
    score: f32,
    method: SearchMethod,
    text: String,
}

impl From<SearchHit> for SearchResultItem {
    fn from(hit: SearchHit) -> Self {
        Self {
            chunk_id: hit.chunk_id,
            score: hit.score,
            method: hit.method,
            text: hit.text,
        }
    }
}

fn format_search_summary(hits: &[SearchHit], query: &str) -> String {
    if hits.is_empty() {
        return format!("No results found for \"{query}\"");
    }

    let mut lines = Vec::with_capacity(hits.len() + 1);
    let suffix = if hits.len() == 1 { "" } else { "s" };
    lines.push(format!("Found {} result{suffix} for \"{query}\":", hits.len()));
    for hit in hits {
        lines.push(format!(
            "#{} {:.3} {}",
            hit.chunk_id,
            hit.score,
            preview(&hit.text, DEFAULT_PREVIEW_MAX_CHARS)
        ));
    }
    lines.join("\n")
}

fn mcp_error(message: &str, error: impl std::fmt::Display) -> rmcp::ErrorData {
    rmcp::ErrorData::internal_error(
        message.to_string(),
        Some(json!({ "error": error.to_string() })),
    )
}

pub fn run_mcp(
    data_dir: DataDir,
    db: Arc<DocumentDb>,
    config: ServiceConfig,
) -> error::Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            error::Error::Config(format!("failed to start tokio runtime: {e}"))
        })?;

    runtime.block_on(async move {
        let manager = IndexCacheManager::open(&data_dir, &config, db.clone())?;
        let server = DocchatMcpServer::new(DocchatState { db, manager });
        let state = Arc::clone(&server.state);

        let transport = rmcp::transport::stdio();
        let running = server.serve(transport).await.map_err(|e| {
            error::Error::Config(format!(
                "MCP server initialization failed: {e}"
            ))
        })?;
        let waited = running.waiting().await;

        let failures = state.manager.shutdown().await;
        if failures.is_empty() {
            info!("all indexes flushed");
        } else {
            warn!(failed = failures.len(), "some indexes could not be flushed");
        }

        waited.map_err(|e| {
            error::Error::Config(format!("MCP server error: {e}"))
        })?;
        Ok::<(), error::Error>(())
    })
}
