use deal_valuation_engine::{
    api::start_server,
    embedding::{EmbeddingProvider, GeminiEmbeddingProvider, HashingEmbeddingProvider, PersistentEmbeddingCache},
    normalizer::StaticRateTable,
    orchestrator::{InMemoryEntityDirectory, StaticPeerData},
    store::build_store,
    Collaborators, Orchestrator, Settings,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;

    info!("Deal Valuation Engine - API Server");
    info!("Port: {}", settings.api_port);
    info!("Reporting currency: {}", settings.reporting_currency);

    let provider: Arc<dyn EmbeddingProvider> = match &settings.gemini_api_key {
        Some(key) => Arc::new(GeminiEmbeddingProvider::new(
            key.clone(),
            settings.embedding_model.clone(),
            settings.embedding_dimension,
        )?),
        None => {
            warn!("GEMINI_API_KEY not set, using offline hashing embeddings");
            Arc::new(HashingEmbeddingProvider::new(settings.embedding_dimension))
        }
    };
    info!(model = provider.model_id(), dimension = provider.dimension(), "Embedding provider ready");

    let store = build_store(&settings);
    let collaborators = Collaborators {
        currency: Arc::new(StaticRateTable::default()),
        peers: Arc::new(StaticPeerData::new()),
        directory: Arc::new(InMemoryEntityDirectory::new()),
        provider,
        cache: Arc::new(PersistentEmbeddingCache::new(Arc::clone(&store))),
        store,
    };

    let orchestrator = Arc::new(Orchestrator::new(settings.engine_config(), collaborators));
    info!(store = orchestrator.store().backend(), "Orchestrator initialized");

    start_server(orchestrator, settings.api_port).await?;

    Ok(())
}
