use std::{collections::HashMap, future::Future, net::SocketAddr, sync::Arc};

use axum::{
    Router, middleware,
    routing::{get, post},
};
use tagsweep_core::{BackendRegistry, InMemoryBackend, InvalidationScheduler};
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::trace::TraceLayer;

use crate::{
    cache::{self, TagPublisher, TagPurgeListener},
    config::{AppConfig, AuthConfig},
    handlers, metrics, middleware as app_middleware,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub scheduler: InvalidationScheduler,
    pub auth: Arc<AuthConfig>,
    /// Fan-out to peer instances; `None` without Redis
    pub publisher: Option<TagPublisher>,
}

impl AppState {
    pub fn new(scheduler: InvalidationScheduler, auth: AuthConfig) -> Self {
        Self {
            scheduler,
            auth: Arc::new(auth),
            publisher: None,
        }
    }

    pub fn with_publisher(mut self, publisher: TagPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }
}

pub struct TagsweepServer {
    addr: SocketAddr,
    app: Router,
    scheduler: InvalidationScheduler,
    memory: HashMap<String, Arc<InMemoryBackend>>,
    background: Vec<JoinHandle<()>>,
}

pub fn build_app(state: AppState, cfg: &AppConfig) -> Router {
    let body_limit = cfg.server.body_limit_bytes;

    // Purge routes sit behind the bearer-token gate
    let purge = Router::new()
        .route("/cache/purge-tags", post(handlers::purge_tags))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            app_middleware::authorize_purge,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/readyz", get(handlers::readyz))
        .route("/metrics", get(handlers::prometheus_metrics))
        .route("/cache/invalidation", get(handlers::invalidation_status))
        .merge(purge)
        .with_state(state)
        // Middleware stack (order: request id -> trace -> body limit)
        .layer(middleware::from_fn(app_middleware::request_id))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    let req_id = req
                        .extensions()
                        .get::<axum::http::HeaderValue>()
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("")
                        .to_string();
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty,
                        request_id = %req_id
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
        .layer(axum::extract::DefaultBodyLimit::max(body_limit))
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    registry: Option<Arc<BackendRegistry>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            registry: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Use a prepared registry instead of building one from `cache.backends`.
    pub fn with_registry(mut self, registry: Arc<BackendRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub async fn build(self) -> anyhow::Result<TagsweepServer> {
        metrics::init_metrics();

        let pool = cache::create_redis_pool(&self.config.redis).await;
        let (registry, memory) = match self.registry {
            Some(registry) => (registry, HashMap::new()),
            None => {
                let backends = cache::build_backends(&self.config, pool.as_ref());
                (backends.registry, backends.memory)
            }
        };

        let scheduler =
            InvalidationScheduler::new(registry, self.config.invalidation.scheduler_config());

        let mut background = vec![metrics::spawn_sweep_recorder(&scheduler)];
        let cleanup_every = self.config.cache.cleanup_interval();
        for store in memory.values() {
            background.push(Arc::clone(store).start_cleanup_task(cleanup_every));
        }

        let mut state = AppState::new(scheduler.clone(), self.config.auth.clone());

        if let Some(pool) = pool {
            let publisher = TagPublisher::new(pool, self.config.redis.purge_channel.clone());
            let listener = TagPurgeListener {
                redis_url: self.config.redis.url.clone(),
                channel: publisher.channel().to_string(),
                origin: publisher.origin().to_string(),
                scheduler: scheduler.clone(),
            };
            background.push(listener.start());
            state = state.with_publisher(publisher);
        }

        tracing::info!(
            delay_ms = self.config.invalidation.delay_ms,
            policy = %self.config.invalidation.policy,
            backends = ?scheduler.registry().names(),
            "cache tag invalidation ready"
        );

        let app = build_app(state, &self.config);

        Ok(TagsweepServer {
            addr: self.addr,
            app,
            scheduler,
            memory,
            background,
        })
    }
}

impl TagsweepServer {
    pub fn scheduler(&self) -> &InvalidationScheduler {
        &self.scheduler
    }

    /// Typed handle to a memory backend declared in `cache.backends`.
    ///
    /// This is how the embedding application populates the store that
    /// purges sweep.
    pub fn memory_backend(&self, name: &str) -> Option<Arc<InMemoryBackend>> {
        self.memory.get(name).cloned()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on `listener` until `shutdown` resolves, then flush pending tags.
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;

        // Accepted tags are swept now rather than lost with the process
        if let Some(report) = self.scheduler.flush().await {
            tracing::info!(
                tags = report.tags.len(),
                evicted = report.evicted(),
                "flushed pending cache tags on shutdown"
            );
        }

        for task in &self.background {
            task.abort();
        }
        Ok(())
    }
}

async fn shutdown_signal() {
    // Wait for Ctrl+C
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
