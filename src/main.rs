use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::request_id::{PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use invoiceiq_backend::api::{self, AppState};
use invoiceiq_backend::chat::sms::SmsTransport;
use invoiceiq_backend::chat::whatsapp::WhatsAppTransport;
use invoiceiq_backend::chat::{ChatTransport, FallbackTransport};
use invoiceiq_backend::config::AppConfig;
use invoiceiq_backend::database::memory::MemoryStore;
use invoiceiq_backend::database::store::RecordStore;
use invoiceiq_backend::database::{init_pool_from_config, PgStore};
use invoiceiq_backend::logging::init_tracing;
use invoiceiq_backend::middleware::UuidRequestId;
use invoiceiq_backend::payments::mpesa::MpesaGateway;
use invoiceiq_backend::services::conversation::{ConversationEngine, InMemorySessionStore};
use invoiceiq_backend::services::intake::IntakeService;
use invoiceiq_backend::services::notification::NotificationService;
use invoiceiq_backend::services::payment_flow::PaymentFlow;
use invoiceiq_backend::services::reconciler::CallbackReconciler;
use invoiceiq_backend::services::retry_policy::RetryPolicy;

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    config.validate()?;
    init_tracing(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        "🚀 Starting InvoiceIQ backend service"
    );

    let skip_externals = std::env::var("SKIP_EXTERNALS")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    // Record store: Postgres in normal operation, in-memory when running
    // without external dependencies.
    let (store, db_pool): (Arc<dyn RecordStore>, _) =
        if skip_externals || config.database.url.is_empty() {
            info!("⏭️  Running with in-memory store (no DATABASE_URL)");
            (Arc::new(MemoryStore::new()), None)
        } else {
            info!("📊 Initializing database connection pool...");
            let pool = init_pool_from_config(&config.database).await.map_err(|e| {
                error!("Failed to initialize database pool: {}", e);
                anyhow::anyhow!(e)
            })?;
            info!("✅ Database connection pool initialized");
            (Arc::new(PgStore::new(pool.clone())), Some(pool))
        };

    // Payment gateway
    let gateway = Arc::new(MpesaGateway::new(config.mpesa.clone()).map_err(|e| {
        error!("❌ Failed to initialize M-PESA gateway: {}", e);
        anyhow::anyhow!(e)
    })?);
    info!(base_url = %config.mpesa.base_url, "✅ M-PESA gateway initialized");

    // Chat transport: WhatsApp with optional SMS fallback
    let whatsapp = Arc::new(
        WhatsAppTransport::new(config.whatsapp.transport.clone())
            .map_err(|e| anyhow::anyhow!(e))?,
    );
    let transport: Arc<dyn ChatTransport> = if config.sms.enabled {
        info!("✅ SMS fallback transport enabled");
        let sms =
            Arc::new(SmsTransport::new(config.sms.transport.clone()).map_err(|e| anyhow::anyhow!(e))?);
        Arc::new(FallbackTransport::new(whatsapp, sms))
    } else {
        whatsapp
    };

    // Core services
    let receipts = Arc::new(NotificationService::new(transport.clone()));
    let retry_policy = RetryPolicy::new(
        config.retry.max_attempts,
        std::time::Duration::from_secs(config.retry.cooldown_secs),
    );
    let flow = Arc::new(PaymentFlow::new(
        store.clone(),
        gateway,
        retry_policy,
        receipts,
    ));
    let reconciler = Arc::new(CallbackReconciler::new(flow.clone()));
    let intake = Arc::new(IntakeService::new(
        store.clone(),
        ConversationEngine::new(Arc::new(InMemorySessionStore::new())),
        transport,
        flow.clone(),
    ));

    let state = Arc::new(AppState {
        store,
        flow,
        reconciler,
        intake,
        whatsapp_verify_token: config.whatsapp.verify_token.clone(),
        db_pool,
    });

    let app: Router = api::router(state).layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(UuidRequestId))
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(TraceLayer::new_for_http()),
    );

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!(addr = %addr, "🌐 Listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}
