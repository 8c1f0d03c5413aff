use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use zkpay_relayer::chain::ChainRegistry;
use zkpay_relayer::commitment::{CommitmentPipeline, CommitmentProofTaskSink, CommitmentTxSink};
use zkpay_relayer::config::RelayerConfig;
use zkpay_relayer::db::{build_pool, Repository, RepositoryPort};
use zkpay_relayer::health::{healthz, metrics, readyz, HealthState, WorkerHealth};
use zkpay_relayer::ingestor::{IngestorConsumer, IngestorDeps, SubgraphPoller};
use zkpay_relayer::notifier::{NotificationHub, PushNotifier};
use zkpay_relayer::polling::{PollingReconciler, PollingScheduler, ScannerClient};
use zkpay_relayer::prover::{ProofTaskRunner, ProverClient};
use zkpay_relayer::txqueue::sender::{ChainSender, EvmSender, KmsClient, TronSenderStub};
use zkpay_relayer::txqueue::{CompositeTxSink, TransactionQueue};
use zkpay_relayer::withdraw::{WithdrawOrchestrator, WithdrawProofTaskSink, WithdrawTxSink};

#[tokio::main]
async fn main() {
    zkpay_relayer::telemetry::init();

    let config = match RelayerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("[zkpay-relayer] configuration error: {e}");
            std::process::exit(1);
        }
    };

    if config.allowed_origins.is_empty() {
        if cfg!(debug_assertions) {
            warn!("ALLOWED_ORIGINS not set — using permissive CORS (dev mode only)");
        } else {
            eprintln!("[zkpay-relayer] FATAL: ALLOWED_ORIGINS must be set in production builds");
            std::process::exit(1);
        }
    }

    info!(
        host = %config.host,
        port = config.port,
        chains = config.chain_rpc_endpoints.len(),
        origins = config.allowed_origins.len(),
        "starting zkpay-relayer"
    );

    let pool = match build_pool(&config).await {
        Ok(p) => p,
        Err(e) => {
            eprintln!("[zkpay-relayer] database connection error: {e}");
            std::process::exit(1);
        }
    };
    let repo: Arc<dyn RepositoryPort> = Arc::new(Repository::new(pool));

    let registry = Arc::new(ChainRegistry::new(&config));
    let http = reqwest::Client::new();

    let commitment = Arc::new(CommitmentPipeline::new(repo.clone()));
    let withdraw = Arc::new(WithdrawOrchestrator::new(repo.clone()));

    let hub = Arc::new(NotificationHub::new());
    let notifier = Arc::new(PushNotifier::new(hub.clone()));

    let poll_interval = Duration::from_secs(config.poll_interval_secs);
    let polling_scheduler =
        Arc::new(PollingScheduler::new(repo.clone(), config.poll_interval_secs, config.poll_max_retries));

    let worker_health = Arc::new(WorkerHealth::new());
    let shutdown = CancellationToken::new();

    // ---- Transaction Queue: one lane per configured chain -------------
    let senders: HashMap<u32, Arc<dyn ChainSender>> = config
        .chain_rpc_endpoints
        .keys()
        .map(|chain_id| {
            let sender: Arc<dyn ChainSender> = if registry.is_evm(*chain_id) {
                let kms = KmsClient::new(http.clone(), config.kms_service_url.clone().unwrap_or_default(), config.kms_auth_token.clone());
                Arc::new(EvmSender::new(http.clone(), registry.clone(), kms))
            } else {
                Arc::new(TronSenderStub)
            };
            (*chain_id, sender)
        })
        .collect();

    let composite_sink = Arc::new(CompositeTxSink {
        commitment: Arc::new(CommitmentTxSink::new(commitment.clone(), polling_scheduler.clone(), notifier.clone())),
        withdraw: Arc::new(WithdrawTxSink::new(withdraw.clone(), polling_scheduler.clone(), notifier.clone())),
    });
    let tx_queue = Arc::new(TransactionQueue::new(
        repo.clone(),
        senders,
        composite_sink,
        config.poll_max_retries,
        poll_interval,
    ));
    if let Err(e) = tx_queue.recover_on_startup().await {
        warn!(error = %e, "tx queue recovery failed");
    }
    for chain_id in config.chain_rpc_endpoints.keys().copied() {
        let queue = tx_queue.clone();
        let shutdown = shutdown.clone();
        let operator = config.relayer_operator_address.clone();
        tokio::spawn(async move { queue.run_lane(operator, chain_id, shutdown).await });
    }
    {
        let queue = tx_queue.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { queue.run_confirmation_sweep(shutdown).await });
    }

    // ---- Proof Task Runner ---------------------------------------------
    let prover_client = Arc::new(ProverClient::new(http.clone(), config.zkvm_base_url.clone()));
    let commitment_sink = Arc::new(CommitmentProofTaskSink::new(
        commitment.clone(),
        config.relayer_operator_address.clone(),
        config.protocol_contract_addresses.clone(),
        notifier.clone(),
    ));
    let withdraw_sink = Arc::new(WithdrawProofTaskSink::new(
        withdraw.clone(),
        config.relayer_operator_address.clone(),
        config.protocol_contract_addresses.clone(),
        config.poll_max_retries,
        notifier.clone(),
    ));
    let proof_runner = Arc::new(ProofTaskRunner::new(
        repo.clone(),
        prover_client,
        commitment_sink,
        withdraw_sink,
        config.commitment_proof_concurrency,
        config.withdraw_proof_concurrency,
        config.poll_max_retries,
        poll_interval,
    ));
    if let Err(e) = proof_runner.recover_on_startup().await {
        warn!(error = %e, "proof runner recovery failed");
    }
    {
        let runner = proof_runner.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.run_commitment_loop(shutdown).await });
    }
    {
        let runner = proof_runner.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { runner.run_withdraw_loop(shutdown).await });
    }

    // ---- Polling Reconciler ---------------------------------------------
    let scanner = Arc::new(ScannerClient::new(http.clone(), config.scanner_http_base_url.clone().unwrap_or_default()));
    let reconciler = Arc::new(PollingReconciler::new(
        repo.clone(),
        scanner,
        commitment.clone(),
        withdraw.clone(),
        config.polling_concurrency,
        poll_interval,
    ));
    if let Err(e) = reconciler.recover_on_startup().await {
        warn!(error = %e, "polling reconciler recovery failed");
    }
    {
        let reconciler = reconciler.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { reconciler.run(shutdown).await });
    }

    // ---- Event Ingestor: NATS consumer + subgraph catch-up --------------
    match async_nats::connect(&config.nats_url).await {
        Ok(client) => {
            let ingestor_deps = IngestorDeps {
                repo: repo.clone(),
                commitment: commitment.clone(),
                withdraw: withdraw.clone(),
                registry: registry.clone(),
                polling: polling_scheduler.clone(),
            };
            let consumer = Arc::new(IngestorConsumer::new(client, ingestor_deps, config.ingestor_concurrency));
            let shutdown = shutdown.clone();
            tokio::spawn(async move { consumer.run(shutdown).await });
        }
        Err(e) => {
            warn!(error = %e, "failed to connect to NATS, ingestor disabled; relying on subgraph catch-up and polling");
        }
    }

    if !config.subgraph_urls.is_empty() {
        let subgraph_deps = IngestorDeps {
            repo: repo.clone(),
            commitment: commitment.clone(),
            withdraw: withdraw.clone(),
            registry: registry.clone(),
            polling: polling_scheduler.clone(),
        };
        let subgraph_poller = Arc::new(SubgraphPoller::new(
            http.clone(),
            &config.subgraph_urls,
            &config.subgraph_api_keys,
            Duration::from_secs(config.subgraph_poll_interval_secs),
            subgraph_deps,
        ));
        let shutdown = shutdown.clone();
        tokio::spawn(async move { subgraph_poller.run(shutdown).await });
    }

    // ---- HTTP surface: health/readiness only ----------------------------
    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config.allowed_origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods([axum::http::Method::GET])
    };

    let health_state = Arc::new(HealthState { repo: repo.clone(), workers: worker_health.clone() });

    let app = Router::new()
        .route("/healthz", axum::routing::get(healthz))
        .route("/readyz", axum::routing::get(readyz))
        .route("/metrics", axum::routing::get(metrics))
        .layer(RequestBodyLimitLayer::new(64 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")))
        .layer(SetResponseHeaderLayer::overriding(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY")))
        .layer(SetResponseHeaderLayer::overriding(
            "Referrer-Policy".parse::<header::HeaderName>().unwrap(),
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(health_state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse().expect("invalid listen address");
    info!(addr = %addr, "zkpay-relayer listening");

    let listener = tokio::net::TcpListener::bind(addr).await.expect("failed to bind");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .expect("server error");

    info!("zkpay-relayer shut down");
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to listen for ctrl+c");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to listen for SIGTERM")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }

    shutdown.cancel();
}
