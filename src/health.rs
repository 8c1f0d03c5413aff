//! `/healthz`, `/readyz`, and `/metrics` endpoints — modeled on the
//! relayer's own `health`/`status` handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::db::RepositoryPort;

/// Process-wide liveness flags a background worker can flip to Fatal
/// (spec §7: a `Fatal` error "aborts the affected worker, surfaced via the
/// health endpoint").
#[derive(Default)]
pub struct WorkerHealth {
    ingestor: AtomicBool,
    polling: AtomicBool,
    txqueue: AtomicBool,
    prover: AtomicBool,
}

impl WorkerHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ingestor_dead(&self) {
        self.ingestor.store(true, Ordering::Relaxed);
    }

    pub fn mark_polling_dead(&self) {
        self.polling.store(true, Ordering::Relaxed);
    }

    pub fn mark_txqueue_dead(&self) {
        self.txqueue.store(true, Ordering::Relaxed);
    }

    pub fn mark_prover_dead(&self) {
        self.prover.store(true, Ordering::Relaxed);
    }

    fn all_alive(&self) -> bool {
        !self.ingestor.load(Ordering::Relaxed)
            && !self.polling.load(Ordering::Relaxed)
            && !self.txqueue.load(Ordering::Relaxed)
            && !self.prover.load(Ordering::Relaxed)
    }

    fn as_gauges(&self) -> [(&'static str, bool); 4] {
        [
            ("ingestor", !self.ingestor.load(Ordering::Relaxed)),
            ("polling", !self.polling.load(Ordering::Relaxed)),
            ("txqueue", !self.txqueue.load(Ordering::Relaxed)),
            ("prover", !self.prover.load(Ordering::Relaxed)),
        ]
    }
}

pub struct HealthState {
    pub repo: Arc<dyn RepositoryPort>,
    pub workers: Arc<WorkerHealth>,
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "zkpay-relayer",
    }))
}

/// Unlike `/healthz`, this also touches the database so a load balancer
/// can pull a replica whose storage connection is wedged.
pub async fn readyz(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let workers_ok = state.workers.all_alive();
    let db_ok = state.repo.ping().await.is_ok();
    let ready = workers_ok && db_ok;
    let status = if ready { axum::http::StatusCode::OK } else { axum::http::StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(json!({ "ready": ready, "workers_ok": workers_ok, "db_ok": db_ok })))
}

/// Plain Prometheus text exposition format, hand-written since nothing
/// downstream scrapes more than worker liveness today.
pub async fn metrics(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let mut body = String::from("# HELP zkpay_relayer_worker_up Worker loop liveness (1 = alive)\n");
    body.push_str("# TYPE zkpay_relayer_worker_up gauge\n");
    for (name, alive) in state.workers.as_gauges() {
        body.push_str(&format!("zkpay_relayer_worker_up{{worker=\"{name}\"}} {}\n", alive as u8));
    }
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_health_starts_alive() {
        let health = WorkerHealth::new();
        assert!(health.all_alive());
    }

    #[test]
    fn marking_a_worker_dead_fails_all_alive() {
        let health = WorkerHealth::new();
        health.mark_prover_dead();
        assert!(!health.all_alive());
    }

    #[test]
    fn gauges_reflect_a_dead_worker() {
        let health = WorkerHealth::new();
        health.mark_txqueue_dead();
        let gauges: std::collections::HashMap<_, _> = health.as_gauges().into_iter().collect();
        assert_eq!(gauges["txqueue"], false);
        assert_eq!(gauges["prover"], true);
    }
}
