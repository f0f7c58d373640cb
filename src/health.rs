use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;

/// Liveness check. Always the same payload while the process serves requests.
pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "voice-gateway"
    }))
}

/// Pool occupancy, in the shape load balancers and dashboards already scrape.
pub async fn pool_stats(state: web::Data<AppState>) -> HttpResponse {
    let stats = state.pool.stats();

    HttpResponse::Ok().json(json!({
        "active_connections": stats.leased,
        "available_connections": stats.idle
    }))
}

pub async fn detailed_metrics(state: web::Data<AppState>) -> HttpResponse {
    let metrics = state.metrics.snapshot();
    let pool = state.pool.stats();
    let uptime_seconds = state.get_uptime_seconds();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "uptime_seconds": uptime_seconds,
        "service": {
            "name": "voice-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "draining": state.shutdown.is_cancelled()
        },
        "sessions": {
            "active": metrics.active_sessions,
            "total": metrics.total_sessions,
            "failed": metrics.failed_sessions,
            "max": state.config.server.max_sessions
        },
        "frames": {
            "received": metrics.frames_received,
            "answered": metrics.responses_sent,
            "dropped": metrics.frames_dropped,
            "drop_rate": if metrics.frames_received > 0 {
                metrics.frames_dropped as f64 / metrics.frames_received as f64
            } else {
                0.0
            },
            "bytes_received": metrics.bytes_received,
            "bytes_sent": metrics.bytes_sent
        },
        "upstream": {
            "transport": state.config.upstream.transport,
            "failures": metrics.upstream_failures,
            "pool_timeouts": metrics.pool_timeouts
        },
        "pool": pool
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pool::ConnectionPool;
    use crate::upstream::mock::MockFactory;
    use actix_web::{test, App};
    use serde_json::Value;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn app_state() -> AppState {
        let pool = ConnectionPool::new(3, Duration::from_secs(1), MockFactory::new());
        AppState::new(AppConfig::default(), pool)
    }

    #[actix_web::test]
    async fn test_health_payload() {
        let app = test::init_service(App::new().route("/health", web::get().to(health_check))).await;

        let req = test::TestRequest::get().uri("/health").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({"status": "healthy", "service": "voice-gateway"}));
    }

    #[actix_web::test]
    async fn test_stats_reflect_pool() {
        let state = app_state();
        let cancel = CancellationToken::new();
        let leased = state.pool.acquire(&cancel).await.unwrap();
        let returned = state.pool.acquire(&cancel).await.unwrap();
        state.pool.release(returned).await;

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state.clone()))
                .route("/stats", web::get().to(pool_stats)),
        )
        .await;

        let req = test::TestRequest::get().uri("/stats").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body, json!({"active_connections": 1, "available_connections": 1}));

        state.pool.release(leased).await;
    }

    #[actix_web::test]
    async fn test_metrics_report_sessions_and_pool() {
        let state = app_state();
        state.metrics.session_opened();
        state.metrics.frame_received(4);
        state.metrics.frame_dropped();

        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(state))
                .route("/metrics", web::get().to(detailed_metrics)),
        )
        .await;

        let req = test::TestRequest::get().uri("/metrics").to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["sessions"]["active"], 1);
        assert_eq!(body["frames"]["dropped"], 1);
        assert_eq!(body["frames"]["drop_rate"], 1.0);
        assert_eq!(body["upstream"]["transport"], "http");
        assert_eq!(body["pool"]["max_size"], 3);
        assert_eq!(body["service"]["draining"], false);
    }
}
