use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::Router;
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

const ADMIN_SECRET: &str = "smoke-admin-secret-7f3c";

fn test_db_url() -> Option<String> {
    std::env::var("TRANSIT_TEST_DB_URL")
        .ok()
        .or_else(|| std::env::var("DATABASE_URL").ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn schema_db_url(base: &str, schema: &str) -> String {
    let separator = if base.contains('?') { "&" } else { "?" };
    format!("{base}{separator}options=-csearch_path%3D{schema}")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn smoke_reports_drive_line_status_and_statistics() {
    let Some(db_url) = test_db_url() else {
        eprintln!("skipping e2e smoke test; set TRANSIT_TEST_DB_URL to enable");
        return;
    };

    let log_buf = init_test_tracing();
    log_buf
        .lock()
        .expect("log lock should be available")
        .clear();

    let schema = format!("transit_smoke_{}", ulid::Ulid::new().to_string().to_lowercase());
    let admin_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(1)
        .connect(&db_url)
        .await
        .expect("DB connect should succeed");
    sqlx::query(&format!("CREATE SCHEMA {}", schema))
        .execute(&admin_pool)
        .await
        .expect("create schema should succeed");

    let config = transit_gateway::config::GatewayConfig::from_kv(&HashMap::from([
        (
            "TRANSIT_DB_URL".to_string(),
            schema_db_url(&db_url, &schema),
        ),
        ("TRANSIT_ADMIN_SECRET".to_string(), ADMIN_SECRET.to_string()),
        ("TRANSIT_VIEW_CACHE_TTL_MS".to_string(), "60000".to_string()),
    ]))
    .expect("gateway config should be valid");

    let (addr, shutdown, task) = spawn_server(
        transit_gateway::http::router(config)
            .await
            .expect("gateway router should init"),
    )
    .await;

    let client = reqwest::Client::new();
    wait_for_healthz(&client, addr).await;
    let base = format!("http://{}", addr);

    let ready = client
        .get(format!("{base}/readyz"))
        .send()
        .await
        .expect("readyz should respond");
    assert_eq!(ready.status(), StatusCode::OK);

    // Admin writes need the shared secret.
    let unauthenticated = client
        .post(format!("{base}/v1/admin/lines"))
        .json(&json!({"name": "Linha 1 - Azul", "code": "line1", "color": "#0255A5"}))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);
    let body: Value = unauthenticated.json().await.expect("error body should be JSON");
    assert_eq!(body["code"], "ERR_AUTH_REQUIRED");

    let created: Value = admin_post(
        &client,
        &format!("{base}/v1/admin/lines"),
        json!({"name": "Linha 1 - Azul", "code": "line1", "color": "#0255A5"}),
        StatusCode::CREATED,
    )
    .await;
    let line_id = created["line"]["id"].as_i64().expect("line id should be set");
    assert_eq!(created["line"]["color"], "#0255a5");
    assert_eq!(created["status"]["status"], "normal");
    assert_eq!(created["status"]["is_current"], true);

    let duplicate = client
        .post(format!("{base}/v1/admin/lines"))
        .header("x-transit-admin-secret", ADMIN_SECRET)
        .json(&json!({"name": "Other", "code": "line1", "color": "#000"}))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(duplicate.status(), StatusCode::CONFLICT);

    let station: Value = admin_post(
        &client,
        &format!("{base}/v1/admin/stations"),
        json!({"line_id": line_id, "name": "Luz", "position": 1}),
        StatusCode::CREATED,
    )
    .await;
    let station_id = station["id"].as_i64().expect("station id should be set");

    let stations: Value = get_json(&client, &format!("{base}/v1/stations?line_id={line_id}")).await;
    assert_eq!(stations.as_array().map(Vec::len), Some(1));

    // Warm the line list view so later reads prove invalidation.
    let lines: Value = get_json(&client, &format!("{base}/v1/lines")).await;
    assert_eq!(lines[0]["status"], "normal");

    for i in 0..3 {
        let report: Value = submit(
            &client,
            &base,
            "10.0.0.1",
            json!({"line_id": line_id, "station_id": station_id, "issue_type": "delay", "description": " trens lentos "}),
            StatusCode::CREATED,
        )
        .await;
        assert_eq!(report["report"]["status"], "delayed");
        assert_eq!(report["report"]["description"], "trens lentos");
        if i == 2 {
            assert_eq!(report["status_change"]["status"], "delayed");
        } else {
            assert!(report.get("status_change").is_none());
        }
    }

    let denied = client
        .post(format!("{base}/v1/reports"))
        .header("x-forwarded-for", "10.0.0.1")
        .json(&json!({"line_id": line_id, "issue_type": "delay"}))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(denied.status(), StatusCode::TOO_MANY_REQUESTS);
    let denied: Value = denied.json().await.expect("error body should be JSON");
    assert_eq!(denied["code"], "ERR_RATE_LIMITED");
    assert_eq!(denied["detail"]["count"], 3);

    let lines: Value = get_json(&client, &format!("{base}/v1/lines")).await;
    assert_eq!(lines[0]["status"], "delayed");
    let delayed: Value = get_json(&client, &format!("{base}/v1/lines?status=delayed")).await;
    assert_eq!(delayed.as_array().map(Vec::len), Some(1));

    let invalid = client
        .post(format!("{base}/v1/reports"))
        .header("x-forwarded-for", "10.0.0.9")
        .json(&json!({"line_id": line_id, "issue_type": "flooded"}))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let mismatched = client
        .post(format!("{base}/v1/reports"))
        .header("x-forwarded-for", "10.0.0.9")
        .json(&json!({"line_id": line_id, "issue_type": "crowded", "status": "stopped"}))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(mismatched.status(), StatusCode::BAD_REQUEST);

    submit(
        &client,
        &base,
        "10.0.0.2",
        json!({"line_id": line_id, "issue_type": "stopped"}),
        StatusCode::CREATED,
    )
    .await;
    let fifth: Value = submit(
        &client,
        &base,
        "10.0.0.2",
        json!({"line_id": line_id, "issue_type": "stopped"}),
        StatusCode::CREATED,
    )
    .await;
    assert_eq!(fifth["status_change"]["status"], "stopped");

    let detail: Value = get_json(&client, &format!("{base}/v1/lines/line1")).await;
    assert_eq!(detail["code"], "line1");
    assert_eq!(detail["current_status"]["status"], "stopped");
    assert_eq!(detail["reports"].as_array().map(Vec::len), Some(5));
    assert_eq!(detail["stations"][0]["name"], "Luz");

    let missing = client
        .get(format!("{base}/v1/lines/line99"))
        .send()
        .await
        .expect("request should complete");
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);

    let overridden: Value = admin_post(
        &client,
        &format!("{base}/v1/admin/lines/{line_id}/status"),
        json!({"status": "normal", "message": "circulação normalizada"}),
        StatusCode::CREATED,
    )
    .await;
    assert_eq!(overridden["status"], "normal");
    assert_eq!(overridden["message"], "circulação normalizada");

    let history: Value =
        get_json(&client, &format!("{base}/v1/lines/line1/status-history")).await;
    let history = history.as_array().cloned().unwrap_or_default();
    assert_eq!(history.len(), 4);
    assert_eq!(
        history
            .iter()
            .filter(|record| record["is_current"] == true)
            .count(),
        1
    );
    assert!(
        history
            .iter()
            .filter(|record| record["is_current"] == false)
            .all(|record| !record["ended_at"].is_null())
    );

    let stats: Value = get_json(&client, &format!("{base}/v1/statistics?window=24h")).await;
    assert_eq!(stats["window"], "24h");
    assert_eq!(stats["trend_window"], "7d");
    assert_eq!(stats["issues_by_line"][0]["value"], 5);
    assert_eq!(stats["issues_by_type"][0]["name"], "delay");
    assert_eq!(stats["issues_by_type"][0]["value"], 3);

    let recent = client
        .get(format!("{base}/v1/reports/recent?limit=2"))
        .header("x-transit-admin-secret", ADMIN_SECRET)
        .header("x-transit-request-id", "req_smoke_recent")
        .send()
        .await
        .expect("request should complete");
    assert_eq!(recent.status(), StatusCode::OK);
    let recent: Value = recent.json().await.expect("body should be JSON");
    let recent = recent.as_array().cloned().unwrap_or_default();
    assert_eq!(recent.len(), 2);
    assert_eq!(recent[0]["line_code"], "line1");
    let newest_id = recent[0]["id"].as_i64().expect("report id should be set");

    let deleted = client
        .delete(format!("{base}/v1/admin/reports/{newest_id}"))
        .header("x-transit-admin-secret", ADMIN_SECRET)
        .send()
        .await
        .expect("request should complete");
    assert_eq!(deleted.status(), StatusCode::OK);
    let deleted_again = client
        .delete(format!("{base}/v1/admin/reports/{newest_id}"))
        .header("x-transit-admin-secret", ADMIN_SECRET)
        .send()
        .await
        .expect("request should complete");
    assert_eq!(deleted_again.status(), StatusCode::NOT_FOUND);

    let stats: Value = get_json(&client, &format!("{base}/v1/statistics?window=24h")).await;
    assert_eq!(stats["issues_by_line"][0]["value"], 4);

    let metrics = client
        .get(format!("{base}/metrics"))
        .send()
        .await
        .expect("metrics should respond")
        .text()
        .await
        .expect("metrics body should be text");
    assert!(metrics.contains("transit_gateway_reports_total"));
    assert!(metrics.contains("transit_gateway_status_transitions_total"));

    let _ = shutdown.send(());
    let _ = task.await;

    let _ = sqlx::query(&format!("DROP SCHEMA {} CASCADE", schema))
        .execute(&admin_pool)
        .await;
    admin_pool.close().await;

    let logs = String::from_utf8(
        log_buf
            .lock()
            .expect("log lock should be available")
            .clone(),
    )
    .unwrap_or_default();
    assert!(
        logs.contains("report accepted"),
        "logs should record accepted reports; logs:\n{}",
        logs
    );
    assert!(
        !logs.contains(ADMIN_SECRET),
        "logs must not contain the admin secret; logs:\n{}",
        logs
    );
}

async fn submit(
    client: &reqwest::Client,
    base: &str,
    forwarded_for: &str,
    body: Value,
    expected: StatusCode,
) -> Value {
    let response = client
        .post(format!("{base}/v1/reports"))
        .header("x-forwarded-for", forwarded_for)
        .json(&body)
        .send()
        .await
        .expect("report request should complete");
    assert_eq!(response.status(), expected);
    response.json().await.expect("report body should be JSON")
}

async fn admin_post(
    client: &reqwest::Client,
    url: &str,
    body: Value,
    expected: StatusCode,
) -> Value {
    let response = client
        .post(url)
        .header("x-transit-admin-secret", ADMIN_SECRET)
        .json(&body)
        .send()
        .await
        .expect("admin request should complete");
    assert_eq!(response.status(), expected, "unexpected status for {}", url);
    response.json().await.expect("admin body should be JSON")
}

async fn get_json(client: &reqwest::Client, url: &str) -> Value {
    let response = client
        .get(url)
        .send()
        .await
        .expect("request should complete");
    assert_eq!(response.status(), StatusCode::OK, "unexpected status for {}", url);
    response.json().await.expect("body should be JSON")
}

async fn spawn_server(
    app: Router,
) -> (SocketAddr, oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    (addr, shutdown_tx, handle)
}

async fn wait_for_healthz(client: &reqwest::Client, addr: SocketAddr) {
    let url = format!("http://{}/healthz", addr);

    for _ in 0..50 {
        if let Ok(response) = client.get(&url).send().await
            && response.status().is_success()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    panic!("server did not become ready at {}", url);
}

#[derive(Clone)]
struct TestWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut lock = self
            .buf
            .lock()
            .map_err(|_| std::io::Error::other("log mutex poisoned"))?;
        lock.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

fn init_test_tracing() -> Arc<Mutex<Vec<u8>>> {
    static LOG_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();

    LOG_BUF
        .get_or_init(|| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let make_writer = {
                let buf = buf.clone();
                move || TestWriter { buf: buf.clone() }
            };

            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .with_ansi(false)
                .with_writer(make_writer)
                .finish();

            tracing::subscriber::set_global_default(subscriber)
                .expect("global tracing subscriber should be set once");

            buf
        })
        .clone()
}
