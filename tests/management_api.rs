//! End-to-end tests for the management API, over the router and over a real
//! mTLS listener.

use agentgate::actions::{Action, Platform};
use agentgate::audit::AuditStage;
use agentgate::auth::signature_header_value;
use agentgate::exec::{ExecutionError, ScriptOutput, ScriptRunner};
use agentgate::rotation::CertRotator;
use agentgate::server::{self, COMMAND_PATH, HANDSHAKE_PATH};
use agentgate::tls::{load_certs, load_private_key, TlsReloader};
use agentgate::{CommandHandler, Config};
use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use serde_json::{json, Value};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;
use tower::ServiceExt;

const SECRET: &str = "integration-secret";
const VAULT_TOKEN: &str = "s.integration";
const VAULT_PATH: &str = "secret/data/agentgate/tls";

struct MockRunner {
    calls: AtomicUsize,
}

impl MockRunner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ScriptRunner for MockRunner {
    async fn run_script_safe(
        &self,
        _action: Action,
        _args: &[String],
    ) -> Result<ScriptOutput, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ScriptOutput::new("ok", ""))
    }

    fn platform(&self) -> Platform {
        Platform::Unix
    }

    fn script_path(&self, action: Action) -> PathBuf {
        PathBuf::from("scripts").join(format!("{}.sh", action.name().replace('_', "-")))
    }
}

fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures/tls")
        .join(name)
}

fn env_config(dir: &TempDir, vars: &[(&str, &str)]) -> Config {
    let vars: Vec<(String, String)> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let mut config = Config::default().apply_env_overrides_from(|name| {
        vars.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    });
    config.audit.path = dir.path().join("management.log");
    config
}

fn hmac_app(config: &Config, runner: Arc<MockRunner>) -> (Router, Arc<CommandHandler>) {
    let handler = Arc::new(CommandHandler::from_config(
        config,
        runner,
        Arc::new(CertRotator::default()),
    ));
    (
        server::router(handler.clone(), config.server.body_limit_bytes),
        handler,
    )
}

fn handshake_body(id: &str, action: &str, auto_execute: bool) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": id,
        "nonce": uuid::Uuid::new_v4().to_string(),
        "timestamp": chrono::Utc::now().timestamp(),
        "action": action,
        "params": {"args": ["web"]},
        "auto_execute": auto_execute,
    }))
    .unwrap()
}

async fn post_signed(app: &Router, path: &str, body: Vec<u8>) -> (StatusCode, Value) {
    let signature = signature_header_value(SECRET.as_bytes(), &body);
    let resp = app
        .clone()
        .oneshot(
            Request::post(path)
                .header("content-type", "application/json")
                .header("x-signature", signature)
                .body(Body::from(body))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_suggestion_then_replay_rejected() {
    let dir = TempDir::new().unwrap();
    let config = env_config(&dir, &[("AGENT_SHARED_SECRET", SECRET)]);
    let runner = MockRunner::new();
    let (app, _) = hmac_app(&config, runner.clone());

    let body = handshake_body("scenario-a", "fetch_logs", false);
    let (status, reply) = post_signed(&app, HANDSHAKE_PATH, body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["status"], "suggested");
    assert_eq!(reply["suggestion"]["script"], "scripts/fetch-logs.sh");
    assert_eq!(reply["suggestion"]["args"], json!(["web"]));

    let (status, reply) = post_signed(&app, HANDSHAKE_PATH, body).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(reply["error"], "invalid or replayed request");
    assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_auto_execute_until_circuit_opens() {
    let dir = TempDir::new().unwrap();
    let config = env_config(
        &dir,
        &[("AGENT_SHARED_SECRET", SECRET), ("AUTO_CIRCUIT_MAX", "3")],
    );
    let runner = MockRunner::new();
    let (app, handler) = hmac_app(&config, runner.clone());

    for i in 0..3 {
        let body = handshake_body(&format!("scenario-d-{i}"), "restart_service", true);
        let (status, reply) = post_signed(&app, HANDSHAKE_PATH, body).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply, json!({"status": "ok", "output": {"stdout": "ok", "stderr": ""}}));
    }

    let body = handshake_body("scenario-d-3", "restart_service", true);
    let (status, reply) = post_signed(&app, HANDSHAKE_PATH, body).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(reply["error"], "auto-exec circuit open");
    assert_eq!(runner.calls.load(Ordering::SeqCst), 3);

    let stages: Vec<AuditStage> = handler
        .audit_log()
        .entries_for("scenario-d-0")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.stage)
        .collect();
    assert_eq!(
        stages,
        vec![
            AuditStage::Received,
            AuditStage::Executing,
            AuditStage::Finished
        ]
    );
}

#[tokio::test]
async fn test_text_command_suggestion_over_router() {
    let dir = TempDir::new().unwrap();
    let config = env_config(&dir, &[]);
    let (app, _) = hmac_app(&config, MockRunner::new());

    let body = serde_json::to_vec(&json!({
        "id": "text-1",
        "nonce": "text-nonce-1",
        "timestamp": chrono::Utc::now().timestamp(),
        "text": "Restart service billing",
    }))
    .unwrap();
    let (status, reply) = post_signed(&app, COMMAND_PATH, body).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        reply["suggestion"],
        json!({"action": "restart_service", "params": {"args": ["billing"]}})
    );
}

fn client_config(agent: Option<&str>) -> Arc<ClientConfig> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let mut roots = RootCertStore::empty();
    for ca in load_certs(&fixture("ca.crt")).unwrap() {
        roots.add(ca).unwrap();
    }
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots);

    let config = match agent {
        Some(name) => builder
            .with_client_auth_cert(
                load_certs(&fixture(&format!("{name}.crt"))).unwrap(),
                load_private_key(&fixture(&format!("{name}.key"))).unwrap(),
            )
            .unwrap(),
        None => builder.with_no_client_auth(),
    };
    Arc::new(config)
}

async fn post_tls(
    addr: SocketAddr,
    client: Arc<ClientConfig>,
    path: &str,
    body: Vec<u8>,
) -> anyhow::Result<(StatusCode, Value)> {
    let tcp = TcpStream::connect(addr).await?;
    let tls = TlsConnector::from(client)
        .connect(ServerName::try_from("localhost")?, tcp)
        .await?;

    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tls)).await?;
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let req = hyper::Request::post(path)
        .header(hyper::header::HOST, "localhost")
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))?;
    let resp = sender.send_request(req).await?;
    let status = resp.status();
    let bytes = resp.into_body().collect().await?.to_bytes();
    Ok((status, serde_json::from_slice(&bytes)?))
}

/// Vault stand-in serving the fixture bundle as a KV-v2 secret
async fn mock_vault() -> String {
    let secret = json!({
        "data": {
            "data": {
                "server_key": fs::read_to_string(fixture("server.key")).unwrap(),
                "server_cert": fs::read_to_string(fixture("server.crt")).unwrap(),
                "ca_cert": fs::read_to_string(fixture("ca.crt")).unwrap(),
            },
            "metadata": {"version": 7}
        }
    });
    let app = Router::new().route(
        &format!("/v1/{VAULT_PATH}"),
        axum::routing::get(move |headers: axum::http::HeaderMap| {
            let secret = secret.clone();
            async move {
                match headers.get("x-vault-token").and_then(|v| v.to_str().ok()) {
                    Some(VAULT_TOKEN) => Ok(axum::Json(secret)),
                    _ => Err(StatusCode::FORBIDDEN),
                }
            }
        }),
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

struct MtlsServer {
    addr: SocketAddr,
    dir: TempDir,
    runner: Arc<MockRunner>,
    reloader: Arc<TlsReloader>,
    _shutdown: tokio::sync::oneshot::Sender<()>,
}

/// Full listener with scratch copies of the TLS material
async fn start_mtls_server(vault_addr: &str) -> MtlsServer {
    let dir = TempDir::new().unwrap();
    for name in ["server.key", "server.crt", "ca.crt"] {
        fs::copy(fixture(name), dir.path().join(name)).unwrap();
    }
    let path = |name: &str| dir.path().join(name).display().to_string();

    let mut config = env_config(
        &dir,
        &[
            ("MTLS_REQUIRED", "true"),
            ("MTLS_CLIENT_CN_ALLOWLIST", "agent-1, ops-console"),
            ("MTLS_SERVER_KEY_PATH", &path("server.key")),
            ("MTLS_SERVER_CERT_PATH", &path("server.crt")),
            ("MTLS_CA_PATH", &path("ca.crt")),
            ("VAULT_ADDR", vault_addr),
            ("VAULT_TOKEN", VAULT_TOKEN),
            ("VAULT_CERT_PATH", VAULT_PATH),
        ],
    );
    config.validate().unwrap();

    let reloader = Arc::new(TlsReloader::load(config.tls_paths().unwrap()).unwrap());
    let rotator = CertRotator::new(config.vault_timeout()).with_reload_hook(reloader.clone());
    let runner = MockRunner::new();
    let handler = Arc::new(CommandHandler::from_config(
        &config,
        runner.clone(),
        Arc::new(rotator),
    ));
    let app = server::router(handler, config.server.body_limit_bytes);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(server::serve(listener, app, Some(reloader.clone()), async move {
        let _ = rx.await;
    }));

    MtlsServer {
        addr,
        dir,
        runner,
        reloader,
        _shutdown: tx,
    }
}

#[tokio::test]
async fn test_mtls_peer_not_in_allowlist_forbidden() {
    let server = start_mtls_server("http://127.0.0.1:1").await;

    // Signature is irrelevant in mTLS mode
    let body = handshake_body("scenario-f", "fetch_logs", false);
    let (status, reply) = post_tls(server.addr, client_config(Some("agent-2")), HANDSHAKE_PATH, body)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(reply["error"], "invalid auth");

    let body = handshake_body("scenario-f-ok", "restart_service", true);
    let (status, reply) = post_tls(server.addr, client_config(Some("agent-1")), HANDSHAKE_PATH, body)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(reply["status"], "ok");
    assert_eq!(server.runner.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mtls_rejects_client_without_certificate() {
    let server = start_mtls_server("http://127.0.0.1:1").await;
    let body = handshake_body("no-cert", "fetch_logs", false);

    let result = post_tls(server.addr, client_config(None), HANDSHAKE_PATH, body).await;
    assert!(result.is_err());
    assert_eq!(server.runner.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_mtls_audit_records_client_identity() {
    let server = start_mtls_server("http://127.0.0.1:1").await;
    let body = handshake_body("audit-peer", "fetch_logs", false);

    let (status, _) = post_tls(server.addr, client_config(Some("agent-1")), HANDSHAKE_PATH, body)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);

    let log = fs::read_to_string(server.dir.path().join("management.log")).unwrap();
    let received: Value = serde_json::from_str(log.lines().next().unwrap()).unwrap();
    assert_eq!(received["id"], "audit-peer");
    assert_eq!(received["origin"], "127.0.0.1");
    assert_eq!(received["client"]["subject"], "agent-1");
    let fingerprint = received["client"]["fingerprint"].as_str().unwrap();
    assert_eq!(fingerprint.split(':').count(), 32);
}

#[tokio::test]
async fn test_rotate_certs_from_vault_reloads_listener() {
    let vault = mock_vault().await;
    let server = start_mtls_server(&vault).await;
    let before = server.reloader.current();

    // Old material on disk is replaced by the vault copy
    fs::write(server.dir.path().join("ca.crt"), "stale").unwrap();

    let body = handshake_body("scenario-e", "rotate_certs", true);
    let (status, reply) = post_tls(server.addr, client_config(Some("agent-1")), HANDSHAKE_PATH, body)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        reply,
        json!({"status": "ok", "result": {"rotated": true, "reloaded": true}})
    );
    assert!(!Arc::ptr_eq(&before, &server.reloader.current()));

    assert_eq!(
        fs::read_to_string(server.dir.path().join("ca.crt")).unwrap(),
        fs::read_to_string(fixture("ca.crt")).unwrap()
    );

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = |name: &str| {
            fs::metadata(server.dir.path().join(name))
                .unwrap()
                .permissions()
                .mode()
                & 0o777
        };
        assert_eq!(mode("server.key"), 0o600);
        assert_eq!(mode("server.crt"), 0o644);
        assert_eq!(mode("ca.crt"), 0o644);
    }

    // New connections are served with the reloaded context
    let body = handshake_body("after-rotation", "fetch_logs", false);
    let (status, _) = post_tls(server.addr, client_config(Some("agent-1")), HANDSHAKE_PATH, body)
        .await
        .unwrap();
    assert_eq!(status, StatusCode::OK);
}
