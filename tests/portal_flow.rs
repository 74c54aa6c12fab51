//! End-to-end runs against an in-process fake portal.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

use portal_keeper::core::config::{PortalConfig, PortalEndpoints};
use portal_keeper::core::error::HandshakeError;
use portal_keeper::portal::{
    CaptchaAcquirer, ConnectivityCheck, LocationResolver, NetworkProbe, PortalSession,
};
use portal_keeper::{
    codec, AppState, CallbackResult, CaptchaCode, CaptchaImage, CaptchaSolver, RetryBudget,
    SolveError, SolverKind, TickOutcome,
};

const SESSION_COOKIE: &str = "JSESSIONID=fake-portal-7f3a";
const EXPECTED_CODE: &str = "7K2M";
const PNG_MAGIC: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

#[derive(Default)]
struct FakePortal {
    online: AtomicBool,
    captcha_broken: AtomicBool,
    login_again_once: AtomicBool,
    password: Mutex<String>,
    captcha_fetches: AtomicU32,
    checks_with_cookie: AtomicU32,
    logins: AtomicU32,
    last_login: Mutex<HashMap<String, String>>,
}

type Shared = Arc<FakePortal>;

async fn generate_204(State(portal): State<Shared>) -> Response {
    if portal.online.load(Ordering::SeqCst) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        (StatusCode::OK, "<html>captive</html>").into_response()
    }
}

async fn gateway() -> Response {
    (
        StatusCode::FOUND,
        [(
            header::LOCATION,
            "/eportal/?wlanuserip=10.21.3.4&wlanacname=NFV-BASE&wlanusermac=0a1b2c3d4e5f&wlanacip=10.10.10.1&wlanuserip=ignored",
        )],
    )
        .into_response()
}

async fn captcha(State(portal): State<Shared>) -> Response {
    portal.captcha_fetches.fetch_add(1, Ordering::SeqCst);
    if portal.captcha_broken.load(Ordering::SeqCst) {
        return (StatusCode::INTERNAL_SERVER_ERROR, "upstream busy").into_response();
    }
    (
        [
            (header::SET_COOKIE, format!("{}; Path=/", SESSION_COOKIE)),
            (header::CONTENT_TYPE, "image/png".to_string()),
        ],
        PNG_MAGIC.to_vec(),
    )
        .into_response()
}

async fn captcha_check(
    State(portal): State<Shared>,
    headers: HeaderMap,
    Query(q): Query<HashMap<String, String>>,
) -> String {
    let cookie = headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let callback = q.get("callback").cloned().unwrap_or_default();
    let result = if !cookie.contains(SESSION_COOKIE) {
        CallbackResult::new(0, "session expired")
    } else {
        portal.checks_with_cookie.fetch_add(1, Ordering::SeqCst);
        if q.get("captcha").map(String::as_str) == Some(EXPECTED_CODE) {
            CallbackResult::new(1, "captcha ok")
        } else {
            CallbackResult::new(0, "captcha error")
        }
    };
    codec::encode(&callback, &result)
}

async fn login(State(portal): State<Shared>, Query(q): Query<HashMap<String, String>>) -> String {
    portal.logins.fetch_add(1, Ordering::SeqCst);
    *portal.last_login.lock().unwrap() = q.clone();
    let callback = q.get("callback").cloned().unwrap_or_default();

    let result = if portal.login_again_once.swap(false, Ordering::SeqCst) {
        CallbackResult::new(0, "Session timed out, please Login Again")
    } else if q.get("user_password") != Some(&*portal.password.lock().unwrap()) {
        CallbackResult::new(0, "password incorrect")
    } else {
        portal.online.store(true, Ordering::SeqCst);
        CallbackResult::new(1, "Portal协议认证成功！")
    };
    codec::encode(&callback, &result)
}

async fn spawn_portal(portal: Shared) -> SocketAddr {
    let app = Router::new()
        .route("/generate_204", get(generate_204))
        .route("/", get(gateway))
        .route("/eportal/captcha", get(captcha))
        .route("/eportal/portal/captcha/check", get(captcha_check))
        .route("/eportal/portal/login", get(login))
        .with_state(portal);
    spawn_router(app).await
}

async fn spawn_router(app: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Reads every image as the same code; `bad_reads` garbage answers first.
struct ScriptedSolver {
    budget: RetryBudget,
    bad_reads: AtomicU32,
}

impl ScriptedSolver {
    fn new(bad_reads: u32) -> Arc<Self> {
        Arc::new(Self {
            budget: RetryBudget::new(5),
            bad_reads: AtomicU32::new(bad_reads),
        })
    }
}

#[async_trait]
impl CaptchaSolver for ScriptedSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Cnn
    }

    fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    async fn solve(&self, image: &CaptchaImage) -> Result<CaptchaCode, SolveError> {
        assert_eq!(image.mime_type(), "image/png");
        let garbage = self
            .bad_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let raw = if garbage { "?!" } else { "7k2m" };
        self.budget.settle(
            "scripted",
            CaptchaCode::parse(raw).ok_or_else(|| format!("unreadable: {:?}", raw)),
        )
    }
}

fn config_for(addr: SocketAddr, dir: &std::path::Path) -> PortalConfig {
    let mut config = PortalConfig {
        username: Some("202308010203".into()),
        password: Some("hunter2".into()),
        endpoints: PortalEndpoints::with_base(&format!("http://{}", addr)),
        log_dir: dir.to_path_buf(),
        ..PortalConfig::default()
    };
    config.timeouts.probe = Duration::from_secs(2);
    config
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("portal_keeper=debug")
        .with_test_writer()
        .try_init();
}

async fn setup(password: &str) -> (Shared, SocketAddr, tempfile::TempDir) {
    init_logging();
    let portal = Arc::new(FakePortal::default());
    *portal.password.lock().unwrap() = password.to_string();
    let addr = spawn_portal(Arc::clone(&portal)).await;
    (portal, addr, tempfile::tempdir().unwrap())
}

#[tokio::test]
async fn test_offline_run_logs_in_and_exits_zero() {
    let (portal, addr, dir) = setup("hunter2").await;
    let state = AppState::new(config_for(addr, dir.path()), ScriptedSolver::new(1));

    let outcome = state.run_once().await;

    assert_eq!(outcome, TickOutcome::LoggedIn);
    assert_eq!(outcome.exit_code(), 0);
    // One unreadable image, then a good one.
    assert_eq!(portal.captcha_fetches.load(Ordering::SeqCst), 2);
    assert_eq!(portal.checks_with_cookie.load(Ordering::SeqCst), 1);

    let login = portal.last_login.lock().unwrap().clone();
    assert_eq!(login["callback"], "dr1004");
    assert_eq!(login["user_account"], ",0,202308010203");
    assert_eq!(login["wlan_user_ip"], "10.21.3.4");
    assert_eq!(login["wlan_user_mac"], "0a1b2c3d4e5f");
    assert_eq!(login["wlan_ac_ip"], "10.10.10.1");
    assert_eq!(login["wlan_ac_name"], "NFV-BASE");
    assert_eq!(login["jsVersion"], "4.2.1");
}

#[tokio::test]
async fn test_already_online_skips_handshake() {
    let (portal, addr, dir) = setup("hunter2").await;
    portal.online.store(true, Ordering::SeqCst);
    let state = AppState::new(config_for(addr, dir.path()), ScriptedSolver::new(0));

    assert_eq!(state.run_once().await, TickOutcome::AlreadyOnline);
    assert_eq!(portal.captcha_fetches.load(Ordering::SeqCst), 0);
    assert_eq!(portal.logins.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_wrong_password_exits_one() {
    let (portal, addr, dir) = setup("something-else").await;
    let state = AppState::new(config_for(addr, dir.path()), ScriptedSolver::new(0));

    let outcome = state.run_once().await;

    match &outcome {
        TickOutcome::Failed(reason) => assert!(reason.contains("password incorrect"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(portal.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_login_again_restarts_with_fresh_captcha() {
    let (portal, addr, dir) = setup("hunter2").await;
    portal.login_again_once.store(true, Ordering::SeqCst);
    let state = AppState::new(config_for(addr, dir.path()), ScriptedSolver::new(0));

    assert_eq!(state.run_once().await, TickOutcome::LoggedIn);
    assert_eq!(portal.logins.load(Ordering::SeqCst), 2);
    assert_eq!(portal.captcha_fetches.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_credentials_fail_before_any_request() {
    let (portal, addr, dir) = setup("hunter2").await;
    let mut config = config_for(addr, dir.path());
    config.password = None;
    let state = AppState::new(config, ScriptedSolver::new(0));

    let outcome = state.run_once().await;
    assert!(matches!(outcome, TickOutcome::Failed(_)));
    assert_eq!(portal.captcha_fetches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_resolver_rejects_non_redirect_gateway() {
    let (_portal, addr, dir) = setup("hunter2").await;
    let config = config_for(addr, dir.path());
    let session = tokio_test::assert_ok!(PortalSession::new(&config));

    // The probe endpoint answers 200, not a redirect.
    let resolver = LocationResolver::new(config.endpoints.probe_url.clone(), Duration::from_secs(2));
    let err = tokio_test::assert_err!(resolver.resolve(&session).await);
    assert!(err.to_string().contains("200"), "{}", err);

    let resolver = LocationResolver::new(config.endpoints.gateway_url.clone(), Duration::from_secs(2));
    let params = tokio_test::assert_ok!(resolver.resolve(&session).await);
    assert_eq!(params.get("wlanuserip"), Some("10.21.3.4"));
    assert_eq!(params.len(), 4);
}

#[tokio::test]
async fn test_session_cookie_is_kept_between_requests() {
    let (_portal, addr, dir) = setup("hunter2").await;
    let config = config_for(addr, dir.path());
    let session = PortalSession::new(&config).unwrap();

    let check_url: reqwest::Url = config.endpoints.captcha_check_url.parse().unwrap();
    assert_eq!(session.cookies_for(&check_url), None);

    session
        .client()
        .get(&config.endpoints.captcha_url)
        .send()
        .await
        .unwrap();
    assert_eq!(session.cookies_for(&check_url).as_deref(), Some(SESSION_COOKIE));
}

#[tokio::test]
async fn test_probe_treats_unreachable_or_slow_target_as_offline() {
    init_logging();
    let client = reqwest::Client::builder().no_proxy().build().unwrap();

    let refused = NetworkProbe::new(
        client.clone(),
        "http://127.0.0.1:1/generate_204",
        Duration::from_secs(2),
    );
    assert!(!refused.is_online().await);

    let app = Router::new().route(
        "/generate_204",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            StatusCode::NO_CONTENT
        }),
    );
    let addr = spawn_router(app).await;
    let slow = NetworkProbe::new(
        client,
        format!("http://{}/generate_204", addr),
        Duration::from_millis(200),
    );
    assert!(!slow.is_online().await);
}

#[tokio::test]
async fn test_captcha_fetch_fails_on_error_status_or_empty_body() {
    init_logging();
    let app = Router::new()
        .route(
            "/broken",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "oops") }),
        )
        .route("/empty", get(|| async { StatusCode::OK }));
    let addr = spawn_router(app).await;
    let dir = tempfile::tempdir().unwrap();
    let session = PortalSession::new(&config_for(addr, dir.path())).unwrap();

    let broken = CaptchaAcquirer::new(format!("http://{}/broken", addr), Duration::from_secs(2));
    match broken.fetch(&session).await {
        Err(HandshakeError::CaptchaFetchFailed(msg)) => assert!(msg.contains("500"), "{}", msg),
        other => panic!("expected CaptchaFetchFailed, got {:?}", other),
    }

    let empty = CaptchaAcquirer::new(format!("http://{}/empty", addr), Duration::from_secs(2));
    assert!(matches!(
        empty.fetch(&session).await,
        Err(HandshakeError::CaptchaFetchFailed(_))
    ));
}

#[tokio::test]
async fn test_broken_captcha_endpoint_exhausts_transport_budget() {
    let (portal, addr, dir) = setup("hunter2").await;
    portal.captcha_broken.store(true, Ordering::SeqCst);
    let state = AppState::new(config_for(addr, dir.path()), ScriptedSolver::new(0));

    let outcome = state.run_once().await;

    match &outcome {
        TickOutcome::Failed(reason) => assert!(reason.contains("transport failures"), "{}", reason),
        other => panic!("expected failure, got {:?}", other),
    }
    // Default budget of 3 retries, the fourth failure gives up.
    assert_eq!(portal.captcha_fetches.load(Ordering::SeqCst), 4);
    assert_eq!(portal.logins.load(Ordering::SeqCst), 0);
}
