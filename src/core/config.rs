use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::error::HandshakeError;
use crate::solver::SolverKind;

// ---------------------------------------------------------------------------
// File config (portal-keeper.json); every field falls back to an env var
// ---------------------------------------------------------------------------

pub const ENV_CONFIG_PATH: &str = "PORTAL_KEEPER_CONFIG";
pub const ENV_USERNAME: &str = "PORTAL_USERNAME";
pub const ENV_PASSWORD: &str = "PORTAL_PASSWORD";
pub const ENV_SOLVER: &str = "PORTAL_SOLVER";
pub const ENV_SOLVER_MODEL: &str = "PORTAL_SOLVER_MODEL";
pub const ENV_SOLVER_MAX_RETRIES: &str = "PORTAL_SOLVER_MAX_RETRIES";
pub const ENV_TRANSPORT_RETRIES: &str = "PORTAL_TRANSPORT_RETRIES";
pub const ENV_MAX_VERIFY_REJECTIONS: &str = "PORTAL_MAX_VERIFY_REJECTIONS";
pub const ENV_CHECK_INTERVAL_MINS: &str = "PORTAL_CHECK_INTERVAL_MINS";
pub const ENV_LOG_DIR: &str = "PORTAL_LOG_DIR";
pub const ENV_USE_SYSTEM_PROXY: &str = "PORTAL_USE_SYSTEM_PROXY";
pub const ENV_VERIFY_TLS: &str = "PORTAL_VERIFY_TLS";
pub const ENV_OPENAI_BASE_URL: &str = "OPENAI_BASE_URL";
pub const ENV_OPENAI_API_KEY: &str = "OPENAI_API_KEY";

/// Endpoint overrides (mirrors the `endpoints` key in portal-keeper.json).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct FileEndpoints {
    pub probe_url: Option<String>,
    pub gateway_url: Option<String>,
    pub captcha_url: Option<String>,
    pub captcha_check_url: Option<String>,
    pub login_url: Option<String>,
}

/// Per-request timeouts in seconds (mirrors the `timeouts` key).
#[derive(serde::Deserialize, Default, Clone, Debug)]
pub struct FileTimeouts {
    pub probe_secs: Option<u64>,
    pub gateway_secs: Option<u64>,
    pub captcha_secs: Option<u64>,
    pub check_secs: Option<u64>,
    pub login_secs: Option<u64>,
    pub solver_secs: Option<u64>,
}

/// Top-level config loaded from `portal-keeper.json`.
#[derive(serde::Deserialize, Default, Clone)]
pub struct FileConfig {
    pub username: Option<String>,
    /// Never logged.
    pub password: Option<String>,
    /// `manual`, `cnn` or `vlm`.
    pub solver: Option<String>,
    /// Model server URL for `cnn`, model name for `vlm`.
    pub solver_model: Option<String>,
    /// Negative means unbounded.
    pub solver_max_retries: Option<i64>,
    pub transport_retries: Option<i64>,
    pub max_verify_rejections: Option<i64>,
    pub check_interval_mins: Option<u64>,
    pub log_dir: Option<String>,
    pub use_system_proxy: Option<bool>,
    pub verify_tls: Option<bool>,
    pub llm_base_url: Option<String>,
    /// Explicit `""` means a key-less local endpoint.
    pub llm_api_key: Option<String>,
    #[serde(default)]
    pub endpoints: FileEndpoints,
    #[serde(default)]
    pub timeouts: FileTimeouts,
}

impl fmt::Debug for FileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileConfig")
            .field("username", &self.username)
            .field("solver", &self.solver)
            .field("solver_model", &self.solver_model)
            .field("endpoints", &self.endpoints)
            .finish_non_exhaustive()
    }
}

/// Load `portal-keeper.json` from standard locations.
///
/// Search order (first found wins):
/// 1. `PORTAL_KEEPER_CONFIG` env var path
/// 2. `./portal-keeper.json`
/// 3. `../portal-keeper.json`
/// 4. `<config dir>/portal-keeper/portal-keeper.json`
///
/// Missing file → `FileConfig::default()`. Parse error → warning + defaults.
pub fn load_file_config() -> FileConfig {
    let mut candidates = vec![
        PathBuf::from("portal-keeper.json"),
        PathBuf::from("../portal-keeper.json"),
    ];
    if let Some(dir) = dirs::config_dir() {
        candidates.push(dir.join("portal-keeper").join("portal-keeper.json"));
    }
    if let Ok(env_path) = std::env::var(ENV_CONFIG_PATH) {
        candidates.insert(0, PathBuf::from(env_path));
    }

    for path in &candidates {
        let Ok(contents) = std::fs::read_to_string(path) else {
            continue;
        };
        return match serde_json::from_str::<FileConfig>(&contents) {
            Ok(cfg) => {
                tracing::info!("portal-keeper.json loaded from {}", path.display());
                cfg
            }
            Err(e) => {
                tracing::warn!(
                    "portal-keeper.json parse error at {}: {}; using defaults",
                    path.display(),
                    e
                );
                FileConfig::default()
            }
        };
    }

    FileConfig::default()
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    let v = env_string(key)?.to_ascii_lowercase();
    Some(matches!(v.as_str(), "1" | "true" | "yes" | "on"))
}

fn non_blank(v: &Option<String>) -> Option<String> {
    v.as_ref()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Resolved config
// ---------------------------------------------------------------------------

pub const DEFAULT_PROBE_URL: &str = "http://connect.rom.miui.com/generate_204";
pub const DEFAULT_GATEWAY_URL: &str = "http://10.10.10.10/";
pub const DEFAULT_CAPTCHA_URL: &str = "https://login.csust.edu.cn:802/eportal/captcha";
pub const DEFAULT_CAPTCHA_CHECK_URL: &str =
    "https://login.csust.edu.cn:802/eportal/portal/captcha/check";
pub const DEFAULT_LOGIN_URL: &str = "https://login.csust.edu.cn:802/eportal/portal/login";
pub const DEFAULT_LLM_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortalEndpoints {
    /// Answers 204 when the internet is reachable.
    pub probe_url: String,
    /// Captive address that redirects to the portal with location params.
    pub gateway_url: String,
    pub captcha_url: String,
    pub captcha_check_url: String,
    pub login_url: String,
}

impl Default for PortalEndpoints {
    fn default() -> Self {
        Self {
            probe_url: DEFAULT_PROBE_URL.to_string(),
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            captcha_url: DEFAULT_CAPTCHA_URL.to_string(),
            captcha_check_url: DEFAULT_CAPTCHA_CHECK_URL.to_string(),
            login_url: DEFAULT_LOGIN_URL.to_string(),
        }
    }
}

impl PortalEndpoints {
    /// All portal endpoints rooted at one base URL (used against fake portals).
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            probe_url: format!("{}/generate_204", base),
            gateway_url: format!("{}/", base),
            captcha_url: format!("{}/eportal/captcha", base),
            captcha_check_url: format!("{}/eportal/portal/captcha/check", base),
            login_url: format!("{}/eportal/portal/login", base),
        }
    }

    fn apply(&mut self, file: &FileEndpoints) {
        let pairs = [
            (&mut self.probe_url, &file.probe_url),
            (&mut self.gateway_url, &file.gateway_url),
            (&mut self.captcha_url, &file.captcha_url),
            (&mut self.captcha_check_url, &file.captcha_check_url),
            (&mut self.login_url, &file.login_url),
        ];
        for (slot, value) in pairs {
            if let Some(v) = non_blank(value) {
                *slot = v;
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    pub probe: Duration,
    pub gateway: Duration,
    pub captcha: Duration,
    pub check: Duration,
    pub login: Duration,
    /// Upper bound for one model call (CNN server or VLM endpoint).
    pub solver: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            probe: Duration::from_secs(5),
            gateway: Duration::from_secs(6),
            captcha: Duration::from_secs(9),
            check: Duration::from_secs(9),
            login: Duration::from_secs(9),
            solver: Duration::from_secs(60),
        }
    }
}

impl Timeouts {
    fn apply(&mut self, file: &FileTimeouts) {
        let pairs = [
            (&mut self.probe, file.probe_secs),
            (&mut self.gateway, file.gateway_secs),
            (&mut self.captcha, file.captcha_secs),
            (&mut self.check, file.check_secs),
            (&mut self.login, file.login_secs),
            (&mut self.solver, file.solver_secs),
        ];
        for (slot, value) in pairs {
            if let Some(secs) = value.filter(|s| *s > 0) {
                *slot = Duration::from_secs(secs);
            }
        }
    }
}

/// Portal account credentials.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Clone)]
pub struct SolverSettings {
    pub kind: SolverKind,
    pub model: Option<String>,
    /// Negative means unbounded.
    pub max_retries: i64,
    pub llm_base_url: String,
    pub llm_api_key: Option<String>,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            kind: SolverKind::Manual,
            model: None,
            max_retries: 5,
            llm_base_url: DEFAULT_LLM_BASE_URL.to_string(),
            llm_api_key: None,
        }
    }
}

impl fmt::Debug for SolverSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SolverSettings")
            .field("kind", &self.kind)
            .field("model", &self.model)
            .field("max_retries", &self.max_retries)
            .field("llm_base_url", &self.llm_base_url)
            .field("llm_api_key_set", &self.llm_api_key.is_some())
            .finish()
    }
}

/// Fully resolved runtime configuration.
#[derive(Clone)]
pub struct PortalConfig {
    pub username: Option<String>,
    pub password: Option<String>,
    pub solver: SolverSettings,
    pub endpoints: PortalEndpoints,
    pub timeouts: Timeouts,
    /// Transport failures tolerated per handshake run; negative means unbounded.
    pub transport_retries: i64,
    /// CAPTCHA-check rejections tolerated per run; negative means unbounded.
    pub max_verify_rejections: i64,
    pub check_interval: Duration,
    pub log_dir: PathBuf,
    pub use_system_proxy: bool,
    pub verify_tls: bool,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            username: None,
            password: None,
            solver: SolverSettings::default(),
            endpoints: PortalEndpoints::default(),
            timeouts: Timeouts::default(),
            transport_retries: 3,
            max_verify_rejections: -1,
            check_interval: Duration::from_secs(5 * 60),
            log_dir: PathBuf::from("logs"),
            use_system_proxy: false,
            verify_tls: false,
        }
    }
}

impl fmt::Debug for PortalConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortalConfig")
            .field("username", &self.username)
            .field("password_set", &self.password.is_some())
            .field("solver", &self.solver)
            .field("endpoints", &self.endpoints)
            .field("transport_retries", &self.transport_retries)
            .field("max_verify_rejections", &self.max_verify_rejections)
            .field("check_interval", &self.check_interval)
            .field("log_dir", &self.log_dir)
            .finish_non_exhaustive()
    }
}

impl PortalConfig {
    /// File config → env vars → defaults.
    pub fn load() -> Result<Self, HandshakeError> {
        Self::resolve(&load_file_config())
    }

    pub fn resolve(file: &FileConfig) -> Result<Self, HandshakeError> {
        let mut cfg = PortalConfig::default();

        cfg.username = non_blank(&file.username).or_else(|| env_string(ENV_USERNAME));
        cfg.password = file
            .password
            .clone()
            .filter(|p| !p.is_empty())
            .or_else(|| std::env::var(ENV_PASSWORD).ok().filter(|p| !p.is_empty()));

        let solver_name = non_blank(&file.solver).or_else(|| env_string(ENV_SOLVER));
        if let Some(name) = solver_name {
            cfg.solver.kind = name.parse().map_err(HandshakeError::Config)?;
        }
        cfg.solver.model = non_blank(&file.solver_model).or_else(|| env_string(ENV_SOLVER_MODEL));
        if let Some(n) = file
            .solver_max_retries
            .or_else(|| env_parse(ENV_SOLVER_MAX_RETRIES))
        {
            cfg.solver.max_retries = n;
        }
        if let Some(u) = non_blank(&file.llm_base_url).or_else(|| env_string(ENV_OPENAI_BASE_URL)) {
            cfg.solver.llm_base_url = u;
        }
        // Present-but-empty in the file means "no key required".
        cfg.solver.llm_api_key = match &file.llm_api_key {
            Some(k) => Some(k.trim().to_string()),
            None => env_string(ENV_OPENAI_API_KEY),
        };

        if let Some(n) = file
            .transport_retries
            .or_else(|| env_parse(ENV_TRANSPORT_RETRIES))
        {
            cfg.transport_retries = n;
        }
        if let Some(n) = file
            .max_verify_rejections
            .or_else(|| env_parse(ENV_MAX_VERIFY_REJECTIONS))
        {
            cfg.max_verify_rejections = n;
        }
        let interval_mins = file
            .check_interval_mins
            .or_else(|| env_parse(ENV_CHECK_INTERVAL_MINS));
        if let Some(mins) = interval_mins {
            if mins == 0 {
                return Err(HandshakeError::Config(format!(
                    "{} must be at least 1 minute",
                    ENV_CHECK_INTERVAL_MINS
                )));
            }
            cfg.check_interval = Duration::from_secs(mins * 60);
        }
        if let Some(dir) = non_blank(&file.log_dir).or_else(|| env_string(ENV_LOG_DIR)) {
            cfg.log_dir = PathBuf::from(dir);
        }
        if let Some(b) = file.use_system_proxy.or_else(|| env_flag(ENV_USE_SYSTEM_PROXY)) {
            cfg.use_system_proxy = b;
        }
        if let Some(b) = file.verify_tls.or_else(|| env_flag(ENV_VERIFY_TLS)) {
            cfg.verify_tls = b;
        }

        cfg.endpoints.apply(&file.endpoints);
        cfg.timeouts.apply(&file.timeouts);

        Ok(cfg)
    }

    /// Credentials, or a configuration error naming the missing variables.
    pub fn credentials(&self) -> Result<Credentials, HandshakeError> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty() => Ok(Credentials {
                username: u.clone(),
                password: p.clone(),
            }),
            _ => Err(HandshakeError::Config(format!(
                "set {} and {}",
                ENV_USERNAME, ENV_PASSWORD
            ))),
        }
    }
}
