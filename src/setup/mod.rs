use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::config::PortalConfig;
use crate::solver::manual::ImageViewer;
use crate::solver::SolverKind;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetupRunMode {
    /// Run before the daemon starts; only logs.
    Startup,
    /// Invoked explicitly via `--setup`; includes the network check.
    SetupFlag,
}

#[derive(Clone, Debug)]
pub struct SetupOptions {
    pub mode: SetupRunMode,
    pub tls_timeout: Duration,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            mode: SetupRunMode::Startup,
            tls_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skip,
}

impl CheckStatus {
    pub fn is_fail(self) -> bool {
        matches!(self, CheckStatus::Fail)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionRequired {
    pub title: String,
    pub steps: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SetupCheck {
    pub id: String,
    pub title: String,
    pub status: CheckStatus,
    pub details: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionRequired>,
}

impl SetupCheck {
    fn new(id: &str, title: &str, status: CheckStatus, details: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            status,
            details: details.into(),
            actions: vec![],
        }
    }

    fn with_action(mut self, title: &str, steps: &[&str]) -> Self {
        self.actions.push(ActionRequired {
            title: title.to_string(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
        });
        self
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SetupReport {
    pub checks: Vec<SetupCheck>,
}

impl SetupReport {
    pub fn has_failures(&self) -> bool {
        self.checks.iter().any(|c| c.status.is_fail())
    }

    pub fn check(&self, id: &str) -> Option<&SetupCheck> {
        self.checks.iter().find(|c| c.id == id)
    }

    pub fn summarize_for_logs(&self) -> String {
        let mut pass = 0;
        let mut warn_count = 0;
        let mut fail = 0;
        let mut skip = 0;
        for c in &self.checks {
            match c.status {
                CheckStatus::Pass => pass += 1,
                CheckStatus::Warn => warn_count += 1,
                CheckStatus::Fail => fail += 1,
                CheckStatus::Skip => skip += 1,
            }
        }
        format!(
            "preflight: {} pass, {} warn, {} fail, {} skip",
            pass, warn_count, fail, skip
        )
    }

    pub fn print_action_required_blocks(&self) {
        for check in &self.checks {
            if check.actions.is_empty() {
                continue;
            }

            warn!(
                "\n=== ACTION REQUIRED: {} ===\n{}\n",
                check.title, check.details
            );
            for action in &check.actions {
                eprintln!("- {}", action.title);
                for step in &action.steps {
                    eprintln!("  • {}", step);
                }
                eprintln!();
            }
        }
    }
}

impl fmt::Display for SetupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "portal-keeper Pre-flight Checklist")?;
        writeln!(f, "{}", "=".repeat(34))?;
        for c in &self.checks {
            writeln!(
                f,
                "[{:<4}] {}\n  {}",
                match c.status {
                    CheckStatus::Pass => "OK",
                    CheckStatus::Warn => "WARN",
                    CheckStatus::Fail => "FAIL",
                    CheckStatus::Skip => "SKIP",
                },
                c.title,
                c.details.replace('\n', "\n  ")
            )?;
            for action in &c.actions {
                writeln!(f, "  Action: {}", action.title)?;
                for step in &action.steps {
                    writeln!(f, "    - {}", step)?;
                }
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

pub async fn check_all(config: &PortalConfig, options: SetupOptions) -> SetupReport {
    let mut report = SetupReport::default();

    report.checks.push(check_credentials(config));
    report.checks.push(check_solver(config));
    report.checks.push(check_log_dir(&config.log_dir));
    report.checks.push(match options.mode {
        SetupRunMode::SetupFlag => {
            check_portal_tls(&config.endpoints.login_url, options.tls_timeout).await
        }
        SetupRunMode::Startup => SetupCheck::new(
            "portal_tls",
            "Portal HTTPS endpoint",
            CheckStatus::Skip,
            "Not probed at startup; run with --setup to check.",
        ),
    });

    report
}

fn check_credentials(config: &PortalConfig) -> SetupCheck {
    match config.credentials() {
        Ok(c) => SetupCheck::new(
            "credentials",
            "Portal credentials",
            CheckStatus::Pass,
            format!("Account {} configured.", c.username),
        ),
        Err(e) => SetupCheck::new(
            "credentials",
            "Portal credentials",
            CheckStatus::Fail,
            e.to_string(),
        )
        .with_action(
            "Provide the account",
            &[
                "export PORTAL_USERNAME=<student id>",
                "export PORTAL_PASSWORD=<password>",
                "or set `username` / `password` in portal-keeper.json",
            ],
        ),
    }
}

fn check_solver(config: &PortalConfig) -> SetupCheck {
    let settings = &config.solver;
    let title = format!("CAPTCHA solver ({})", settings.kind);
    match settings.kind {
        SolverKind::Manual => match ImageViewer::discover() {
            Some(v) => SetupCheck::new(
                "solver",
                &title,
                CheckStatus::Pass,
                format!("Images open with {}.", v.program.display()),
            ),
            None => SetupCheck::new(
                "solver",
                &title,
                CheckStatus::Warn,
                "No image viewer on PATH; the saved image path is logged instead.",
            ),
        },
        SolverKind::Cnn => match settings.model.as_deref() {
            Some(m) if url::Url::parse(m).is_ok() => SetupCheck::new(
                "solver",
                &title,
                CheckStatus::Pass,
                format!("Model server: {}", m),
            ),
            Some(m) => SetupCheck::new(
                "solver",
                &title,
                CheckStatus::Fail,
                format!("PORTAL_SOLVER_MODEL is not a URL: {}", m),
            )
            .with_action(
                "Point at the model server",
                &["export PORTAL_SOLVER_MODEL=http://127.0.0.1:8500/predict"],
            ),
            None => SetupCheck::new(
                "solver",
                &title,
                CheckStatus::Fail,
                "PORTAL_SOLVER_MODEL is not set.",
            )
            .with_action(
                "Point at the model server",
                &["export PORTAL_SOLVER_MODEL=http://127.0.0.1:8500/predict"],
            ),
        },
        SolverKind::VisionLanguageModel => match settings.model.as_deref() {
            Some(m) => SetupCheck::new(
                "solver",
                &title,
                CheckStatus::Pass,
                format!("Model {} at {}", m, settings.llm_base_url),
            ),
            None => SetupCheck::new(
                "solver",
                &title,
                CheckStatus::Fail,
                "PORTAL_SOLVER_MODEL is not set.",
            )
            .with_action(
                "Choose a vision model",
                &[
                    "export PORTAL_SOLVER_MODEL=<model name>",
                    "export OPENAI_BASE_URL=http://127.0.0.1:11434/v1 for a local server",
                ],
            ),
        },
    }
}

fn check_log_dir(dir: &Path) -> SetupCheck {
    let title = format!("Log directory ({})", dir.display());
    if let Err(e) = std::fs::create_dir_all(dir) {
        return SetupCheck::new(
            "log_dir",
            &title,
            CheckStatus::Fail,
            format!("Failed to create {}: {}", dir.display(), e),
        )
        .with_action(
            "Fix permissions",
            &["Create the directory manually or set PORTAL_LOG_DIR elsewhere."],
        );
    }

    // Writability test: create/delete a small file.
    let probe = dir.join(".write_test");
    if let Err(e) = std::fs::write(&probe, b"ok") {
        return SetupCheck::new(
            "log_dir",
            &title,
            CheckStatus::Fail,
            format!("Directory not writable: {}", e),
        )
        .with_action(
            "Fix directory permissions",
            &["Ensure the daemon user can write to PORTAL_LOG_DIR."],
        );
    }
    let _ = std::fs::remove_file(&probe);

    SetupCheck::new("log_dir", &title, CheckStatus::Pass, "Writable.")
}

async fn check_portal_tls(url: &str, timeout: Duration) -> SetupCheck {
    let client = match reqwest::Client::builder()
        .timeout(timeout)
        .danger_accept_invalid_certs(true)
        .no_proxy()
        .build()
    {
        Ok(c) => c,
        Err(e) => {
            return SetupCheck::new(
                "portal_tls",
                "Portal HTTPS endpoint",
                CheckStatus::Warn,
                format!("Failed to construct HTTP client: {}", e),
            );
        }
    };

    match client.get(url).send().await {
        Ok(resp) => SetupCheck::new(
            "portal_tls",
            "Portal HTTPS endpoint",
            CheckStatus::Pass,
            format!("{} answered {}.", url, resp.status()),
        ),
        // Off-campus or before association the portal is simply unreachable.
        Err(e) => SetupCheck::new(
            "portal_tls",
            "Portal HTTPS endpoint",
            CheckStatus::Warn,
            format!("{} unreachable: {}", url, e),
        ),
    }
}
