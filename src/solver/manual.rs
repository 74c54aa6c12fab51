use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::{CaptchaSolver, RetryBudget, SolveError, SolverKind};
use crate::core::types::{CaptchaCode, CaptchaImage, CAPTCHA_LEN};

type InputLines = Box<dyn AsyncBufRead + Send + Unpin>;

enum PromptError {
    /// Input reached EOF; no answer will ever arrive.
    Closed,
    Failed(String),
}

/// Program used to show the saved CAPTCHA to a human.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageViewer {
    pub program: PathBuf,
    pub leading_args: Vec<String>,
}

impl ImageViewer {
    /// Platform opener found on PATH, if any.
    pub fn discover() -> Option<Self> {
        #[cfg(target_os = "windows")]
        {
            which::which("cmd").ok().map(|program| Self {
                program,
                leading_args: vec!["/C".into(), "start".into(), String::new()],
            })
        }

        #[cfg(target_os = "macos")]
        {
            which::which("open").ok().map(|program| Self {
                program,
                leading_args: vec![],
            })
        }

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        {
            ["xdg-open", "gio", "display", "feh"]
                .iter()
                .find_map(|c| which::which(c).ok().map(|p| (c, p)))
                .map(|(name, program)| Self {
                    program,
                    leading_args: if *name == "gio" {
                        vec!["open".into()]
                    } else {
                        vec![]
                    },
                })
        }
    }

    /// Launch the viewer; the returned task reaps the child when it exits.
    fn open(&self, path: &Path) -> std::io::Result<JoinHandle<std::io::Result<ExitStatus>>> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.leading_args)
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(tokio::spawn(async move { child.wait().await }))
    }
}

/// Temp copy of the CAPTCHA; removed when dropped, whatever the outcome.
struct TempArtifact {
    path: PathBuf,
}

impl TempArtifact {
    async fn write(dir: &Path, image: &CaptchaImage) -> std::io::Result<Self> {
        let path = dir.join(format!(
            "captcha-{}.{}",
            uuid::Uuid::new_v4(),
            image.extension()
        ));
        tokio::fs::write(&path, image.as_bytes()).await?;
        Ok(Self { path })
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Shows the CAPTCHA to a person and reads the code they type.
pub struct ManualSolver {
    budget: RetryBudget,
    viewer: Option<ImageViewer>,
    temp_dir: PathBuf,
    input: Mutex<InputLines>,
}

impl ManualSolver {
    pub fn new(max_retries: i64, viewer: Option<ImageViewer>, input: InputLines) -> Self {
        Self {
            budget: RetryBudget::new(max_retries),
            viewer,
            temp_dir: std::env::temp_dir(),
            input: Mutex::new(input),
        }
    }

    /// Reads answers from stdin and opens images with the platform viewer.
    pub fn with_stdin(max_retries: i64) -> Self {
        Self::new(
            max_retries,
            ImageViewer::discover(),
            Box::new(BufReader::new(tokio::io::stdin())),
        )
    }

    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    async fn ask(&self, image: &CaptchaImage) -> Result<CaptchaCode, PromptError> {
        let artifact = TempArtifact::write(&self.temp_dir, image)
            .await
            .map_err(|e| PromptError::Failed(format!("saving captcha image: {}", e)))?;

        match &self.viewer {
            Some(viewer) => {
                if let Err(e) = viewer.open(&artifact.path) {
                    warn!("failed to open viewer {}: {}", viewer.program.display(), e);
                }
            }
            None => info!("no image viewer available"),
        }
        info!("captcha saved to {}", artifact.path.display());

        let mut input = self.input.lock().await;
        loop {
            eprint!("Enter the {}-character captcha: ", CAPTCHA_LEN);
            let mut line = String::new();
            let read = input
                .read_line(&mut line)
                .await
                .map_err(|e| PromptError::Failed(format!("reading input: {}", e)))?;
            if read == 0 {
                return Err(PromptError::Closed);
            }
            match CaptchaCode::parse(&line) {
                Some(code) => return Ok(code),
                None => warn!(
                    "'{}' is not {} letters/digits, try again",
                    line.trim(),
                    CAPTCHA_LEN
                ),
            }
        }
    }
}

#[async_trait]
impl CaptchaSolver for ManualSolver {
    fn kind(&self) -> SolverKind {
        SolverKind::Manual
    }

    fn budget(&self) -> &RetryBudget {
        &self.budget
    }

    async fn solve(&self, image: &CaptchaImage) -> Result<CaptchaCode, SolveError> {
        match self.ask(image).await {
            Ok(code) => Ok(code),
            Err(PromptError::Closed) => {
                warn!("captcha input closed before a code was entered");
                Err(self.budget.exhaust())
            }
            Err(PromptError::Failed(reason)) => self.budget.settle("manual", Err(reason)),
        }
    }
}
