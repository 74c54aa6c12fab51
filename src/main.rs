use std::sync::Arc;

use tracing::{error, info, warn};

use portal_keeper::core::config::PortalConfig;
use portal_keeper::core::logging;
use portal_keeper::setup::{self, SetupOptions, SetupRunMode};
use portal_keeper::{AppState, Scheduler};

const USAGE: &str = "\
portal-keeper: keeps a campus captive-portal session logged in

USAGE:
    portal-keeper [--once | --setup | --version | --help]

With no flag the daemon checks connectivity every PORTAL_CHECK_INTERVAL_MINS
minutes and logs in through the portal when offline.

    --once      run one check/login pass and exit (0 = online, 1 = failed)
    --setup     print the pre-flight checklist and exit (2 = failures)
    --version   print the version
    --help      print this message";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Daemon,
    Once,
    Setup,
}

fn parse_mode_from_args() -> Result<Option<Mode>, String> {
    let mut mode = Mode::Daemon;
    for a in std::env::args().skip(1) {
        match a.as_str() {
            "--version" | "-V" => {
                println!("portal-keeper {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--help" | "-h" => {
                println!("{}", USAGE);
                return Ok(None);
            }
            "--once" => mode = Mode::Once,
            "--setup" => mode = Mode::Setup,
            other => return Err(format!("unknown argument: {}", other)),
        }
    }
    Ok(Some(mode))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mode = match parse_mode_from_args() {
        Ok(Some(m)) => m,
        Ok(None) => return Ok(()),
        Err(e) => {
            eprintln!("{}\n\n{}", e, USAGE);
            std::process::exit(1);
        }
    };

    let config = match PortalConfig::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("portal-keeper: {}", e);
            std::process::exit(1);
        }
    };

    // Dropping the guard flushes the file writer; hold it for the whole run.
    let _log_guard = logging::init_tracing(&config.log_dir);

    if mode == Mode::Setup {
        let opts = SetupOptions {
            mode: SetupRunMode::SetupFlag,
            ..Default::default()
        };
        let report = setup::check_all(&config, opts).await;
        println!("{}", report);
        report.print_action_required_blocks();
        if report.has_failures() {
            std::process::exit(2);
        }
        return Ok(());
    }

    let report = setup::check_all(&config, SetupOptions::default()).await;
    info!("{}", report.summarize_for_logs());
    if report.has_failures() {
        error!("pre-flight checklist failed; run with --setup for guided remediation");
        report.print_action_required_blocks();
        std::process::exit(1);
    }

    let state = match AppState::from_config(config) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to initialise solver: {:#}", e);
            std::process::exit(1);
        }
    };
    info!(
        "portal-keeper {} starting with {} solver",
        env!("CARGO_PKG_VERSION"),
        state.solver.kind()
    );

    if mode == Mode::Once {
        let outcome = state.run_once().await;
        info!("single pass finished: {:?}", outcome);
        std::process::exit(outcome.exit_code());
    }

    let task = state.relogin_task()?;
    let scheduler = Scheduler::new(Arc::new(task), state.config.check_interval);
    scheduler.run_until(shutdown_signal()).await;
    if scheduler.skipped_ticks() > 0 {
        warn!(
            "{} tick(s) were skipped while a login was in flight",
            scheduler.skipped_ticks()
        );
    }
    info!("portal-keeper stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).ok();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = async {
                if let Some(ref mut s) = sigterm {
                    s.recv().await;
                } else {
                    std::future::pending::<()>().await;
                }
            } => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }

    info!("shutdown signal received");
}
