//! pushdeploy - Entry Point
//!
//! Runs as a daemon serving the trigger/ledger API, or performs a single
//! deployment in the foreground with `--deploy`.

use std::collections::HashMap;
use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use colored::Colorize;
use pushdeploy::app::options::AppOptions;
use pushdeploy::app::run::run;
use pushdeploy::app::state::AppState;
use pushdeploy::cache::plans::load_plan_file;
use pushdeploy::deploy::orchestrator::DeploymentRequest;
use pushdeploy::errors::DeployError;
use pushdeploy::filesys::file::File;
use pushdeploy::logs::{init_logging, LogOptions};
use pushdeploy::models::run::{DeployContext, RunRecord, RunStatus};
use pushdeploy::storage::layout::StorageLayout;
use pushdeploy::storage::settings::Settings;
use pushdeploy::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(json) => println!("{}", json),
            Err(e) => eprintln!("{}", e),
        }
        return ExitCode::SUCCESS;
    }

    if let Some(path) = cli_args.get("validate-plan") {
        return validate_plan(path).await;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = layout.settings_file();
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!("Unable to read settings file: {}", e);
                return ExitCode::FAILURE;
            }
        }
    } else {
        Settings::default()
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings
            .log_to_file
            .then(|| layout.logs_dir().path().to_path_buf()),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    let options = match AppOptions::from_settings(layout, &settings) {
        Ok(options) => options,
        Err(e) => {
            error!("Invalid settings: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let credentials = Arc::new(settings.static_credentials());

    if cli_args.contains_key("deploy") {
        return deploy_once(&cli_args, options, credentials).await;
    }

    info!("Running pushdeploy with options: {:?}", options);
    match run(options, credentials, await_shutdown_signal()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn validate_plan(path: &str) -> ExitCode {
    match load_plan_file(&File::new(path)).await {
        Ok(plan) => {
            println!(
                "{} plan '{}' with {} step(s)",
                "valid".green().bold(),
                plan.name(),
                plan.forward_steps().len()
            );
            for step in plan.forward_steps() {
                let rollback = if step.is_forward_only() {
                    "forward-only".yellow()
                } else {
                    "rollback".normal()
                };
                println!("  {} ({})", step.name, rollback);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("{} {}", "invalid".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

/// Trigger one deployment, follow it to a terminal state and print the record
async fn deploy_once(
    cli_args: &HashMap<String, String>,
    mut options: AppOptions,
    credentials: Arc<dyn pushdeploy::deploy::credentials::CredentialResolver>,
) -> ExitCode {
    let request = match deploy_request(cli_args) {
        Ok(request) => request,
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            eprintln!("Usage: pushdeploy --deploy --host=<name> --plan=<name> --ref=<git ref> [--key=<trigger key>]");
            return ExitCode::FAILURE;
        }
    };

    options.enable_server = false;
    options.enable_plan_reloader = false;
    let state = match AppState::init(&options, credentials).await {
        Ok(state) => state,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let run_id = match state.orchestrator.trigger_deployment(request).await {
        Ok(run_id) => run_id,
        Err(e) => {
            eprintln!("{} {}", "rejected:".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    let orchestrator = state.orchestrator.clone();
    let cancel_id = run_id.clone();
    tokio::spawn(async move {
        await_shutdown_signal().await;
        let _ = orchestrator.cancel(&cancel_id).await;
    });

    match state.orchestrator.wait(&run_id).await {
        Ok(record) => {
            print_record(&record);
            if record.status == RunStatus::Succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn deploy_request(cli_args: &HashMap<String, String>) -> Result<DeploymentRequest, DeployError> {
    let get = |key: &str| {
        cli_args
            .get(key)
            .cloned()
            .ok_or_else(|| DeployError::ConfigError(format!("missing --{}", key)))
    };
    let mut context = DeployContext::new(get("ref")?);
    if let Some(key) = cli_args.get("key") {
        context = context.with_trigger_key(key.clone());
    }
    Ok(DeploymentRequest {
        host: get("host")?,
        plan: get("plan")?,
        context,
    })
}

fn print_record(record: &RunRecord) {
    let status = format!("{:?}", record.status);
    let status = match record.status {
        RunStatus::Succeeded => status.green().bold(),
        RunStatus::RolledBack => status.yellow().bold(),
        _ => status.red().bold(),
    };
    println!("run {} on {}: {}", record.run_id, record.host, status);
    for outcome in &record.outcomes {
        let marker = if outcome.skipped { " (skipped)" } else { "" };
        println!(
            "  {:<8} {:<20} {:?} after {} attempt(s){}",
            format!("{:?}", outcome.phase).to_lowercase(),
            outcome.step_name,
            outcome.status,
            outcome.attempts,
            marker
        );
        if let Some(err) = &outcome.error {
            println!("           {}", err.dimmed());
        }
    }
    if let Some(err) = &record.rollback_error {
        println!("{} {}", "manual intervention required:".red().bold(), err);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                _ => {
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl+C received, shutting down...");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
