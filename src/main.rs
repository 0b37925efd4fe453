use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use aso_pipeline_client::app_state::AppState;
use aso_pipeline_client::config::AppConfig;
use aso_pipeline_client::models::auth::SessionFlags;
use aso_pipeline_client::models::market_study::MarketStudy;
use aso_pipeline_client::services::api::MarketStudyApi;
use aso_pipeline_client::services::notify::LogNotifier;
use aso_pipeline_client::services::orchestrator::Outcome;
use aso_pipeline_client::services::poller::poll_until_completed;

#[derive(Debug, Parser)]
#[command(name = "aso-pipeline", version, about = "Run and track ASO market study pipelines")]
struct Cli {
    /// Backend base URL, overriding API_URL
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in with EMAIL and PASSWORD and store the session
    Login,
    /// Forget the stored session
    Logout,
    #[command(flatten)]
    Study(StudyCommand),
}

/// Commands that need a signed-in session
#[derive(Debug, Subcommand)]
enum StudyCommand {
    /// Run keyword analysis, starting from app metadata
    Analyze { study_id: Uuid },
    /// Resume a failed market study from its failed step
    Retry { study_id: Uuid },
    /// Generate store metadata for an analyzed market study
    Generate { study_id: Uuid },
    /// Follow a market study until it finishes, without starting anything
    Watch { study_id: Uuid },
    /// Resume polling every in-progress market study of a project
    Resume { project_id: Uuid },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::from_env().context("Failed to load configuration from environment")?;
    if let Some(api_url) = cli.api_url {
        config.api_url = api_url;
    }

    init_logging(config.log_json);
    tracing::info!(api_url = %config.api_url, "Starting aso-pipeline");

    let state = AppState::new(&config, Arc::new(LogNotifier)).context("Failed to initialize API client")?;

    match cli.command {
        Command::Login => {
            let flags = sign_in(&state, &config).await?;
            tracing::info!(email = ?flags.email, is_superuser = flags.is_superuser, "Signed in");
        }
        Command::Logout => {
            state.tokens.sign_out();
            tracing::info!("Signed out");
        }
        Command::Study(command) => {
            ensure_session(&state, &config).await?;
            run(&state, &config, command).await?;
        }
    }

    Ok(())
}

async fn sign_in(state: &AppState, config: &AppConfig) -> anyhow::Result<SessionFlags> {
    let (Some(email), Some(password)) = (&config.email, &config.password) else {
        bail!("EMAIL and PASSWORD must be set to sign in");
    };
    let flags = state.tokens.sign_in(email, password).await?;
    Ok(flags)
}

async fn ensure_session(state: &AppState, config: &AppConfig) -> anyhow::Result<()> {
    if state.tokens.restore_session().await {
        tracing::debug!("Restored stored session");
        return Ok(());
    }
    if config.email.is_some() && config.password.is_some() {
        sign_in(state, config).await?;
        return Ok(());
    }
    bail!("No valid session. Run `aso-pipeline login` with EMAIL and PASSWORD set")
}

async fn run(state: &AppState, config: &AppConfig, command: StudyCommand) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    {
        let orchestrator = Arc::clone(&state.orchestrator);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, stopping polls");
                orchestrator.shutdown();
                cancel.cancel();
            }
        });
    }

    let orchestrator = &state.orchestrator;
    match command {
        StudyCommand::Analyze { study_id } => {
            load_study(state, study_id).await?;
            report(study_id, orchestrator.analyze(study_id).await?)
        }
        StudyCommand::Retry { study_id } => {
            load_study(state, study_id).await?;
            report(study_id, orchestrator.retry(study_id).await?)
        }
        StudyCommand::Generate { study_id } => {
            load_study(state, study_id).await?;
            report(study_id, orchestrator.generate_metadata(study_id).await?)
        }
        StudyCommand::Watch { study_id } => {
            let study = poll_until_completed(
                &*state.api,
                study_id,
                &*state.tokens,
                &config.poll_options(),
                |status, _| tracing::info!(study_id = %study_id, status = %status, "Market study progress"),
                cancel,
            )
            .await?;
            print_study(&study)
        }
        StudyCommand::Resume { project_id } => {
            let handles = orchestrator.resume_in_progress(project_id).await?;
            if handles.is_empty() {
                tracing::info!(project_id = %project_id, "No market studies in progress");
            }
            let mut failures = 0;
            for (study_id, handle) in handles {
                let outcome = handle.await.context("Poll task panicked")?;
                if let Err(e) = report(study_id, outcome) {
                    tracing::error!(study_id = %study_id, error = %e, "Market study did not complete");
                    failures += 1;
                }
            }
            if failures > 0 {
                bail!("{failures} market studies did not complete");
            }
            Ok(())
        }
    }
}

/// Put the study on the board so the orchestrator can update it.
async fn load_study(state: &AppState, study_id: Uuid) -> anyhow::Result<()> {
    let token = state
        .tokens
        .ensure_valid_token()
        .await
        .context("Session expired. Please log in again.")?;
    let study = state
        .api
        .get_market_study(study_id, &token)
        .await?
        .with_context(|| format!("Market study {study_id} not found"))?;
    state.orchestrator.board().replace_all(vec![study]);
    Ok(())
}

fn report(study_id: Uuid, outcome: Outcome) -> anyhow::Result<()> {
    match outcome {
        Outcome::Completed(study) | Outcome::Verified(study) => print_study(&study),
        Outcome::Failed(study) => bail!(
            "Market study {study_id} failed at {}: {}",
            study.failed_step.map(|s| s.to_string()).unwrap_or_else(|| "unknown step".to_string()),
            study.error_message.as_deref().unwrap_or("Unknown error")
        ),
        Outcome::Unverified { reason } => {
            bail!("Could not confirm the status of market study {study_id}: {reason}")
        }
        Outcome::Cancelled => {
            tracing::warn!(study_id = %study_id, "Polling cancelled; the pipeline keeps running server-side");
            Ok(())
        }
        Outcome::AlreadyPolling => {
            tracing::info!(study_id = %study_id, "Market study is already being polled");
            Ok(())
        }
    }
}

fn print_study(study: &MarketStudy) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(study)?);
    Ok(())
}
