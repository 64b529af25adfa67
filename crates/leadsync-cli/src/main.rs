use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use leadsync_core::{AuthToken, ProgressSnapshot};
use leadsync_sync::{LeadsyncConfig, RunError, RunOrchestrator, StartRunRequest};
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "leadsync")]
#[command(about = "Resumable lead scrape runs over a spreadsheet")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Args)]
struct RangeArgs {
    #[arg(long)]
    spreadsheet_id: String,
    #[arg(long, default_value = "Niche Settings")]
    settings_tab: String,
    #[arg(long, default_value = "Scraped Leads")]
    leads_tab: String,
    #[arg(long)]
    start_row: u32,
    #[arg(long)]
    end_row: u32,
    /// Replace an unfinished run.
    #[arg(long)]
    supersede: bool,
}

impl RangeArgs {
    fn request(&self) -> StartRunRequest {
        StartRunRequest {
            spreadsheet_id: self.spreadsheet_id.clone(),
            settings_sheet_name: self.settings_tab.clone(),
            leads_sheet_name: self.leads_tab.clone(),
            start_row: self.start_row,
            end_row: self.end_row,
            supersede: self.supersede,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Start a run over a settings row range.
    Start(RangeArgs),
    /// Advance the current run by one step.
    Step {
        #[arg(long)]
        run_id: Option<Uuid>,
    },
    Cancel,
    Status,
    /// Forget the persisted run.
    Reset,
    /// Step the current run until it finishes, starting one first when a range is given.
    Drive {
        #[arg(long)]
        spreadsheet_id: Option<String>,
        #[arg(long, default_value = "Niche Settings")]
        settings_tab: String,
        #[arg(long, default_value = "Scraped Leads")]
        leads_tab: String,
        #[arg(long, requires = "spreadsheet_id")]
        start_row: Option<u32>,
        #[arg(long, requires = "spreadsheet_id")]
        end_row: Option<u32>,
        #[arg(long)]
        supersede: bool,
    },
    Serve,
}

/// Reads the spreadsheet credential: a bare access token or an OAuth token JSON object.
fn token_from_env() -> Option<AuthToken> {
    let raw = std::env::var("LEADSYNC_SHEETS_TOKEN").ok()?;
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(value @ JsonValue::Object(_)) => Some(AuthToken(value)),
        _ => Some(AuthToken(JsonValue::String(raw.to_string()))),
    }
}

fn print_snapshot(snapshot: &ProgressSnapshot) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(snapshot)?);
    Ok(())
}

async fn drive(
    orchestrator: &RunOrchestrator,
    token: Option<&AuthToken>,
    interval: Duration,
) -> Result<ProgressSnapshot> {
    let run_id = orchestrator.run_status().await?.run_id;
    info!(%run_id, interval_ms = interval.as_millis() as u64, "driving run");
    loop {
        match orchestrator.step_run(run_id, token).await {
            Ok(snapshot) if snapshot.done => return Ok(snapshot),
            Ok(snapshot) => info!(
                current_index = snapshot.current_index,
                total_rows = snapshot.total_rows,
                active_job = ?snapshot.active_job_id,
                "run in progress"
            ),
            Err(RunError::NoActiveRun) => {
                warn!(%run_id, "run is no longer active");
                bail!("run {run_id} is no longer active");
            }
            Err(err) => return Err(err.into()),
        }
        tokio::time::sleep(interval).await;
    }
}

fn orchestrator(config: &LeadsyncConfig) -> Result<RunOrchestrator> {
    config
        .orchestrator()
        .with_context(|| format!("loading column headers from {}", config.columns_file.display()))
}

async fn run(command: Commands) -> Result<()> {
    let config = LeadsyncConfig::from_env();
    let token = token_from_env();

    match command {
        Commands::Serve => leadsync_web::serve_from_env().await?,
        Commands::Start(range) => {
            let snapshot = orchestrator(&config)?
                .start_run(&range.request(), token.as_ref())
                .await?;
            print_snapshot(&snapshot)?;
        }
        Commands::Step { run_id } => {
            let orchestrator = orchestrator(&config)?;
            let run_id = match run_id {
                Some(id) => id,
                None => orchestrator.run_status().await?.run_id,
            };
            print_snapshot(&orchestrator.step_run(run_id, token.as_ref()).await?)?;
        }
        Commands::Cancel => print_snapshot(&orchestrator(&config)?.cancel_run().await?)?,
        Commands::Status => print_snapshot(&orchestrator(&config)?.run_status().await?)?,
        Commands::Reset => {
            orchestrator(&config)?.reset_run().await?;
            println!("run state cleared: {}", config.state_path.display());
        }
        Commands::Drive {
            spreadsheet_id,
            settings_tab,
            leads_tab,
            start_row,
            end_row,
            supersede,
        } => {
            let orchestrator = orchestrator(&config)?;
            if let Some(spreadsheet_id) = spreadsheet_id {
                let (Some(start_row), Some(end_row)) = (start_row, end_row) else {
                    bail!("--start-row and --end-row are required with --spreadsheet-id");
                };
                let range = RangeArgs {
                    spreadsheet_id,
                    settings_tab,
                    leads_tab,
                    start_row,
                    end_row,
                    supersede,
                };
                orchestrator.start_run(&range.request(), token.as_ref()).await?;
            }
            let snapshot = drive(&orchestrator, token.as_ref(), config.poll_interval).await?;
            print_snapshot(&snapshot)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("leadsync=info".parse()?))
        .init();

    let cli = Cli::parse();
    let result = run(cli.command.unwrap_or(Commands::Status)).await;
    if let Err(err) = &result {
        if let Some(run_err) = err.downcast_ref::<RunError>() {
            eprintln!("{}", serde_json::to_string_pretty(&run_err.to_body())?);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use clap::CommandFactory;
    use leadsync_adapters::{MemoryConnector, MemoryWorkbook, ScriptedJob, ScriptedJobProvider};
    use leadsync_core::RunOutcome;
    use leadsync_storage::MemoryRunStateStore;
    use leadsync_sync::OrchestratorOptions;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
        let cli = Cli::try_parse_from([
            "leadsync",
            "drive",
            "--spreadsheet-id",
            "sheet-1",
            "--start-row",
            "2",
            "--end-row",
            "9",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Drive { start_row: Some(2), end_row: Some(9), .. })
        ));
        assert!(Cli::try_parse_from(["leadsync", "drive", "--start-row", "2"]).is_err());
    }

    #[tokio::test]
    async fn drive_steps_until_done() {
        let book = Arc::new(MemoryWorkbook::new());
        book.insert_tab(
            "sheet-1",
            "Niche Settings",
            vec![vec!["Search Term"], vec!["florists"], vec![""]],
        );
        book.insert_tab("sheet-1", "Scraped Leads", vec![vec!["Unique ID"]]);
        let jobs = Arc::new(ScriptedJobProvider::new());
        jobs.script(
            "florists",
            ScriptedJob::Succeed {
                polls: 2,
                records: vec![],
            },
        );
        let orchestrator = RunOrchestrator::new(
            Arc::new(MemoryRunStateStore::new()),
            Arc::new(MemoryConnector::new(book, "tok", "https://auth.test")),
            jobs,
            OrchestratorOptions::default(),
        );
        let token = AuthToken::from_access_token("tok");
        let range = RangeArgs {
            spreadsheet_id: "sheet-1".into(),
            settings_tab: "Niche Settings".into(),
            leads_tab: "Scraped Leads".into(),
            start_row: 2,
            end_row: 3,
            supersede: false,
        };
        orchestrator
            .start_run(&range.request(), Some(&token))
            .await
            .unwrap();

        let snapshot = drive(&orchestrator, Some(&token), Duration::from_millis(1))
            .await
            .unwrap();
        assert_eq!(snapshot.outcome, Some(RunOutcome::Completed));
        assert_eq!((snapshot.processed, snapshot.skipped), (1, 1));
    }

    #[tokio::test]
    async fn drive_without_run_fails() {
        let orchestrator = RunOrchestrator::new(
            Arc::new(MemoryRunStateStore::new()),
            Arc::new(MemoryConnector::new(
                Arc::new(MemoryWorkbook::new()),
                "tok",
                "https://auth.test",
            )),
            Arc::new(ScriptedJobProvider::new()),
            OrchestratorOptions::default(),
        );
        let err = drive(&orchestrator, None, Duration::from_millis(1))
            .await
            .unwrap_err();
        let run_err = err.downcast_ref::<RunError>().unwrap();
        assert_eq!(run_err.kind(), "no_active_run");
    }
}
