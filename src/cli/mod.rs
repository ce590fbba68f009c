//! Command-line interface for shipwright.
//!
//! Provides commands for processing a task request, inspecting task
//! rounds and their reports, and checking dependency health.

use std::io::{self, IsTerminal, Read};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{self, ResolvedConfig};
use crate::core::orchestrator::list_records_in;
use crate::core::{Dispatch, EventStore, Orchestrator};
use crate::domain::{NotificationOutcome, TaskIdentity, TaskRecord, TaskRequest};

/// shipwright - Event-sourced task pipeline for LLM-built static apps
#[derive(Parser, Debug)]
#[command(name = "shipwright")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Process one task request inline and print its report
    Run {
        /// Request JSON file (reads from stdin if not provided)
        #[arg(short, long)]
        request: Option<PathBuf>,

        /// Read the request from stdin
        #[arg(long)]
        stdin: bool,
    },

    /// Show the state of a task round
    Status {
        /// Task identifier
        task: String,

        /// Round number
        round: u32,
    },

    /// List recent task rounds
    Tasks {
        /// Maximum number of rounds to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Print the stored report of a task round
    Report {
        /// Task identifier
        task: String,

        /// Round number
        round: u32,
    },

    /// List rounds whose report could not be delivered
    DeadLetters,

    /// Check that the store and external dependencies are reachable
    Health,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { request, stdin } => run_request(request, stdin).await,
            Commands::Status { task, round } => show_status(&task, round).await,
            Commands::Tasks { limit } => list_tasks(limit).await,
            Commands::Report { task, round } => show_report(&task, round).await,
            Commands::DeadLetters => list_dead_letters().await,
            Commands::Health => check_health().await,
            Commands::Config => show_config(),
        }
    }
}

/// Configuration complete enough to run pipelines
fn pipeline_orchestrator() -> Result<Orchestrator> {
    let cfg = config::config()?;
    Orchestrator::from_config(cfg).context("Refusing to start with incomplete configuration")
}

/// Refuse a request whose secret is not the configured one
fn authenticate(cfg: &ResolvedConfig, request: &TaskRequest) -> Result<()> {
    if !cfg.accepts_secret(&request.secret) {
        anyhow::bail!(
            "Request for '{}' round {} carries an invalid secret",
            request.task,
            request.round
        );
    }
    Ok(())
}

/// Process one request inline
async fn run_request(request_file: Option<PathBuf>, use_stdin: bool) -> Result<()> {
    let content = if let Some(path) = request_file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read request file: {}", path.display()))?
    } else if use_stdin || !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No request provided. Use --request <file> or pipe JSON to stdin");
    };

    let request = TaskRequest::from_json(&content).context("Failed to parse task request")?;
    let orchestrator = pipeline_orchestrator()?;
    authenticate(config::config()?, &request)?;

    // Ctrl-C lets the pipeline stop at its next checkpoint
    let work = orchestrator.process(request);
    tokio::pin!(work);
    let dispatch = tokio::select! {
        result = &mut work => result?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("[Interrupted, stopping at the next checkpoint]");
            orchestrator.begin_shutdown();
            work.await?
        }
    };

    match dispatch {
        Dispatch::Completed(record) | Dispatch::Replayed(record) => {
            if let Some(report) = &record.report {
                println!("{}", report.to_json()?);
            }
            eprintln!(
                "\n[{} {}{}]",
                record.identity,
                record.status,
                notification_note(&record)
            );
            if !record.report.as_ref().is_some_and(|r| r.is_success()) {
                std::process::exit(1);
            }
        }
        Dispatch::Abandoned(identity) => {
            eprintln!("\n[{} abandoned; redeliver to resume]", identity);
            std::process::exit(2);
        }
        Dispatch::InFlight(identity) => {
            eprintln!("\n[{} is already being processed]", identity);
        }
    }

    Ok(())
}

fn notification_note(record: &TaskRecord) -> String {
    match &record.notification {
        Some(NotificationOutcome::Delivered { attempts, .. }) => {
            format!(", report delivered after {} attempt(s)", attempts)
        }
        Some(NotificationOutcome::DeadLettered { reason, .. }) => {
            format!(", report dead-lettered: {}", reason)
        }
        None => String::new(),
    }
}

async fn load_record(task: &str, round: u32) -> Result<TaskRecord> {
    let cfg = config::config()?;
    let identity = TaskIdentity::new(task, round);

    EventStore::at(&cfg.home, &identity)
        .load_record()
        .await?
        .with_context(|| format!("No record for {}", identity))
}

/// Show the state of a task round
async fn show_status(task: &str, round: u32) -> Result<()> {
    let record = load_record(task, round).await?;

    println!("Task: {}", record.identity.task);
    println!("Round: {}", record.identity.round);
    println!("Status: {}", record.status);
    println!("Created: {}", record.created_at);
    println!("Updated: {}", record.updated_at);
    if let Some(completed) = record.completed_at {
        println!("Completed: {}", completed);
    }
    println!(
        "Attempts: generation {}, publish {}, notification {}",
        record.attempts.generation, record.attempts.publish, record.attempts.notification
    );
    if let Some(digest) = &record.artifact_digest {
        println!("Artifact: {}", digest);
    }
    if let Some(deployment) = &record.deployment {
        println!("URL: {}", deployment.url);
        println!("Repository: {}", deployment.repo_url);
        println!("Commit: {}", deployment.commit_sha);
    }
    if let Some(error) = record.last_error.as_ref().or(record.publish_error.as_ref()) {
        println!("Error: {}", error);
    }
    if record.redeliveries > 0 {
        println!("Redeliveries: {}", record.redeliveries);
    }
    match &record.notification {
        Some(NotificationOutcome::Delivered {
            attempts,
            status_code,
        }) => println!("Notification: delivered (HTTP {}, {} attempt(s))", status_code, attempts),
        Some(NotificationOutcome::DeadLettered { attempts, reason }) => {
            println!("Notification: dead-lettered after {} attempt(s): {}", attempts, reason)
        }
        None => println!("Notification: pending"),
    }

    Ok(())
}

fn print_table(records: &[TaskRecord]) {
    println!("{:<32} {:<6} {:<11} {:<12} {}", "TASK", "ROUND", "STATUS", "NOTIFIED", "URL");
    println!("{}", "-".repeat(90));

    for record in records {
        let notified = match &record.notification {
            Some(NotificationOutcome::Delivered { .. }) => "delivered",
            Some(NotificationOutcome::DeadLettered { .. }) => "dead-letter",
            None => "-",
        };
        println!(
            "{:<32} {:<6} {:<11} {:<12} {}",
            record.identity.task,
            record.identity.round,
            record.status.to_string(),
            notified,
            record.deployed_url().unwrap_or("-")
        );
    }
}

/// List recent task rounds
async fn list_tasks(limit: usize) -> Result<()> {
    let cfg = config::config()?;
    let records = list_records_in(&cfg.home, limit).await?;

    if records.is_empty() {
        println!("No tasks found");
        return Ok(());
    }

    print_table(&records);
    Ok(())
}

/// Print the stored report verbatim
async fn show_report(task: &str, round: u32) -> Result<()> {
    let record = load_record(task, round).await?;
    let report = record
        .report
        .with_context(|| format!("No report prepared yet for {} (status: {})", record.identity, record.status))?;

    println!("{}", report.to_json()?);
    Ok(())
}

/// List rounds whose report was dead-lettered
async fn list_dead_letters() -> Result<()> {
    let cfg = config::config()?;
    let mut records = list_records_in(&cfg.home, usize::MAX).await?;
    records.retain(TaskRecord::is_dead_lettered);

    if records.is_empty() {
        println!("No dead-lettered reports");
        return Ok(());
    }

    print_table(&records);
    Ok(())
}

/// Check dependencies; exits non-zero when unhealthy
async fn check_health() -> Result<()> {
    let orchestrator = pipeline_orchestrator()?;
    let report = orchestrator.health_check().await;

    for dependency in &report.dependencies {
        match &dependency.error {
            None => println!("  ok    {}", dependency.name),
            Some(error) => println!("  FAIL  {}: {}", dependency.name, error),
        }
    }

    if !report.healthy {
        std::process::exit(1);
    }
    Ok(())
}

fn describe_missing(cfg: &ResolvedConfig) -> String {
    match cfg.validate() {
        Ok(()) => "complete".to_string(),
        Err(e) => e.to_string(),
    }
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Shipwright Configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!("Status:      {}", describe_missing(cfg));
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Tasks:               {}", cfg.tasks_dir().display());
    println!("  Admissions:          {}", cfg.admissions_path().display());
    println!();
    println!("LLM:");
    println!("  Base URL: {}", cfg.llm.base_url);
    println!("  Model:    {}", cfg.llm.model);
    if !cfg.llm.fallback_models.is_empty() {
        println!("  Fallback: {}", cfg.llm.fallback_models.join(", "));
    }
    println!("  API key:  {}", if cfg.llm.api_key.is_some() { "set" } else { "missing" });
    match cfg.huggingface.api_key {
        Some(_) => println!("  Fallback provider: HuggingFace ({})", cfg.huggingface.model),
        None => println!("  Fallback provider: none (set HF_TOKEN to enable)"),
    }
    println!();
    println!("GitHub:");
    println!("  API:      {}", cfg.github.api_base);
    println!("  Owner:    {}", cfg.github.username.as_deref().unwrap_or("(missing)"));
    println!("  Token:    {}", if cfg.github.token.is_some() { "set" } else { "missing" });
    println!("  Branch:   {}", cfg.github.branch);
    println!();
    println!("Pipeline:");
    println!("  Generation attempts: {}", cfg.generation.max_attempts);
    println!("  Publish on failure:  {}", cfg.generation.publish_on_failure);
    println!("  Task deadline:       {}s", cfg.task.timeout_seconds);
    println!("  Deploy timeout:      {}s", cfg.publish.deploy_timeout_seconds);
    println!("  CI workflow:         {}", cfg.publish.ci_workflow);
    println!("  Publish retries:     {}", cfg.publish.retry.max_attempts);
    println!("  Notify retries:      {}", cfg.notify.retry.max_attempts);
    println!();
    println!("Artifact limits:");
    println!("  Max files:       {}", cfg.limits.max_files);
    println!("  Max file size:   {} bytes", cfg.limits.max_file_bytes);
    println!("  Max total size:  {} bytes", cfg.limits.max_total_bytes);

    Ok(())
}
