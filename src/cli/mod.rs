//! Command-line interface for prospector.
//!
//! The CLI is the operator channel: approvals, ratings, payments, manual
//! opportunities and policy edits, plus one-shot runs of each loop and the
//! long-running `run` mode.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use uuid::Uuid;

use crate::adapters::{
    AnthropicBackend, CommandLauncher, CommandSensor, InferenceBackend, LogNotifier, Notifier,
    OllamaBackend, Sensor, TelegramNotifier,
};
use crate::brain::{approval, ApprovalGate, ModelRouter};
use crate::config::{self, ResolvedConfig};
use crate::core::controller;
use crate::core::{
    BudgetTracker, CycleScheduler, JobQueue, MetricsReflector, OpportunityMachine, PollOutcome,
    Runtime, TickOutcome, ValidationController,
};
use crate::domain::{ApprovalRequest, NewOpportunity, OpportunityStatus, Rating, SystemEventKind};
use crate::policy::{default_value, keys, Policy};
use crate::store::{approvals, events, Store};

/// prospector - autonomous opportunity agent
#[derive(Parser, Debug)]
#[command(name = "prospector")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the scheduler, worker and controller loops until Ctrl+C
    Run,

    /// Run one scheduler cycle
    Tick,

    /// Claim and process one batch of jobs
    Work {
        /// Keep polling until no pending jobs remain
        #[arg(long)]
        drain: bool,
    },

    /// Run one validation controller pass
    Validate,

    /// Insert an opportunity by hand
    Add {
        /// Short title
        title: String,

        /// Source tag (e.g. "reddit/r/saas")
        #[arg(short, long, default_value = "manual")]
        source: String,

        /// Viability estimate (0-100)
        #[arg(short, long, default_value = "50")]
        viability: f64,

        /// Evidence text
        #[arg(short, long)]
        evidence: Option<String>,
    },

    /// Show counts, or one opportunity's details and history
    Status {
        /// Opportunity ID (UUID)
        opportunity_id: Option<String>,
    },

    /// Rate an opportunity (feeds source weights; never changes status)
    Rate {
        opportunity_id: String,

        #[arg(value_enum)]
        rating: RatingArg,
    },

    /// Record a payment against an active validation
    Payment {
        validation_id: String,

        /// Amount in USD
        amount: f64,
    },

    /// List pending cloud budget approvals
    Approvals,

    /// Approve a pending cloud budget request
    Approve { approval_id: String },

    /// Reject a pending cloud budget request
    Reject { approval_id: String },

    /// Show spend and budget state
    Budget,

    /// Read or change runtime policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Show recent diagnostic events
    Events {
        /// Filter by kind (e.g. "plan_parse_fallback")
        #[arg(short, long)]
        kind: Option<String>,

        /// Maximum number of events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show resolved configuration (debug)
    Config,
}

#[derive(Subcommand, Debug)]
pub enum PolicyCommands {
    /// Show one key, or every key with its effective value
    Get { key: Option<String> },

    /// Set a key. The value is parsed as JSON, or stored as a string.
    Set { key: String, value: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum RatingArg {
    Good,
    Bad,
}

impl From<RatingArg> for Rating {
    fn from(r: RatingArg) -> Self {
        match r {
            RatingArg::Good => Rating::Good,
            RatingArg::Bad => Rating::Bad,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Config => show_config(),
            command => App::open()?.execute(command).await,
        }
    }
}

/// Everything a command needs, wired from the resolved configuration
struct App {
    config: &'static ResolvedConfig,
    store: Store,
    policy: Policy,
}

impl App {
    async fn execute(&self, command: Commands) -> Result<()> {
        match command {
            Commands::Config => show_config(),
            Commands::Run => self.runtime()?.run_until_ctrl_c().await,
            Commands::Tick => tick(self).await,
            Commands::Work { drain } => work(self, drain).await,
            Commands::Validate => validate(self).await,
            Commands::Add {
                title,
                source,
                viability,
                evidence,
            } => add(self, title, source, viability, evidence).await,
            Commands::Status { opportunity_id } => match opportunity_id {
                Some(id) => show_opportunity(self, &id).await,
                None => show_overview(self).await,
            },
            Commands::Rate {
                opportunity_id,
                rating,
            } => {
                let id = parse_id(&opportunity_id, "opportunity")?;
                self.machine().rate(id, rating.into()).await?;
                println!("Rated {} {:?}", id, rating);
                Ok(())
            }
            Commands::Payment {
                validation_id,
                amount,
            } => {
                let id = parse_id(&validation_id, "validation")?;
                let validation = controller::record_payment(&self.store, id, amount).await?;
                println!(
                    "Recorded ${:.2} on validation {} (total ${:.2})",
                    amount, validation.id, validation.payments_usd
                );
                Ok(())
            }
            Commands::Approvals => list_approvals(self).await,
            Commands::Approve { approval_id } => decide(self, &approval_id, true).await,
            Commands::Reject { approval_id } => decide(self, &approval_id, false).await,
            Commands::Budget => show_budget(self).await,
            Commands::Policy { command } => match command {
                PolicyCommands::Get { key } => policy_get(self, key).await,
                PolicyCommands::Set { key, value } => policy_set(self, &key, &value).await,
            },
            Commands::Events { kind, limit } => show_events(self, kind, limit).await,
        }
    }
}

impl App {
    fn open() -> Result<Self> {
        let config = config::config()?;
        let store = Store::open(&config.database)
            .with_context(|| format!("Failed to open database: {}", config.database.display()))?;
        let policy = Policy::from_store(store.clone());
        Ok(Self {
            config,
            store,
            policy,
        })
    }

    fn machine(&self) -> OpportunityMachine {
        OpportunityMachine::new(self.store.clone(), self.policy.clone())
    }

    fn notifier(&self) -> Arc<dyn Notifier> {
        match &self.config.telegram {
            Some(settings) => Arc::new(TelegramNotifier::new(settings.clone())),
            None => Arc::new(LogNotifier),
        }
    }

    fn local_backend(&self) -> Result<Arc<dyn InferenceBackend>> {
        let local = &self.config.local;
        Ok(Arc::new(OllamaBackend::new(
            local.url.clone(),
            Duration::from_secs(local.timeout_secs),
        )?))
    }

    fn router(&self) -> Result<Arc<ModelRouter>> {
        let gate = ApprovalGate::new(
            self.store.clone(),
            self.notifier(),
            self.config.approval.timeout(),
            self.config.approval.poll_interval(),
        );
        let mut router = ModelRouter::new(
            self.store.clone(),
            self.policy.clone(),
            self.local_backend()?,
            self.config.local.clone(),
            gate,
        );

        if let Some(api_key) = &self.config.anthropic_api_key {
            let cloud = AnthropicBackend::new(
                self.config.cloud.url.clone(),
                api_key.clone(),
                Duration::from_secs(self.config.cloud.timeout_secs),
            )?;
            router = router.with_cloud(Arc::new(cloud), self.config.cloud.clone());
        } else {
            tracing::info!("ANTHROPIC_API_KEY not set, cloud backend disabled");
        }
        Ok(Arc::new(router))
    }

    fn queue(&self) -> Result<JobQueue> {
        Ok(JobQueue::new(
            self.store.clone(),
            self.policy.clone(),
            self.router()?,
            self.config.workers.concurrency,
        ))
    }

    /// `None` when no launcher command is configured
    fn controller(&self) -> Option<ValidationController> {
        let launcher = self.config.launcher.clone()?;
        Some(ValidationController::new(
            self.store.clone(),
            self.policy.clone(),
            Arc::new(CommandLauncher::new(launcher)),
        ))
    }

    fn scheduler(&self) -> Result<CycleScheduler> {
        let sensors: Vec<Arc<dyn Sensor>> = self
            .config
            .sensors
            .iter()
            .map(|sensor| {
                Arc::new(CommandSensor::new(sensor.clone(), self.machine())) as Arc<dyn Sensor>
            })
            .collect();

        Ok(CycleScheduler::new(
            self.store.clone(),
            self.policy.clone(),
            self.notifier(),
            Arc::new(MetricsReflector::new(self.store.clone(), self.policy.clone())),
            self.local_backend()?,
            self.config.home.clone(),
        )
        .with_sensors(sensors))
    }

    fn runtime(&self) -> Result<Runtime> {
        let controller = self.controller();
        if controller.is_none() {
            tracing::warn!("No launcher configured, validation controller disabled");
        }
        Ok(Runtime::new(
            self.scheduler()?,
            self.queue()?,
            controller,
            self.config.intervals.clone(),
        ))
    }
}

fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    Uuid::parse_str(raw).with_context(|| format!("Invalid {} ID: {}", what, raw))
}

async fn tick(app: &App) -> Result<()> {
    match app.scheduler()?.tick().await? {
        TickOutcome::Skipped => println!("Another tick is running"),
        TickOutcome::Completed {
            cycle_id,
            selected,
            job_id,
        } => {
            println!("Cycle {} completed", cycle_id);
            match (selected, job_id) {
                (Some(opp), Some(job)) => println!("  Selected {} (plan job {})", opp, job),
                (Some(opp), None) => println!("  Selected {}", opp),
                _ => println!("  Nothing above the viability floor"),
            }
        }
        TickOutcome::BudgetExhausted { cycle_id } => {
            println!("Cycle {} stopped: budget exhausted", cycle_id)
        }
        TickOutcome::Failed { cycle_id, error } => {
            anyhow::bail!("Cycle {} failed: {}", cycle_id, error)
        }
    }
    Ok(())
}

async fn work(app: &App, drain: bool) -> Result<()> {
    let queue = app.queue()?;
    let (mut done, mut failed) = (0, 0);
    loop {
        match queue.poll_once().await? {
            PollOutcome::Polled {
                claimed,
                done: d,
                failed: f,
            } => {
                done += d;
                failed += f;
                if claimed == 0 || !drain {
                    break;
                }
            }
            PollOutcome::Skipped => break,
        }
    }
    println!("Jobs: {} done, {} failed", done, failed);
    Ok(())
}

async fn validate(app: &App) -> Result<()> {
    let controller = app
        .controller()
        .context("No launcher configured (set `launcher:` in .prospector/config.yaml)")?;
    if let Some(report) = controller.run_once().await? {
        println!("Zombies killed:    {}", report.zombies_killed);
        println!("Converted:         {}", report.converted);
        println!("Expired:           {}", report.expired);
        println!("Shipped:           {}", report.shipped);
        println!("Build failures:    {}", report.build_failures);
        println!("Launched:          {}", report.launched);
        println!("Launch failures:   {}", report.launch_failures);
    }
    Ok(())
}

async fn add(
    app: &App,
    title: String,
    source: String,
    viability: f64,
    evidence: Option<String>,
) -> Result<()> {
    let mut new = NewOpportunity::new(title, source).with_viability(viability);
    if let Some(evidence) = evidence {
        new = new.with_evidence(evidence);
    }
    let opp = app.machine().insert(new).await?;
    println!("{}", opp.id);
    Ok(())
}

async fn show_overview(app: &App) -> Result<()> {
    let counts = app.machine().counts().await?;
    let jobs = app.store.call(crate::store::jobs::counts).await?;
    let cycles = app
        .store
        .call(|conn| crate::store::cycles::recent(conn, 5))
        .await?;

    println!("Opportunities:");
    for status in OpportunityStatus::ALL {
        let count = counts.get(&status).copied().unwrap_or(0);
        println!("  {:<20} {}", status.as_str(), count);
    }
    println!();
    println!(
        "Jobs: {} pending, {} locked, {} running, {} done, {} failed",
        jobs.pending, jobs.locked, jobs.running, jobs.done, jobs.failed
    );
    println!();
    println!("{:<38} {:<18} {:<26} NOTE", "CYCLE", "STATUS", "STARTED");
    println!("{}", "-".repeat(90));
    for cycle in cycles {
        println!(
            "{:<38} {:<18} {:<26} {}",
            cycle.id,
            cycle.status.as_str(),
            cycle.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            cycle.note.unwrap_or_default()
        );
    }
    Ok(())
}

async fn show_opportunity(app: &App, raw_id: &str) -> Result<()> {
    let id = parse_id(raw_id, "opportunity")?;
    let machine = app.machine();
    let opp = machine
        .get(id)
        .await?
        .with_context(|| format!("Opportunity not found: {}", id))?;

    println!("Opportunity: {}", opp.id);
    println!("Title:       {}", opp.title);
    println!("Source:      {}", opp.source);
    println!("Status:      {} (since {})", opp.status, opp.status_since);
    println!(
        "Scores:      viability {:.0} (weighted {:.1}), pain {:.0}, wtp {:.0}, competition {:.0}",
        opp.scores.viability,
        opp.scores.weighted_viability,
        opp.scores.pain,
        opp.scores.willingness_to_pay,
        opp.scores.competition
    );
    if let Some(rating) = opp.rating {
        println!("Rating:      {}", rating);
    }
    if let Some(plan) = &opp.plan {
        println!("\nPlan:\n{}", plan);
    }

    println!("\nHistory:");
    for event in machine.history(id).await? {
        println!(
            "  {}  {:<20} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.status.as_str(),
            event.payload
        );
    }

    let validations = app
        .store
        .call(move |conn| crate::store::validations::for_opportunity(conn, id))
        .await?;
    if !validations.is_empty() {
        println!("\nValidations:");
        for v in validations {
            println!(
                "  {}  {:<10} ${:.2}  ends {}  {}",
                v.id, v.status, v.payments_usd, v.window_ends_at, v.artifact
            );
        }
    }
    Ok(())
}

async fn list_approvals(app: &App) -> Result<()> {
    let pending = app.store.call(approvals::pending).await?;
    if pending.is_empty() {
        println!("No pending approvals");
        return Ok(());
    }

    println!("{:<38} {:<22} {:<16} REASON", "APPROVAL ID", "REQUESTED", "SPENT/BUDGET");
    println!("{}", "-".repeat(100));
    for req in &pending {
        println!("{}", approval_row(req));
    }
    Ok(())
}

fn approval_row(req: &ApprovalRequest) -> String {
    format!(
        "{:<38} {:<22} {:<16} {}",
        req.id,
        req.requested_at.format("%Y-%m-%d %H:%M:%S"),
        format!("${:.2}/${:.2}", req.spent_usd, req.budget_usd),
        req.reason
    )
}

async fn decide(app: &App, raw_id: &str, approve: bool) -> Result<()> {
    let id = parse_id(raw_id, "approval")?;
    let verb = if approve { "Approved" } else { "Rejected" };
    if approval::decide(&app.store, id, approve).await? {
        println!("{} {}", verb, id);
    } else {
        println!("Approval {} was already resolved", id);
    }
    Ok(())
}

async fn show_budget(app: &App) -> Result<()> {
    let tracker = BudgetTracker::new(app.store.clone(), app.policy.clone());
    let status = tracker.status(chrono::Utc::now()).await?;

    println!("State:        {}", status.state);
    println!("Today:        ${:.4} (cloud budget ${:.2}/day)", status.spend.today_usd, status.daily_cloud_budget_usd);
    println!("This week:    ${:.4}", status.spend.week_usd);
    println!("All time:     ${:.4}", status.spend.all_time_usd);
    println!("Ceiling:      ${:.2} (${:.2} remaining)", status.ceiling_usd, status.remaining_usd);
    Ok(())
}

async fn policy_get(app: &App, key: Option<String>) -> Result<()> {
    match key {
        Some(key) => {
            let value = match app.policy.get(&key).await? {
                Some(value) => value,
                None => default_value(&key)
                    .with_context(|| format!("Unknown policy key: {}", key))?,
            };
            println!("{}", value);
        }
        None => {
            for (key, value) in app.policy.effective().await? {
                println!("{:<30} {}", key, value);
            }
        }
    }
    Ok(())
}

async fn policy_set(app: &App, key: &str, raw: &str) -> Result<()> {
    if !keys::ALL.contains(&key) {
        anyhow::bail!("Unknown policy key: {} (known: {})", key, keys::ALL.join(", "));
    }
    let value: Value =
        serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    app.policy.set(key, value.clone()).await?;
    println!("{} = {}", key, value);
    Ok(())
}

async fn show_events(app: &App, kind: Option<String>, limit: usize) -> Result<()> {
    let kind = kind
        .map(|k| k.parse::<SystemEventKind>())
        .transpose()?;
    let recent = app
        .store
        .call(move |conn| events::recent(conn, kind, limit))
        .await?;

    for event in recent {
        println!(
            "{}  {:<26} {:<38} {}",
            event.timestamp.format("%Y-%m-%d %H:%M:%S"),
            event.kind.as_str(),
            event.subject.unwrap_or_default(),
            event.payload
        );
    }
    Ok(())
}

/// Show resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("Config file: {}", cfg.config_file.as_ref().map(|p| p.display().to_string()).unwrap_or_else(|| "(none - using defaults)".to_string()));
    println!();
    println!("Paths:");
    println!("  Home:     {}", cfg.home.display());
    println!("  Database: {}", cfg.database.display());
    println!();
    println!("Intervals:");
    println!("  Tick:           {}s", cfg.intervals.tick_secs);
    println!("  Worker poll:    {}s", cfg.intervals.worker_poll_secs);
    println!("  Controller:     {}s", cfg.intervals.controller_secs);
    println!("  Concurrency:    {}", cfg.workers.concurrency);
    println!();
    println!("Local backend: {} (default model {}, vision {})", cfg.local.url, cfg.local.default_model, cfg.local.vision_model);
    println!(
        "Cloud backend: {}",
        if cfg.anthropic_api_key.is_some() { cfg.cloud.url.as_str() } else { "(disabled - ANTHROPIC_API_KEY not set)" }
    );
    let mut routes: Vec<_> = cfg.cloud.routes.iter().collect();
    routes.sort_by_key(|(task, _)| task.as_str());
    for (task, route) in routes {
        println!("  {:<12} {}", task.as_str(), route.chain().collect::<Vec<_>>().join(" -> "));
    }
    println!();
    println!("Approval timeout: {}s (poll {}s)", cfg.approval.timeout_secs, cfg.approval.poll_secs);
    println!("Notifier:         {}", if cfg.telegram.is_some() { "telegram" } else { "log" });
    println!();
    println!("Sensors:");
    if cfg.sensors.is_empty() {
        println!("  (none)");
    }
    for sensor in &cfg.sensors {
        println!("  {:<16} {} {}", sensor.name, sensor.command, sensor.args.join(" "));
    }
    match &cfg.launcher {
        Some(launcher) => println!("Launcher: {} {}", launcher.command, launcher.args.join(" ")),
        None => println!("Launcher: (none)"),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ApprovalStatus;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_approval_row_shows_request_time_and_spend() {
        let req = ApprovalRequest {
            id: Uuid::nil(),
            reason: "planning request over budget".to_string(),
            spent_usd: 2.013,
            budget_usd: 2.0,
            status: ApprovalStatus::Pending,
            requested_at: Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap(),
            resolved_at: None,
        };

        let row = approval_row(&req);
        assert!(row.contains("2026-03-14 09:26:53"));
        assert!(row.contains("$2.01/$2.00"));
        assert!(row.ends_with("planning request over budget"));
    }

    #[test]
    fn test_parse_id_names_the_kind() {
        let err = parse_id("not-a-uuid", "approval").unwrap_err();
        assert!(err.to_string().contains("approval"));
    }
}
