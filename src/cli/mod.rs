pub mod menu;

use std::env;

use ansi_term::Style;
use anyhow::{bail, Context, Result};
use chrono::{Duration, FixedOffset};
use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;
use tracing::warn;

use crate::{
    config::Config,
    schedule::WorkSchedule,
    store::TrackingStore,
    tracker::{jira::JiraClient, TrackerClient},
    tracking::{
        working_time_between, Displaced, StopOutcome, TrackingStateMachine, TransitionGate,
    },
    utils::{
        clock::{Clock, DefaultClock},
        dir::create_application_default_path,
        logging::enable_logging,
    },
};

#[derive(Parser, Debug)]
#[command(name = "Jirabar", version, long_about = None)]
#[command(about = "Menu bar work tracking for Jira-style issue trackers", long_about = None)]
struct Args {
    #[command(subcommand)]
    commands: Commands,
    #[arg(long, help = "Enable logging")]
    log: bool,
}

#[derive(Subcommand, Debug)]
#[command(version, about, long_about = None)]
enum Commands {
    #[command(about = "Render the Argos/BitBar menu for the current state")]
    Menu {},
    #[command(about = "Start tracking an issue, stopping whatever was tracked before")]
    Start {
        #[arg(help = "Issue key, for example PROJ-123")]
        issue: String,
    },
    #[command(about = "Stop tracking an issue and log the elapsed working time")]
    Stop {
        #[arg(help = "Issue key, for example PROJ-123")]
        issue: String,
    },
    #[command(about = "Show the currently tracked issue")]
    Status {},
    #[command(about = "Execute a workflow transition on an issue")]
    Transition {
        #[arg(help = "Issue key, for example PROJ-123")]
        issue: String,
        #[arg(help = "Transition name as the tracker shows it, for example \"Deselect\"")]
        name: String,
    },
    #[command(about = "Submit a manual work log entry")]
    Log {
        #[arg(help = "Issue key, for example PROJ-123")]
        issue: String,
        #[arg(help = "Minutes to log")]
        minutes: i64,
        #[arg(long, default_value = "Logged from the menu")]
        comment: String,
    },
}

pub async fn run_cli() -> Result<()> {
    let args = Args::parse();

    let dir = create_application_default_path()?;

    let logging_level = if args.log {
        Some(LevelFilter::TRACE)
    } else {
        None
    };
    enable_logging(&dir, logging_level, args.log)?;

    let config = Config::load(&dir)?;
    let schedule = config.schedule()?;
    let offset = config.local_offset()?;
    let store = TrackingStore::new(&dir);
    let client = JiraClient::new(
        &config.host,
        &config.username,
        &config.password,
        config.request_timeout(),
    )?;
    let clock = DefaultClock;

    let context = Invocation {
        config,
        schedule,
        offset,
        store,
        client,
        clock,
    };

    match args.commands {
        Commands::Menu {} => context.menu().await,
        Commands::Start { issue } => context.start(&issue).await,
        Commands::Stop { issue } => context.stop(&issue).await,
        Commands::Status {} => context.status().await,
        Commands::Transition { issue, name } => context.transition(&issue, &name).await,
        Commands::Log {
            issue,
            minutes,
            comment,
        } => context.log(&issue, minutes, &comment).await,
    }
}

/// Everything one short-lived invocation works with.
struct Invocation {
    config: Config,
    schedule: WorkSchedule,
    offset: FixedOffset,
    store: TrackingStore,
    client: JiraClient,
    clock: DefaultClock,
}

impl Invocation {
    fn machine(&self) -> TrackingStateMachine<'_> {
        TrackingStateMachine::new(
            &self.store,
            &self.schedule,
            &self.client,
            &self.clock,
            self.offset,
            self.config.min_loggable(),
            self.config.stop_transition.clone(),
        )
    }

    async fn menu(&self) -> Result<()> {
        let exe = env::current_exe().context("Couldn't resolve own executable for menu actions")?;
        menu::render_menu(
            &self.config,
            &self.schedule,
            &self.client,
            &self.store,
            &self.clock,
            &exe,
            &mut std::io::stdout(),
        )
        .await
    }

    async fn start(&self, issue: &str) -> Result<()> {
        let mut gate = TransitionGate::new(&self.client);
        let report = self.machine().start(issue, &mut gate).await?;

        for displaced in &report.displaced {
            match displaced {
                Displaced::Stopped { issue_key, outcome } => {
                    print_stop_outcome(issue_key, outcome)
                }
                Displaced::Discarded { issue_key, elapsed } => println!(
                    "Cleared {issue_key} without logging {}m, its stop transition isn't allowed",
                    elapsed.num_minutes()
                ),
            }
        }

        // Local state is committed, the workflow transition is best-effort.
        match gate
            .is_allowed(issue, &self.config.start_transition)
            .await
        {
            Ok(true) => {
                if let Err(e) = self
                    .client
                    .execute_transition(issue, &self.config.start_transition)
                    .await
                {
                    warn!("Start transition on {issue} failed: {e}");
                    println!("Tracking {issue}, but the tracker refused \"{}\": {e}",
                        self.config.start_transition);
                    return Ok(());
                }
            }
            Ok(false) => println!(
                "Tracker doesn't offer \"{}\" on {issue} right now, only tracking locally",
                self.config.start_transition
            ),
            Err(e) => warn!("Couldn't list transitions of {issue}: {e}"),
        }

        println!("Tracking {issue}");
        Ok(())
    }

    async fn stop(&self, issue: &str) -> Result<()> {
        let mut gate = TransitionGate::new(&self.client);
        let outcome = self.machine().stop(issue).await?;

        if matches!(outcome, StopOutcome::NotTracking) {
            println!("{issue} was not being tracked");
            return Ok(());
        }
        print_stop_outcome(issue, &outcome);

        match gate.is_allowed(issue, &self.config.stop_transition).await {
            Ok(true) => {
                self.client
                    .execute_transition(issue, &self.config.stop_transition)
                    .await
                    .inspect_err(|e| warn!("Stop transition on {issue} failed: {e}"))
                    .ok();
            }
            Ok(false) => println!(
                "Tracker doesn't offer \"{}\" on {issue}, workflow state left as is",
                self.config.stop_transition
            ),
            Err(e) => warn!("Couldn't list transitions of {issue}: {e}"),
        }

        Ok(())
    }

    async fn status(&self) -> Result<()> {
        let set = self.store.load().await?;
        if set.is_empty() {
            println!("Not tracking anything");
            return Ok(());
        }

        let now = self.clock.time();
        for (issue_key, started_at) in set.iter() {
            let Some(started_at) = started_at else {
                println!("{issue_key}  (unreadable start instant)");
                continue;
            };
            let elapsed = working_time_between(&self.schedule, self.offset, started_at, now);
            println!(
                "{}  since {}  ({}m of working time)",
                Style::new().bold().paint(issue_key),
                started_at.with_timezone(&self.offset).format("%H:%M %x"),
                elapsed.num_minutes()
            );
        }
        Ok(())
    }

    async fn transition(&self, issue: &str, name: &str) -> Result<()> {
        let mut gate = TransitionGate::new(&self.client);
        if !gate
            .is_allowed(issue, name)
            .await
            .with_context(|| format!("Couldn't list transitions of {issue}"))?
        {
            println!("Tracker doesn't offer \"{name}\" on {issue} right now, skipping");
            return Ok(());
        }

        self.client
            .execute_transition(issue, name)
            .await
            .with_context(|| format!("Transition \"{name}\" on {issue} failed"))?;
        println!("Executed \"{name}\" on {issue}");
        Ok(())
    }

    async fn log(&self, issue: &str, minutes: i64, comment: &str) -> Result<()> {
        if minutes <= 0 {
            bail!("Can only log a positive number of minutes, got {minutes}");
        }

        let started_at = self.clock.time().with_timezone(&self.offset);
        self.client
            .submit_work_log(issue, Duration::minutes(minutes), comment, started_at)
            .await
            .with_context(|| format!("Work log for {issue} failed"))?;
        println!("Logged {minutes}m on {issue}");
        Ok(())
    }
}

fn print_stop_outcome(issue_key: &str, outcome: &StopOutcome) {
    match outcome {
        StopOutcome::NotTracking => println!("{issue_key} was not being tracked"),
        StopOutcome::BelowThreshold { elapsed } => println!(
            "Stopped {issue_key} after {}s of working time, too little to log",
            elapsed.num_seconds()
        ),
        StopOutcome::Logged { elapsed } => {
            println!("Logged {}m on {issue_key}", elapsed.num_minutes())
        }
        StopOutcome::LogFailed { elapsed, error } => println!(
            "Stopped {issue_key} but couldn't log {}m: {error}",
            elapsed.num_minutes()
        ),
    }
}
