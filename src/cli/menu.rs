//! Argos/BitBar menu rendering. Every line printed here ends up as a menu
//! entry, so the layer stays write-only: actions loop back into the binary
//! through `bash=` attributes.

use std::io::Write;
use std::path::Path;

use anyhow::Result;
use chrono::Duration;

use crate::{
    config::Config,
    schedule::WorkSchedule,
    store::TrackingStore,
    tracker::{Issue, TrackerClient},
    tracking::working_time_between,
    utils::clock::Clock,
};

const QUICK_LOG_MINUTES: [i64; 4] = [5, 10, 15, 20];

/// JQL picking up the user's own unresolved issues in a given status.
fn status_query(status: &str) -> String {
    format!("status = \"{status}\" AND resolution = Unresolved AND assignee in (currentUser())")
}

/// Browse link in the `host/projects/PROJ/issues/PROJ-1` shape.
fn browse_url(host: &str, issue_key: &str) -> String {
    let project = issue_key.split('-').next().unwrap_or(issue_key);
    format!(
        "{}/projects/{}/issues/{}",
        host.trim_end_matches('/'),
        project,
        issue_key
    )
}

fn format_elapsed(elapsed: Duration) -> String {
    let hours = elapsed.num_hours();
    let minutes = elapsed.num_minutes() % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m")
    } else {
        format!("{minutes}m")
    }
}

/// Renders the whole menu for the current remote and local state.
pub async fn render_menu(
    config: &Config,
    schedule: &WorkSchedule,
    client: &dyn TrackerClient,
    store: &TrackingStore,
    clock: &dyn Clock,
    exe: &Path,
    out: &mut impl Write,
) -> Result<()> {
    let in_progress = client
        .search_issues(&status_query(&config.in_progress_status))
        .await?;

    match in_progress.as_slice() {
        [] => {
            let next = client
                .search_issues(&status_query(&config.next_status))
                .await?;
            render_idle(config, &next, exe, out)?;
        }
        [issue] => render_tracking(config, schedule, store, clock, issue, exe, out).await?,
        _ => writeln!(out, "Can only have 1 issue in progress!")?,
    }

    Ok(())
}

fn render_idle(config: &Config, next: &[Issue], exe: &Path, out: &mut impl Write) -> Result<()> {
    writeln!(out, "Not working... :coffee:")?;
    writeln!(out, "---")?;

    if next.is_empty() {
        writeln!(out, "Put issues in \"{}\" to work on them", config.next_status)?;
        return Ok(());
    }

    for issue in next {
        writeln!(out, "<b>{}</b>: {}", issue.key, issue.summary)?;
        writeln!(
            out,
            "--{} | bash='{} start {}' terminal=false refresh=true iconName=media-playback-start",
            config.start_transition,
            exe.display(),
            issue.key
        )?;
        writeln!(
            out,
            "--{} | bash='{} transition {} \"{}\"' terminal=false refresh=true iconName=media-playback-stop",
            config.deselect_transition,
            exe.display(),
            issue.key,
            config.deselect_transition
        )?;
        writeln!(
            out,
            "--Show in browser... | href='{}' iconName=application-exit",
            browse_url(&config.host, &issue.key)
        )?;
    }

    Ok(())
}

async fn render_tracking(
    config: &Config,
    schedule: &WorkSchedule,
    store: &TrackingStore,
    clock: &dyn Clock,
    issue: &Issue,
    exe: &Path,
    out: &mut impl Write,
) -> Result<()> {
    writeln!(out, "Working on {} :cold_sweat:", issue.key)?;
    writeln!(out, "---")?;
    writeln!(out, "<b>{}</b>", issue.summary)?;
    if let Some(description) = issue.description.as_deref().filter(|d| !d.is_empty()) {
        writeln!(out, "{description}")?;
    }

    // The elapsed line only makes sense when this invocation's store actually
    // has the record. A remote-only "In Progress" issue has nothing to show.
    let offset = config.local_offset()?;
    if let Some(started_at) = store.load().await?.started_at(&issue.key) {
        let elapsed = working_time_between(schedule, offset, started_at, clock.time());
        writeln!(out, "Tracked {} of working time", format_elapsed(elapsed))?;
    }

    writeln!(out, "---")?;
    writeln!(out, "Log work")?;
    for minutes in QUICK_LOG_MINUTES {
        writeln!(
            out,
            "--{minutes} min | bash='{} log {} {minutes}' terminal=false refresh=true",
            exe.display(),
            issue.key
        )?;
    }
    writeln!(
        out,
        "{} | bash='{} stop {}' terminal=false refresh=true iconName=media-playback-pause",
        config.stop_transition,
        exe.display(),
        issue.key
    )?;
    writeln!(
        out,
        "Show in browser... | href='{}' iconName=application-exit",
        browse_url(&config.host, &issue.key)
    )?;

    Ok(())
}
