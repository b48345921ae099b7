use anyhow::{bail, Context, Result};
use comfy_table::{
    modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL, Attribute, Cell, Color, Table,
};
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use crate::api;
use crate::api::deployments::{CreateDeployment, ListFilter};
use crate::api::error::{ApiError, StreamError, WatchError};
use crate::api::models::{Deployment, DeploymentLogEntry, DeploymentStatus, StepStatus};
use crate::config::Config;
use crate::observe::DeploymentWatch;

/// Parse duration string (e.g., "5m", "30s", "1h")
pub(super) fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("Duration string is empty");
    }

    let (num_str, unit) = if let Some(num_str) = s.strip_suffix("ms") {
        (num_str, "ms")
    } else {
        // The trailing unit char may be multi-byte.
        let unit_len = s.chars().next_back().map_or(0, char::len_utf8);
        s.split_at(s.len() - unit_len)
    };

    let num: u64 = num_str.parse().context("Invalid duration number")?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        _ => bail!("Invalid duration unit '{}'. Use ms, s, m, or h", unit),
    };

    Ok(duration)
}

pub(super) fn require_token(config: &Config) -> Result<&str> {
    config
        .get_token()
        .ok_or_else(|| anyhow::anyhow!("Not logged in. Please run 'mdk login' first."))
}

/// Fetch one deployment, turning backend refusals into command-line wording.
pub(super) async fn fetch_deployment(
    http_client: &Client,
    backend_url: &str,
    token: &str,
    id: u64,
) -> Result<Deployment> {
    match api::deployments::get(http_client, backend_url, token, id).await {
        Ok(deployment) => Ok(deployment),
        Err(ApiError::NotFound(_)) => bail!("Deployment {} not found", id),
        Err(ApiError::Unauthorized) => bail!("Authentication failed. Please run 'mdk login' again."),
        Err(err) => Err(err.into()),
    }
}

pub(super) fn watch_error_to_cli(err: WatchError, id: u64) -> anyhow::Error {
    match err {
        WatchError::Api(ApiError::NotFound(_)) => anyhow::anyhow!("Deployment {} not found", id),
        WatchError::Api(ApiError::Unauthorized)
        | WatchError::Stream(StreamError::NotAuthenticated) => {
            anyhow::anyhow!("Authentication failed. Please run 'mdk login' again.")
        }
        WatchError::Stream(StreamError::Rejected { status, message }) => {
            anyhow::anyhow!("Log stream rejected ({}): {}", status, message)
        }
        other => other.into(),
    }
}

/// Exit code policy shared by everything that waits for an outcome: a
/// failed job is a command failure, a cancelled one is not.
pub(super) fn report_outcome(deployment: &Deployment) -> Result<()> {
    match deployment.status {
        DeploymentStatus::Failed => {
            if deployment.error_msg.is_empty() {
                bail!("Deployment {} failed", deployment.id);
            }
            bail!("Deployment {} failed: {}", deployment.id, deployment.error_msg);
        }
        DeploymentStatus::Cancelled => {
            println!("Deployment {} was cancelled.", deployment.id);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn truncate(text: &str, max: usize) -> String {
    if text.chars().count() > max {
        let cut: String = text.chars().take(max - 3).collect();
        format!("{}...", cut)
    } else {
        text.to_string()
    }
}

/// Format created time (just show date and time, not full RFC3339)
pub(super) fn format_timestamp(value: &str) -> String {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(value) {
        dt.format("%Y-%m-%d %H:%M:%S").to_string()
    } else {
        value.to_string()
    }
}

pub(super) fn format_duration_secs(seconds: i64) -> String {
    if seconds >= 60 {
        format!("{}m{:02}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

pub(super) fn format_duration_ms(ms: i64) -> String {
    if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}

fn status_cell(status: &DeploymentStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        DeploymentStatus::Success => cell.fg(Color::Green),
        DeploymentStatus::Failed => cell.fg(Color::Red),
        DeploymentStatus::Running => cell.fg(Color::Yellow),
        DeploymentStatus::Pending => cell.fg(Color::Cyan),
        DeploymentStatus::Cancelled => cell.fg(Color::DarkGrey),
    }
}

fn step_status_cell(status: &StepStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        StepStatus::Success => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::Running => cell.fg(Color::Yellow),
        StepStatus::Skipped => cell.fg(Color::DarkGrey),
    }
}

pub(super) fn steps_table(entries: &[DeploymentLogEntry]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("#").add_attribute(Attribute::Bold),
            Cell::new("ACTION").add_attribute(Attribute::Bold),
            Cell::new("STATUS").add_attribute(Attribute::Bold),
            Cell::new("DURATION").add_attribute(Attribute::Bold),
            Cell::new("OUTPUT").add_attribute(Attribute::Bold),
        ]);

    for entry in entries {
        let output_cell = if !entry.error_msg.is_empty() {
            Cell::new(truncate(&entry.error_msg, 48)).fg(Color::Red)
        } else if entry.output.is_empty() {
            Cell::new("-")
        } else {
            Cell::new(truncate(&entry.output, 48))
        };

        table.add_row(vec![
            Cell::new(entry.step),
            Cell::new(&entry.action),
            step_status_cell(&entry.status),
            Cell::new(format_duration_ms(entry.duration)),
            output_cell,
        ]);
    }

    table
}

/// List deployments, optionally filtered by status and type
pub async fn list_deployments(
    http_client: &Client,
    backend_url: &str,
    config: &Config,
    status: Option<String>,
    kind: Option<String>,
    page: u32,
    page_size: u32,
) -> Result<()> {
    let token = require_token(config)?;

    let filter = ListFilter {
        status: status.as_deref().map(str::parse).transpose()?,
        kind: kind.as_deref().map(str::parse).transpose()?,
        page,
        page_size,
    };
    debug!(?filter.status, ?filter.kind, page, page_size, "Listing deployments");

    let listing = match api::deployments::list(http_client, backend_url, token, &filter).await {
        Ok(listing) => listing,
        Err(ApiError::Unauthorized) => bail!("Authentication failed. Please run 'mdk login' again."),
        Err(err) => return Err(err.into()),
    };

    if listing.deployments.is_empty() {
        println!("No deployments found");
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("ID").add_attribute(Attribute::Bold),
            Cell::new("NAME").add_attribute(Attribute::Bold),
            Cell::new("TYPE").add_attribute(Attribute::Bold),
            Cell::new("STATUS").add_attribute(Attribute::Bold),
            Cell::new("SERVER").add_attribute(Attribute::Bold),
            Cell::new("STARTED").add_attribute(Attribute::Bold),
            Cell::new("DURATION").add_attribute(Attribute::Bold),
            Cell::new("ERROR").add_attribute(Attribute::Bold),
        ]);

    for deployment in &listing.deployments {
        let started = deployment
            .started_at
            .as_deref()
            .map(format_timestamp)
            .unwrap_or_else(|| "-".to_string());

        let duration = if deployment.status.is_terminal() {
            format_duration_secs(deployment.duration)
        } else {
            "-".to_string()
        };

        let error_cell = if deployment.error_msg.is_empty() {
            Cell::new("-")
        } else {
            Cell::new(truncate(&deployment.error_msg, 40)).fg(Color::Red)
        };

        let mut name_cell = Cell::new(&deployment.name);
        if deployment.status == DeploymentStatus::Running {
            name_cell = name_cell.add_attribute(Attribute::Bold);
        }

        table.add_row(vec![
            Cell::new(deployment.id),
            name_cell,
            Cell::new(deployment.kind.to_string()),
            status_cell(&deployment.status),
            Cell::new(deployment.server_id),
            Cell::new(started),
            Cell::new(duration),
            error_cell,
        ]);
    }

    println!("{}", table);

    let total_pages = (listing.total as u64).div_ceil(filter.page_size.max(1) as u64);
    println!(
        "Page {} of {} ({} total)",
        filter.page,
        total_pages.max(1),
        listing.total
    );

    Ok(())
}

/// Show deployment details and its recorded steps
pub async fn show_deployment(
    http_client: &Client,
    backend_url: &str,
    config: &Config,
    id: u64,
) -> Result<()> {
    let token = require_token(config)?;

    let deployment = fetch_deployment(http_client, backend_url, token, id).await?;

    super::follow_ui::print_deployment_snapshot(&deployment);

    if !deployment.logs.is_empty() {
        println!();
        println!("{}", steps_table(&deployment.logs));
    }

    Ok(())
}

/// Options for creating a deployment job.
#[derive(Debug, Default)]
pub struct CreateOptions {
    pub name: String,
    pub kind: String,
    pub server_id: u64,
    pub description: Option<String>,
    pub nginx_config_id: Option<u64>,
    pub package_id: Option<u64>,
    pub certificate_id: Option<u64>,
    pub target_path: Option<String>,
    pub no_backup: bool,
    pub restart_service: bool,
    pub service_name: Option<String>,
    pub params: Vec<(String, String)>,
}

/// Create a deployment job; the backend fills per-type defaults for
/// anything left unset (target path, service name)
pub async fn create_deployment(
    http_client: &Client,
    backend_url: &str,
    config: &Config,
    options: CreateOptions,
) -> Result<()> {
    let token = require_token(config)?;

    let deploy_params = if options.params.is_empty() {
        String::new()
    } else {
        let map: serde_json::Map<String, serde_json::Value> = options
            .params
            .into_iter()
            .map(|(key, value)| (key, serde_json::Value::String(value)))
            .collect();
        serde_json::to_string(&map).context("Failed to encode deploy parameters")?
    };

    let request = CreateDeployment {
        name: options.name,
        description: options.description.unwrap_or_default(),
        kind: options.kind.parse()?,
        server_id: options.server_id,
        nginx_config_id: options.nginx_config_id,
        package_id: options.package_id,
        certificate_id: options.certificate_id,
        target_path: options.target_path.unwrap_or_default(),
        backup_enabled: !options.no_backup,
        restart_service: options.restart_service,
        service_name: options.service_name.unwrap_or_default(),
        deploy_params,
    };

    info!("Creating deployment '{}'", request.name);

    let created = match api::deployments::create(http_client, backend_url, token, &request).await {
        Ok(created) => created,
        Err(ApiError::InvalidState(message)) => bail!("Cannot create deployment: {}", message),
        Err(ApiError::Unauthorized) => bail!("Authentication failed. Please run 'mdk login' again."),
        Err(err) => return Err(err.into()),
    };

    println!("✓ Created deployment {} ({})", created.id, created.name);
    super::follow_ui::print_deployment_snapshot(&created);
    println!();
    println!("Start it with 'mdk deployment execute {}'", created.id);

    Ok(())
}

/// Delete a deployment record (running jobs are refused by the backend)
pub async fn delete_deployment(
    http_client: &Client,
    backend_url: &str,
    config: &Config,
    id: u64,
    yes: bool,
) -> Result<()> {
    let token = require_token(config)?;

    if !yes {
        use std::io::{BufRead, IsTerminal, Write};

        if !std::io::stdin().is_terminal() {
            bail!("Refusing to delete without confirmation; pass --yes to proceed");
        }
        eprint!("Delete deployment {}? [y/N] ", id);
        std::io::stderr().flush()?;

        let mut line = String::new();
        std::io::stdin().lock().read_line(&mut line)?;
        if !matches!(line.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    match api::deployments::delete(http_client, backend_url, token, id).await {
        Ok(_) => {}
        Err(ApiError::NotFound(_)) => bail!("Deployment {} not found", id),
        Err(ApiError::InvalidState(message)) => bail!("Cannot delete: {}", message),
        Err(ApiError::Unauthorized) => bail!("Authentication failed. Please run 'mdk login' again."),
        Err(err) => return Err(err.into()),
    }

    println!("✓ Deleted deployment {}", id);
    Ok(())
}

/// Start executing a deployment and optionally follow it to completion
pub async fn execute_deployment(
    http_client: &Client,
    backend_url: &str,
    config: &Config,
    id: u64,
    follow: bool,
    timeout_str: &str,
) -> Result<()> {
    let token = require_token(config)?;

    info!("Executing deployment {}", id);

    let message = match api::deployments::execute(http_client, backend_url, token, id).await {
        Ok(message) => message,
        Err(ApiError::NotFound(_)) => bail!("Deployment {} not found", id),
        Err(ApiError::InvalidState(message)) => bail!("Cannot execute: {}", message),
        Err(ApiError::Unauthorized) => bail!("Authentication failed. Please run 'mdk login' again."),
        Err(err) => return Err(err.into()),
    };

    println!("✓ {}", message);

    if follow {
        let deployment =
            super::follow_ui::follow_deployment(http_client, backend_url, config, id, timeout_str)
                .await?;
        report_outcome(&deployment)
    } else {
        println!("Follow progress with 'mdk deployment logs {} --follow'", id);
        Ok(())
    }
}

/// Ask a running deployment to stop after its current step
///
/// Cancellation lands asynchronously, so with `--follow` the command keeps
/// watching until the job actually reaches its terminal status.
pub async fn cancel_deployment(
    http_client: &Client,
    backend_url: &str,
    config: &Config,
    id: u64,
    follow: bool,
    timeout_str: &str,
) -> Result<()> {
    let token = require_token(config)?;

    info!("Cancelling deployment {}", id);

    let message = match api::deployments::cancel(http_client, backend_url, token, id).await {
        Ok(message) => message,
        Err(ApiError::NotFound(_)) => bail!("Deployment {} not found", id),
        Err(ApiError::InvalidState(message)) => bail!("Cannot cancel: {}", message),
        Err(ApiError::Unauthorized) => bail!("Authentication failed. Please run 'mdk login' again."),
        Err(err) => return Err(err.into()),
    };

    println!("✓ {}", message);

    if follow {
        let deployment =
            super::follow_ui::follow_deployment(http_client, backend_url, config, id, timeout_str)
                .await?;
        return report_outcome(&deployment);
    }

    println!(
        "The in-flight step finishes first; follow with 'mdk deployment logs {} --follow'",
        id
    );
    Ok(())
}

/// Roll a deployment back to its pre-execution backup
///
/// The backend schedules a fresh job for the restore, so everything after
/// this point (following, logs) targets the new id.
pub async fn rollback_deployment(
    http_client: &Client,
    backend_url: &str,
    config: &Config,
    id: u64,
    follow: bool,
    timeout_str: &str,
) -> Result<()> {
    let token = require_token(config)?;

    info!("Rolling back deployment {}", id);

    let outcome = match api::deployments::rollback(http_client, backend_url, token, id).await {
        Ok(outcome) => outcome,
        Err(ApiError::NotFound(_)) => bail!("Deployment {} not found", id),
        Err(ApiError::InvalidState(message)) => bail!("Cannot rollback: {}", message),
        Err(ApiError::Unauthorized) => bail!("Authentication failed. Please run 'mdk login' again."),
        Err(err) => return Err(err.into()),
    };

    let new_id = outcome.deployment.id;

    println!();
    println!("✓ Rollback initiated successfully!");
    println!("  New deployment ID: {}", new_id);
    println!("  Rolled back from:  {}", id);
    println!();

    if follow {
        let deployment = super::follow_ui::follow_deployment(
            http_client,
            backend_url,
            config,
            new_id,
            timeout_str,
        )
        .await?;
        report_outcome(&deployment)
    } else {
        println!("Follow progress with 'mdk deployment logs {} --follow'", new_id);
        Ok(())
    }
}

/// Print a deployment's step log, or follow it live
pub async fn show_logs(
    http_client: &Client,
    backend_url: &str,
    config: &Config,
    id: u64,
    follow: bool,
    timeout_str: &str,
) -> Result<()> {
    let token = require_token(config)?;

    if follow {
        let deployment =
            super::follow_ui::follow_deployment(http_client, backend_url, config, id, timeout_str)
                .await?;
        return report_outcome(&deployment);
    }

    let deployment = fetch_deployment(http_client, backend_url, token, id).await?;
    let watch = DeploymentWatch::open(
        http_client,
        backend_url,
        token,
        id,
        &deployment.status,
        false,
        None,
    )
    .await
    .map_err(|err| watch_error_to_cli(err, id))?;

    if watch.entries().is_empty() {
        println!("No log entries for deployment {} yet", id);
        return Ok(());
    }

    println!("{}", steps_table(watch.entries()));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_accepts_all_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration(" 5s ").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_rejects_bad_input() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("tens").is_err());
        assert!(parse_duration("10d").is_err());
        // 'µ' is multi-byte; it must read as a bad unit.
        assert!(parse_duration("10µ").is_err());
    }
}
