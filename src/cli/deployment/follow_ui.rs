use std::collections::HashSet;
use std::io::{self, IsTerminal, Write as _};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use reqwest::Client;
use tokio::time::sleep;
use tracing::info;

use crate::api::error::WatchError;
use crate::api::models::{Deployment, DeploymentLogEntry, DeploymentStatus, StepStatus};
use crate::config::Config;
use crate::observe::{CompletionHook, WatchEvent, WatchSlot};

use super::core::{
    fetch_deployment, format_duration_ms, format_duration_secs, format_timestamp, parse_duration,
    require_token, steps_table,
};

// ANSI escape codes for terminal manipulation
mod ansi {
    pub const CLEAR_LINE: &str = "\x1B[2K";
    pub const HIDE_CURSOR: &str = "\x1B[?25l";
    pub const SHOW_CURSOR: &str = "\x1B[?25h";
    pub const RESET: &str = "\x1B[0m";

    /// Move cursor up n lines
    pub fn move_up(n: usize) -> String {
        format!("\x1B[{}A", n)
    }

    /// Move cursor to beginning of line
    pub const CURSOR_TO_START: &str = "\r";
}

// Spinner animation frames
const SPINNER_FRAMES: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];

/// Redraw cadence while the live stream is attached.
const TICK: Duration = Duration::from_millis(250);
/// Snapshot cadence when no stream is attached.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Stream dials per follow: the initial attach plus one reconnect. After
/// that the follow stays on snapshot polling.
const MAX_STREAM_DIALS: u32 = 2;

/// State tracked between redraws
struct FollowState {
    last_status: DeploymentStatus,
    last_error: String,
    spinner_frame: usize,
    is_first_poll: bool,
}

impl FollowState {
    fn new() -> Self {
        Self {
            last_status: DeploymentStatus::Pending,
            last_error: String::new(),
            spinner_frame: 0,
            is_first_poll: true,
        }
    }

    fn should_log_state_change(&self, deployment: &Deployment) -> bool {
        self.is_first_poll
            || self.last_status != deployment.status
            || self.last_error != deployment.error_msg
    }

    fn update(&mut self, deployment: &Deployment) {
        self.last_status = deployment.status.clone();
        self.last_error = deployment.error_msg.clone();
        self.is_first_poll = false;
    }
}

/// A block of terminal lines that redraws in place on every update.
struct LiveStatusSection {
    last_line_count: usize,
}

impl LiveStatusSection {
    fn new() -> Self {
        Self { last_line_count: 0 }
    }

    /// Clear the previously rendered lines
    fn clear_previous(&mut self) {
        if self.last_line_count == 0 {
            return;
        }
        for _ in 0..self.last_line_count {
            print!(
                "{}{}{}",
                ansi::move_up(1),
                ansi::CURSOR_TO_START,
                ansi::CLEAR_LINE
            );
        }
        io::stdout().flush().unwrap();
        self.last_line_count = 0;
    }

    /// Render the status line plus one line per step record, remembering
    /// how many lines the frame took so the next one can overwrite it.
    fn render(
        &mut self,
        deployment: &Deployment,
        entries: &[DeploymentLogEntry],
        state: &FollowState,
        connected: bool,
    ) -> String {
        self.clear_previous();

        let mut output = String::new();
        let mut line_count = 0;

        let spinner = if deployment.status == DeploymentStatus::Running {
            format!("{} ", spinner_frame(state.spinner_frame))
        } else {
            String::new()
        };
        let feed = if connected { "live" } else { "polling" };
        output.push_str(&format!(
            "{}{} Status: {}{}{} ({})\n",
            spinner,
            status_icon(&deployment.status),
            status_color(&deployment.status),
            deployment.status,
            ansi::RESET,
            feed,
        ));
        line_count += 1;

        for entry in entries {
            let timing = if entry.status == StepStatus::Running {
                String::new()
            } else {
                format!(" ({})", format_duration_ms(entry.duration))
            };
            output.push_str(&format!(
                "   {} {}. {} {}{}{}{}\n",
                step_icon(&entry.status),
                entry.step,
                entry.action,
                step_color(&entry.status),
                entry.status,
                ansi::RESET,
                timing,
            ));
            line_count += 1;
        }

        if !deployment.error_msg.is_empty() {
            output.push_str(&format!(
                "   \x1B[31mError:{} {}\n",
                ansi::RESET,
                deployment.error_msg
            ));
            line_count += 1;
        }

        self.last_line_count = line_count;
        output
    }
}

fn status_color(status: &DeploymentStatus) -> &'static str {
    match status {
        DeploymentStatus::Success => "\x1B[32m",
        DeploymentStatus::Failed => "\x1B[31m",
        DeploymentStatus::Running => "\x1B[33m",
        DeploymentStatus::Pending => "\x1B[36m",
        DeploymentStatus::Cancelled => "\x1B[90m",
    }
}

fn status_icon(status: &DeploymentStatus) -> &'static str {
    match status {
        DeploymentStatus::Success => "✓",
        DeploymentStatus::Failed => "✗",
        DeploymentStatus::Running => "⚙",
        DeploymentStatus::Cancelled => "⊘",
        DeploymentStatus::Pending => "○",
    }
}

fn step_color(status: &StepStatus) -> &'static str {
    match status {
        StepStatus::Success => "\x1B[32m",
        StepStatus::Failed => "\x1B[31m",
        StepStatus::Running => "\x1B[33m",
        StepStatus::Skipped => "\x1B[90m",
    }
}

fn step_icon(status: &StepStatus) -> &'static str {
    match status {
        StepStatus::Success => "✓",
        StepStatus::Failed => "✗",
        StepStatus::Running => "⚙",
        StepStatus::Skipped => "⊘",
    }
}

fn spinner_frame(n: usize) -> &'static str {
    SPINNER_FRAMES[n % SPINNER_FRAMES.len()]
}

fn is_tty() -> bool {
    io::stdout().is_terminal()
}

/// Leave a permanent record of a status transition in the scrollback.
fn log_state_change(deployment_id: u64, deployment: &Deployment) {
    info!("Deployment {} is {}", deployment_id, deployment.status);
    if !deployment.error_msg.is_empty() {
        info!("Deployment {} error: {}", deployment_id, deployment.error_msg);
    }
}

/// Print a one-shot summary of a deployment
pub fn print_deployment_snapshot(deployment: &Deployment) {
    println!(
        "{} Status:        {}{}{}",
        status_icon(&deployment.status),
        status_color(&deployment.status),
        deployment.status,
        ansi::RESET
    );
    println!("   Deployment:   {} ({})", deployment.id, deployment.name);
    println!("   Type:         {}", deployment.kind);
    println!("   Server:       #{}", deployment.server_id);
    if !deployment.target_path.is_empty() {
        println!("   Target path:  {}", deployment.target_path);
    }
    if deployment.restart_service && !deployment.service_name.is_empty() {
        println!("   Service:      {} (restarted)", deployment.service_name);
    }
    if deployment.backup_enabled && !deployment.backup_path.is_empty() {
        println!("   Backup:       {}", deployment.backup_path);
    }
    if let Some(origin) = deployment.rolled_back_from {
        println!("   Rolled back:  from deployment {}", origin);
    }
    if let Some(started) = &deployment.started_at {
        println!("   Started:      {}", format_timestamp(started));
    }
    if let Some(completed) = &deployment.completed_at {
        println!("   Completed:    {}", format_timestamp(completed));
    }
    if deployment.status.is_terminal() {
        println!(
            "   Duration:     {}",
            format_duration_secs(deployment.duration)
        );
    }
    if !deployment.error_msg.is_empty() {
        println!(
            "   \x1B[31mError:{}        {}",
            ansi::RESET,
            deployment.error_msg
        );
    }
}

/// Follow a deployment until it reaches a terminal status and return its
/// final state so the caller can decide the exit code.
///
/// While the job is running the step stream drives the display; if the
/// stream cannot be attached or drops twice, the follow falls back to
/// snapshot polling. A non-terminal stdout gets plain line output instead
/// of the in-place section.
pub async fn follow_deployment(
    http_client: &Client,
    backend_url: &str,
    config: &Config,
    deployment_id: u64,
    timeout_str: &str,
) -> Result<Deployment> {
    let token = require_token(config)?.to_string();
    let timeout = parse_duration(timeout_str)?;

    if !is_tty() {
        return follow_simple(http_client, backend_url, &token, deployment_id, timeout).await;
    }

    print!("{}", ansi::HIDE_CURSOR);
    io::stdout().flush().unwrap();

    let result = follow_with_ui(http_client, backend_url, &token, deployment_id, timeout).await;

    // Cursor comes back whatever the outcome was
    print!("{}", ansi::SHOW_CURSOR);
    io::stdout().flush().unwrap();

    result
}

/// One wakeup of the follow loop.
enum Drive {
    Change(Result<Option<WatchEvent>, WatchError>),
    Poll,
    Tick,
    Interrupt,
}

/// Attach the live stream when the job is running, nothing is attached yet
/// and a dial is still allowed. Attach failures leave the follow on
/// polling; they are not fatal.
async fn try_attach(
    slot: &mut WatchSlot,
    http_client: &Client,
    backend_url: &str,
    token: &str,
    deployment: &Deployment,
    dials: &mut u32,
    needs_refresh: &Arc<AtomicBool>,
) {
    if deployment.status != DeploymentStatus::Running
        || slot.active().is_some()
        || *dials >= MAX_STREAM_DIALS
    {
        return;
    }
    *dials += 1;

    let refresh = Arc::clone(needs_refresh);
    let hook: CompletionHook = Box::new(move || refresh.store(true, Ordering::SeqCst));
    if let Err(err) = slot
        .open(
            http_client,
            backend_url,
            token,
            deployment.id,
            &deployment.status,
            true,
            Some(hook),
        )
        .await
    {
        info!("Live log stream unavailable: {}", err);
    }
}

async fn follow_with_ui(
    http_client: &Client,
    backend_url: &str,
    token: &str,
    deployment_id: u64,
    timeout: Duration,
) -> Result<Deployment> {
    let start_time = Instant::now();

    let mut deployment = fetch_deployment(http_client, backend_url, token, deployment_id).await?;

    let mut state = FollowState::new();
    let mut section = LiveStatusSection::new();
    let mut slot = WatchSlot::new();
    let needs_refresh = Arc::new(AtomicBool::new(false));
    let mut dials = 0u32;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if state.should_log_state_change(&deployment) {
            section.clear_previous();
            log_state_change(deployment_id, &deployment);
        }
        state.update(&deployment);

        if deployment.status.is_terminal() {
            slot.close();
            section.clear_previous();
            print_deployment_snapshot(&deployment);
            if !deployment.logs.is_empty() {
                println!();
                println!("{}", steps_table(&deployment.logs));
            }
            return Ok(deployment);
        }

        if start_time.elapsed() >= timeout {
            slot.close();
            section.clear_previous();
            bail!(
                "Timeout waiting for deployment to complete after {:?}",
                timeout
            );
        }

        try_attach(
            &mut slot,
            http_client,
            backend_url,
            token,
            &deployment,
            &mut dials,
            &needs_refresh,
        )
        .await;

        state.spinner_frame = state.spinner_frame.wrapping_add(1);
        let connected = match slot.active() {
            Some(watch) => watch.connected(),
            None => false,
        };
        let entries = slot
            .active()
            .map(|watch| watch.entries().to_vec())
            .unwrap_or_else(|| deployment.logs.clone());
        print!(
            "{}",
            section.render(&deployment, &entries, &state, connected)
        );
        io::stdout().flush().unwrap();

        let drive = match slot.active() {
            Some(watch) if watch.connected() => tokio::select! {
                changed = watch.next_change() => Drive::Change(changed),
                _ = sleep(TICK) => Drive::Tick,
                _ = &mut ctrl_c => Drive::Interrupt,
            },
            _ => tokio::select! {
                _ = sleep(POLL_INTERVAL) => Drive::Poll,
                _ = &mut ctrl_c => Drive::Interrupt,
            },
        };

        match drive {
            Drive::Interrupt => {
                slot.close();
                section.clear_previous();
                println!(
                    "Detached. Deployment {} keeps running on the server.",
                    deployment_id
                );
                println!(
                    "Re-attach with 'mdk deployment logs {} --follow'",
                    deployment_id
                );
                return Ok(deployment);
            }
            // Records land in the merged sequence and the next redraw picks
            // them up; Finished flips the refresh flag through the hook.
            Drive::Change(Ok(_)) | Drive::Tick => {}
            Drive::Change(Err(err)) => {
                info!("Log stream interrupted: {}", err);
                let mut recovered = false;
                if dials < MAX_STREAM_DIALS {
                    if let Some(watch) = slot.active() {
                        dials += 1;
                        recovered = watch
                            .reconnect(http_client, backend_url, token)
                            .await
                            .unwrap_or(false);
                    }
                }
                if !recovered {
                    info!("Falling back to status polling");
                    slot.close();
                }
            }
            Drive::Poll => {
                deployment =
                    fetch_deployment(http_client, backend_url, token, deployment_id).await?;
            }
        }

        if needs_refresh.swap(false, Ordering::SeqCst) {
            deployment = fetch_deployment(http_client, backend_url, token, deployment_id).await?;
        }
    }
}

/// Plain-output follow for pipes and dumb terminals: one line per step
/// record, status transitions through the log, no redrawing.
async fn follow_simple(
    http_client: &Client,
    backend_url: &str,
    token: &str,
    deployment_id: u64,
    timeout: Duration,
) -> Result<Deployment> {
    let start_time = Instant::now();

    let mut deployment = fetch_deployment(http_client, backend_url, token, deployment_id).await?;

    let mut state = FollowState::new();
    let mut slot = WatchSlot::new();
    let needs_refresh = Arc::new(AtomicBool::new(false));
    let mut dials = 0u32;
    // A reconnect replays history; remember what was already echoed.
    let mut printed: HashSet<(u64, StepStatus)> = HashSet::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if state.should_log_state_change(&deployment) {
            log_state_change(deployment_id, &deployment);
        }
        state.update(&deployment);

        if deployment.status.is_terminal() {
            slot.close();
            print_deployment_snapshot(&deployment);
            if !deployment.logs.is_empty() {
                println!();
                println!("{}", steps_table(&deployment.logs));
            }
            return Ok(deployment);
        }

        if start_time.elapsed() >= timeout {
            slot.close();
            bail!(
                "Timeout waiting for deployment to complete after {:?}",
                timeout
            );
        }

        try_attach(
            &mut slot,
            http_client,
            backend_url,
            token,
            &deployment,
            &mut dials,
            &needs_refresh,
        )
        .await;

        let drive = match slot.active() {
            Some(watch) if watch.connected() => tokio::select! {
                changed = watch.next_change() => Drive::Change(changed),
                _ = sleep(POLL_INTERVAL) => Drive::Tick,
                _ = &mut ctrl_c => Drive::Interrupt,
            },
            _ => tokio::select! {
                _ = sleep(POLL_INTERVAL) => Drive::Poll,
                _ = &mut ctrl_c => Drive::Interrupt,
            },
        };

        match drive {
            Drive::Interrupt => {
                slot.close();
                println!(
                    "Detached. Deployment {} keeps running on the server.",
                    deployment_id
                );
                println!(
                    "Re-attach with 'mdk deployment logs {} --follow'",
                    deployment_id
                );
                return Ok(deployment);
            }
            Drive::Change(Ok(Some(WatchEvent::Record(entry)))) => {
                if printed.insert((entry.id, entry.status.clone())) {
                    let timing = if entry.status == StepStatus::Running {
                        String::new()
                    } else {
                        format!(" ({})", format_duration_ms(entry.duration))
                    };
                    println!("  [{}] {} {}{}", entry.step, entry.action, entry.status, timing);
                    if !entry.error_msg.is_empty() {
                        println!("      {}", entry.error_msg);
                    }
                }
            }
            Drive::Change(Ok(Some(WatchEvent::Finished)))
            | Drive::Change(Ok(None))
            | Drive::Tick => {}
            Drive::Change(Err(err)) => {
                info!("Log stream interrupted: {}", err);
                let mut recovered = false;
                if dials < MAX_STREAM_DIALS {
                    if let Some(watch) = slot.active() {
                        dials += 1;
                        recovered = watch
                            .reconnect(http_client, backend_url, token)
                            .await
                            .unwrap_or(false);
                    }
                }
                if !recovered {
                    info!("Falling back to status polling");
                    slot.close();
                }
            }
            Drive::Poll => {
                deployment =
                    fetch_deployment(http_client, backend_url, token, deployment_id).await?;
            }
        }

        if needs_refresh.swap(false, Ordering::SeqCst) {
            deployment = fetch_deployment(http_client, backend_url, token, deployment_id).await?;
        }
    }
}
