use anyhow::Result;
use clap::{Parser, Subcommand};
use reqwest::Client;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod cli;
mod config;
mod observe;

use cli::*;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authenticate with the backend
    Login {
        /// Backend URL to log in against (persisted for later commands)
        #[arg(long)]
        url: Option<String>,
        /// Username to log in as (prompted when omitted)
        #[arg(long, short)]
        username: Option<String>,
        /// Password (falls back to MDK_PASSWORD, then an interactive prompt)
        #[arg(long)]
        password: Option<String>,
    },
    /// Drop the stored session
    Logout,
    /// Show the logged-in user
    Whoami,
    /// Deployment management commands
    #[command(subcommand)]
    #[command(visible_alias = "d")]
    Deployment(DeploymentCommands),
}

#[derive(Subcommand, Debug)]
enum DeploymentCommands {
    /// List deployments
    #[command(visible_alias = "ls")]
    #[command(visible_alias = "l")]
    List {
        /// Filter by status (pending, running, success, failed, cancelled)
        #[arg(long)]
        status: Option<String>,
        /// Filter by type (nginx_config, package, certificate)
        #[arg(long = "type")]
        kind: Option<String>,
        /// Page to fetch
        #[arg(long, default_value = "1")]
        page: u32,
        /// Rows per page
        #[arg(long, default_value = "20")]
        page_size: u32,
    },
    /// Show deployment details
    #[command(visible_alias = "s")]
    Show {
        /// Deployment ID
        id: u64,
    },
    /// Create a new deployment
    #[command(visible_alias = "c")]
    #[command(visible_alias = "new")]
    Create {
        /// Deployment name
        name: String,
        /// Deployment type (nginx_config, package, certificate)
        #[arg(long = "type")]
        kind: String,
        /// Target server ID
        #[arg(long)]
        server_id: u64,
        /// Free-form description
        #[arg(long)]
        description: Option<String>,
        /// Nginx config to roll out (type nginx_config)
        #[arg(long)]
        nginx_config_id: Option<u64>,
        /// Package to roll out (type package)
        #[arg(long)]
        package_id: Option<u64>,
        /// Certificate to roll out (type certificate)
        #[arg(long)]
        certificate_id: Option<u64>,
        /// Path on the target server
        #[arg(long)]
        target_path: Option<String>,
        /// Skip the pre-deployment backup
        #[arg(long)]
        no_backup: bool,
        /// Restart a service after the rollout
        #[arg(long)]
        restart_service: bool,
        /// Service to restart (e.g. nginx)
        #[arg(long)]
        service_name: Option<String>,
        /// Extra executor parameter as KEY=value (repeatable)
        #[arg(long = "param", value_parser = parse_key_val::<String, String>)]
        params: Vec<(String, String)>,
    },
    /// Delete a deployment record
    #[command(visible_alias = "del")]
    #[command(visible_alias = "rm")]
    Delete {
        /// Deployment ID
        id: u64,
        /// Skip the confirmation prompt
        #[arg(long, short)]
        yes: bool,
    },
    /// Start executing a deployment and follow it to completion
    #[command(visible_alias = "run")]
    Execute {
        /// Deployment ID
        id: u64,
        /// Start the job without following its execution
        #[arg(long)]
        no_follow: bool,
        /// Timeout when following (e.g. 90s, 10m)
        #[arg(long, default_value = "10m")]
        timeout: String,
    },
    /// Ask a running deployment to stop after its current step
    Cancel {
        /// Deployment ID
        id: u64,
        /// Wait until the job actually reaches its terminal status
        #[arg(long, short)]
        follow: bool,
        /// Timeout when following (e.g. 90s, 10m)
        #[arg(long, default_value = "10m")]
        timeout: String,
    },
    /// Roll a finished deployment back to its backup
    Rollback {
        /// Deployment ID to roll back
        id: u64,
        /// Start the rollback job without following it
        #[arg(long)]
        no_follow: bool,
        /// Timeout when following (e.g. 90s, 10m)
        #[arg(long, default_value = "10m")]
        timeout: String,
    },
    /// Show a deployment's step log
    Logs {
        /// Deployment ID
        id: u64,
        /// Follow the log live until the job completes
        #[arg(long, short)]
        follow: bool,
        /// Timeout when following (e.g. 90s, 10m)
        #[arg(long, default_value = "10m")]
        timeout: String,
    },
}

/// Parse a single key-value pair
fn parse_key_val<T, U>(
    s: &str,
) -> Result<(T, U), Box<dyn std::error::Error + Send + Sync + 'static>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    U: std::str::FromStr,
    U::Err: std::error::Error + Send + Sync + 'static,
{
    let pos = s
        .find('=')
        .ok_or_else(|| format!("invalid KEY=value: no `=` found in `{s}`"))?;
    Ok((s[..pos].parse()?, s[pos + 1..].parse()?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let http_client = Client::new();
    let mut config = config::Config::load()?;
    let backend_url = config.get_backend_url();

    match &cli.command {
        Commands::Login {
            url,
            username,
            password,
        } => {
            if let Some(url) = url {
                config.backend_url = Some(url.clone());
            }
            let backend_url = config.get_backend_url();
            login::login(
                &http_client,
                &backend_url,
                &mut config,
                username.clone(),
                password.clone(),
            )
            .await?;
        }
        Commands::Logout => {
            login::logout(&http_client, &backend_url, &mut config).await?;
        }
        Commands::Whoami => {
            login::whoami(&http_client, &backend_url, &config).await?;
        }
        Commands::Deployment(deployment_cmd) => match deployment_cmd {
            DeploymentCommands::List {
                status,
                kind,
                page,
                page_size,
            } => {
                deployment::list_deployments(
                    &http_client,
                    &backend_url,
                    &config,
                    status.clone(),
                    kind.clone(),
                    *page,
                    *page_size,
                )
                .await?;
            }
            DeploymentCommands::Show { id } => {
                deployment::show_deployment(&http_client, &backend_url, &config, *id).await?;
            }
            DeploymentCommands::Create {
                name,
                kind,
                server_id,
                description,
                nginx_config_id,
                package_id,
                certificate_id,
                target_path,
                no_backup,
                restart_service,
                service_name,
                params,
            } => {
                deployment::create_deployment(
                    &http_client,
                    &backend_url,
                    &config,
                    deployment::CreateOptions {
                        name: name.clone(),
                        kind: kind.clone(),
                        server_id: *server_id,
                        description: description.clone(),
                        nginx_config_id: *nginx_config_id,
                        package_id: *package_id,
                        certificate_id: *certificate_id,
                        target_path: target_path.clone(),
                        no_backup: *no_backup,
                        restart_service: *restart_service,
                        service_name: service_name.clone(),
                        params: params.clone(),
                    },
                )
                .await?;
            }
            DeploymentCommands::Delete { id, yes } => {
                deployment::delete_deployment(&http_client, &backend_url, &config, *id, *yes)
                    .await?;
            }
            DeploymentCommands::Execute {
                id,
                no_follow,
                timeout,
            } => {
                deployment::execute_deployment(
                    &http_client,
                    &backend_url,
                    &config,
                    *id,
                    !*no_follow,
                    timeout,
                )
                .await?;
            }
            DeploymentCommands::Cancel {
                id,
                follow,
                timeout,
            } => {
                deployment::cancel_deployment(
                    &http_client,
                    &backend_url,
                    &config,
                    *id,
                    *follow,
                    timeout,
                )
                .await?;
            }
            DeploymentCommands::Rollback {
                id,
                no_follow,
                timeout,
            } => {
                deployment::rollback_deployment(
                    &http_client,
                    &backend_url,
                    &config,
                    *id,
                    !*no_follow,
                    timeout,
                )
                .await?;
            }
            DeploymentCommands::Logs {
                id,
                follow,
                timeout,
            } => {
                deployment::show_logs(&http_client, &backend_url, &config, *id, *follow, timeout)
                    .await?;
            }
        },
    }

    Ok(())
}
