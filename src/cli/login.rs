//! Session commands: login, logout, whoami.

use anyhow::{bail, Result};
use reqwest::Client;

use crate::api;
use crate::api::error::ApiError;
use crate::config::Config;

/// Prompt for one line on stdin. The prompt only shows on a terminal, so
/// piped input works without noise.
fn prompt_line(prompt: &str) -> Result<String> {
    use std::io::{BufRead, IsTerminal, Write};

    if std::io::stdin().is_terminal() {
        eprint!("{}", prompt);
        std::io::stderr().flush()?;
    }

    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    let line = line.trim().to_string();

    if line.is_empty() {
        bail!("Input was empty");
    }

    Ok(line)
}

pub async fn login(
    client: &Client,
    base_url: &str,
    config: &mut Config,
    username: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let username = match username {
        Some(name) => name,
        None => prompt_line("Username: ")?,
    };
    let password = match password.or_else(|| std::env::var("MDK_PASSWORD").ok()) {
        Some(password) => password,
        None => prompt_line("Password: ")?,
    };

    let data = match api::auth::login(client, base_url, &username, &password).await {
        Ok(data) => data,
        Err(ApiError::Unauthorized) => bail!("Login failed: invalid username or password"),
        Err(err) => return Err(err.into()),
    };

    config.set_session(data.token, data.user.username.clone())?;

    println!("Logged in as {} ({})", data.user.username, base_url);
    Ok(())
}

pub async fn logout(client: &Client, base_url: &str, config: &mut Config) -> Result<()> {
    let Some(token) = config.get_token().map(str::to_string) else {
        println!("Not logged in.");
        return Ok(());
    };

    // Best-effort server-side invalidation; the local session clears
    // regardless.
    match api::auth::logout(client, base_url, &token).await {
        Ok(_) | Err(ApiError::Unauthorized) => {}
        Err(err) => eprintln!("Warning: could not invalidate the session server-side: {}", err),
    }

    let username = config.username.clone();
    config.clear_session()?;

    match username {
        Some(name) => println!("Logged out {}.", name),
        None => println!("Logged out."),
    }
    Ok(())
}

pub async fn whoami(client: &Client, base_url: &str, config: &Config) -> Result<()> {
    let token = config.get_token().unwrap_or_default();

    let user = match api::auth::profile(client, base_url, token).await {
        Ok(user) => user,
        Err(ApiError::NotAuthenticated) => bail!("Not logged in. Run 'mdk login' first"),
        Err(ApiError::Unauthorized) => {
            bail!("Session expired. Please run 'mdk login' again")
        }
        Err(err) => return Err(err.into()),
    };

    println!("{} (id {})", user.username, user.id);
    println!("Backend: {}", base_url);
    Ok(())
}
