use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::Password;

use exam_session::auth::CredentialBundle;
use exam_session::config::{self, CliArgs, Command};
use exam_session::{ApiError, ApiResponse, AppState, RequestOptions};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let mut args = CliArgs::parse();

    // Check if interactive setup is needed (no .env and no backend URL)
    if args.api_url.is_none() && config::needs_interactive_setup() {
        config::run_interactive_setup()?.apply(&mut args);
    }

    // Load configuration first (for log level)
    let config = config::Config::from_args(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!(
        primary = %config.primary_api_url,
        secondary = %config.secondary_api_url,
        "Configuration loaded"
    );

    let state = AppState::from_config(&config)?;

    match args.command {
        Command::Login { identifier } => {
            let password: String = Password::new()
                .with_prompt("Password")
                .interact()
                .context("Failed to read password")?;
            let bundle = state.session.login(&identifier, &password).await?;
            println!("Logged in as {} ({})", bundle.username, bundle.role);
        }
        Command::GoogleLogin { id_token } => {
            let bundle = state.session.login_with_google(&id_token).await?;
            println!("Logged in as {} ({})", bundle.username, bundle.role);
        }
        Command::Logout => {
            state.session.logout().await;
            println!("Logged out");
        }
        Command::Whoami => match state.session.restore().await {
            Some(bundle) => {
                for line in identity_lines(&bundle) {
                    println!("{}", line);
                }
            }
            None => println!("Not logged in"),
        },
        Command::Get {
            path,
            secondary,
            query,
        } => {
            let options = query
                .into_iter()
                .fold(RequestOptions::new(), |options, (k, v)| options.query(k, v));
            let result = state.client(secondary).get(&path, options).await;
            print_response(&state, result).await?;
        }
        Command::Post {
            path,
            body,
            secondary,
        } => {
            let body: serde_json::Value =
                serde_json::from_str(&body).context("Request body must be valid JSON")?;
            let result = state
                .client(secondary)
                .post(&path, body, RequestOptions::new())
                .await;
            print_response(&state, result).await?;
        }
    }

    Ok(())
}

/// Print a response; an unrecoverable 401 ends the session
async fn print_response(state: &AppState, result: Result<ApiResponse, ApiError>) -> Result<()> {
    match result {
        Ok(response) => {
            if !response.ok {
                tracing::warn!("Request returned status {}", response.status);
            }
            println!("{}", response.status);
            println!("{}", serde_json::to_string_pretty(&response.data)?);
            Ok(())
        }
        Err(e) if e.requires_logout() => {
            tracing::error!("Session could not be refreshed: {}", e);
            state.session.logout().await;
            anyhow::bail!("Session expired, please log in again")
        }
        Err(e) => Err(e.into()),
    }
}

/// Who is logged in and until when; tokens are never printed
fn identity_lines(bundle: &CredentialBundle) -> Vec<String> {
    let expires = bundle
        .expires_at()
        .and_then(chrono::DateTime::from_timestamp_millis)
        .map(|at| at.to_rfc3339())
        .unwrap_or_else(|| "-".to_string());

    vec![
        format!("User:     {} ({})", bundle.username, bundle.user_id),
        format!("Email:    {}", bundle.email),
        format!("Role:     {}", bundle.role),
        format!("Expires:  {}", expires),
    ]
}
