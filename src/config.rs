use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dialoguer::{Confirm, Input};
use reqwest::Url;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

/// Exam Session - authenticated client for the exam backend
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Primary backend URL (also serves authentication)
    #[arg(short = 'u', long, env = "BASE_API_URL")]
    pub api_url: Option<String>,

    /// Secondary backend URL (defaults to the primary one)
    #[arg(long, env = "BASE_API_URL_2")]
    pub api_url_2: Option<String>,

    /// Path to the session database
    #[arg(short = 'd', long, env = "SESSION_DB_FILE")]
    pub db_file: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    pub log_level: String,

    /// Primary backend request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT", default_value = "5")]
    pub http_timeout: u64,

    /// Secondary backend request timeout in seconds
    #[arg(long, env = "HTTP_REQUEST_TIMEOUT_2", default_value = "90")]
    pub http_timeout_2: u64,

    /// Token refresh timeout in seconds
    #[arg(long, env = "TOKEN_REFRESH_TIMEOUT", default_value = "10")]
    pub refresh_timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Log in with email or username; the password is prompted
    Login {
        identifier: String,
    },
    /// Log in with a Google ID token
    GoogleLogin {
        id_token: String,
    },
    /// Drop the stored session
    Logout,
    /// Show the stored session
    Whoami,
    /// GET a path and print the response
    Get {
        path: String,
        /// Send to the secondary backend
        #[arg(long)]
        secondary: bool,
        /// Query parameters as key=value
        #[arg(short, long = "query", value_parser = parse_key_value)]
        query: Vec<(String, String)>,
    },
    /// POST a JSON body to a path and print the response
    Post {
        path: String,
        body: String,
        #[arg(long)]
        secondary: bool,
    },
}

#[derive(Clone, Debug)]
pub struct Config {
    // Backends
    pub primary_api_url: Url,
    pub secondary_api_url: Url,

    // Timeouts
    pub primary_timeout: Duration,
    pub secondary_timeout: Duration,
    pub refresh_timeout: Duration,

    // HTTP client
    pub http_max_connections: usize,
    pub http_connect_timeout: Duration,

    // Session persistence
    pub session_db_file: PathBuf,

    // Logging
    pub log_level: String,
}

impl Config {
    /// Build configuration from parsed arguments (CLI > ENV > defaults)
    pub fn from_args(args: &CliArgs) -> Result<Self> {
        let primary = args
            .api_url
            .clone()
            .context("BASE_API_URL is required (use -u or set BASE_API_URL env var)")?;
        let primary_api_url = parse_base_url(&primary)?;

        let secondary_api_url = match args.api_url_2.as_deref() {
            Some(url) if !url.trim().is_empty() => parse_base_url(url)?,
            _ => primary_api_url.clone(),
        };

        let session_db_file = match args.db_file.as_deref() {
            Some(path) => expand_tilde(path),
            None => default_session_db()?,
        };

        Ok(Config {
            primary_api_url,
            secondary_api_url,

            primary_timeout: Duration::from_secs(args.http_timeout),
            secondary_timeout: Duration::from_secs(args.http_timeout_2),
            refresh_timeout: Duration::from_secs(args.refresh_timeout),

            http_max_connections: std::env::var("HTTP_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(20),

            http_connect_timeout: Duration::from_secs(
                std::env::var("HTTP_CONNECT_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(5),
            ),

            session_db_file,
            log_level: args.log_level.clone(),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for url in [&self.primary_api_url, &self.secondary_api_url] {
            if !matches!(url.scheme(), "http" | "https") {
                anyhow::bail!("Backend URL must be http or https: {}", url);
            }
        }

        if self.primary_timeout.is_zero()
            || self.secondary_timeout.is_zero()
            || self.refresh_timeout.is_zero()
        {
            anyhow::bail!("Timeouts must be greater than zero");
        }

        if self.session_db_file.is_dir() {
            anyhow::bail!(
                "SESSION_DB_FILE points to a directory: {}",
                self.session_db_file.display()
            );
        }

        Ok(())
    }
}

fn parse_base_url(raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).with_context(|| format!("Invalid backend URL: {}", raw))
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

/// Default session database under the platform data directory
fn default_session_db() -> Result<PathBuf> {
    let data_dir = dirs::data_dir().context("Could not determine the data directory")?;
    Ok(data_dir.join("exam-session").join("session.sqlite3"))
}

/// Expand tilde (~) in file paths to user's home directory
fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

// === Interactive Setup ===

/// Check if interactive setup is needed (no .env file and no backend URL)
pub fn needs_interactive_setup() -> bool {
    let env_file_exists = std::path::Path::new(".env").exists();
    let has_api_url = std::env::var("BASE_API_URL").is_ok();

    !env_file_exists && !has_api_url
}

/// Ask for the backend URLs and optionally save them to .env
pub fn run_interactive_setup() -> Result<InteractiveConfig> {
    println!();
    println!("No configuration found. Let's point the client at your backend.");
    println!();

    let api_url: String = Input::new()
        .with_prompt("Backend URL (BASE_API_URL)")
        .validate_with(|input: &String| -> std::result::Result<(), String> {
            parse_base_url(input).map(|_| ()).map_err(|e| e.to_string())
        })
        .interact_text()
        .context("Failed to read BASE_API_URL")?;

    let api_url_2: String = Input::new()
        .with_prompt("Secondary backend URL (BASE_API_URL_2, empty for same)")
        .allow_empty(true)
        .interact_text()
        .context("Failed to read BASE_API_URL_2")?;

    let config = InteractiveConfig {
        api_url: api_url.trim().to_string(),
        api_url_2: Some(api_url_2.trim().to_string()).filter(|s| !s.is_empty()),
    };

    let save_to_env = Confirm::new()
        .with_prompt("Save configuration to .env file?")
        .default(true)
        .interact()
        .context("Failed to read save confirmation")?;

    if save_to_env {
        save_env_file(&config)?;
        println!("Configuration saved to .env file");
    }

    Ok(config)
}

/// Configuration collected from interactive setup
#[derive(Debug, Clone)]
pub struct InteractiveConfig {
    pub api_url: String,
    pub api_url_2: Option<String>,
}

impl InteractiveConfig {
    /// Fill the collected values into arguments that did not set them
    pub fn apply(self, args: &mut CliArgs) {
        args.api_url.get_or_insert(self.api_url);
        if args.api_url_2.is_none() {
            args.api_url_2 = self.api_url_2;
        }
    }
}

fn env_file_content(config: &InteractiveConfig) -> String {
    format!(
        r#"# Exam Session Configuration
# Generated by interactive setup

# Primary backend, also used for login and token refresh (required)
BASE_API_URL={}

# Secondary backend (defaults to BASE_API_URL)
BASE_API_URL_2={}

# Logging (trace, debug, info, warn, error)
LOG_LEVEL=warn
"#,
        config.api_url,
        config.api_url_2.as_deref().unwrap_or(""),
    )
}

/// Save configuration to .env file
fn save_env_file(config: &InteractiveConfig) -> Result<()> {
    let mut file = std::fs::File::create(".env").context("Failed to create .env file")?;
    file.write_all(env_file_content(config).as_bytes())
        .context("Failed to write .env file")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["exam-session"];
        argv.extend_from_slice(extra);
        argv.push("whoami");
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_expand_tilde() {
        let path = expand_tilde("~/test/file.txt");
        assert!(path.to_string_lossy().contains("test/file.txt"));
        assert!(!path.to_string_lossy().starts_with("~"));

        let path = expand_tilde("/absolute/path");
        assert_eq!(path, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_expand_tilde_just_tilde() {
        // Just "~" without slash should not expand
        let path = expand_tilde("~");
        assert_eq!(path, PathBuf::from("~"));
    }

    #[test]
    fn test_secondary_defaults_to_primary() {
        let config = Config::from_args(&args(&[
            "-u",
            "https://api.example.com",
            "--api-url-2",
            "",
            "-d",
            "/tmp/session.sqlite3",
        ]))
        .unwrap();

        assert_eq!(config.primary_api_url.as_str(), "https://api.example.com/");
        assert_eq!(config.secondary_api_url, config.primary_api_url);
        assert_eq!(config.session_db_file, PathBuf::from("/tmp/session.sqlite3"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_timeouts_from_args() {
        let config = Config::from_args(&args(&[
            "-u",
            "https://a.example.com",
            "--api-url-2",
            "https://b.example.com",
            "-d",
            "/tmp/s.sqlite3",
            "--http-timeout",
            "7",
            "--refresh-timeout",
            "3",
        ]))
        .unwrap();

        assert_eq!(config.primary_timeout, Duration::from_secs(7));
        assert_eq!(config.secondary_timeout, Duration::from_secs(90));
        assert_eq!(config.refresh_timeout, Duration::from_secs(3));
        assert_eq!(config.secondary_api_url.host_str(), Some("b.example.com"));
    }

    #[test]
    fn test_invalid_url_is_rejected() {
        let result = Config::from_args(&args(&["-u", "not a url", "-d", "/tmp/s.sqlite3"]));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate_rejects_non_http_scheme_and_zero_timeout() {
        let mut config = Config::from_args(&args(&[
            "-u",
            "ftp://files.example.com",
            "--api-url-2",
            "https://b.example.com",
            "-d",
            "/tmp/s.sqlite3",
        ]))
        .unwrap();
        assert!(config.validate().is_err());

        config.primary_api_url = Url::parse("https://a.example.com").unwrap();
        config.secondary_api_url = config.primary_api_url.clone();
        config.refresh_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("page=2"),
            Ok(("page".to_string(), "2".to_string()))
        );
        assert_eq!(
            parse_key_value("q=a=b"),
            Ok(("q".to_string(), "a=b".to_string()))
        );
        assert!(parse_key_value("novalue").is_err());
    }

    #[test]
    fn test_get_subcommand_parses_query() {
        let args = CliArgs::try_parse_from([
            "exam-session",
            "-u",
            "https://a.example.com",
            "get",
            "/api/exams",
            "--secondary",
            "-q",
            "page=1",
        ])
        .unwrap();

        assert_eq!(
            args.command,
            Command::Get {
                path: "/api/exams".to_string(),
                secondary: true,
                query: vec![("page".to_string(), "1".to_string())],
            }
        );
    }

    #[test]
    fn test_interactive_config_fills_missing_args() {
        let mut parsed = CliArgs::try_parse_from(["exam-session", "logout"]).unwrap();
        parsed.api_url = None;
        parsed.api_url_2 = None;

        InteractiveConfig {
            api_url: "https://a.example.com".to_string(),
            api_url_2: None,
        }
        .apply(&mut parsed);

        assert_eq!(parsed.api_url.as_deref(), Some("https://a.example.com"));
        assert_eq!(parsed.api_url_2, None);
    }

    #[test]
    fn test_env_file_content() {
        let content = env_file_content(&InteractiveConfig {
            api_url: "https://a.example.com".to_string(),
            api_url_2: Some("https://b.example.com".to_string()),
        });
        assert!(content.contains("BASE_API_URL=https://a.example.com\n"));
        assert!(content.contains("BASE_API_URL_2=https://b.example.com\n"));
    }
}
