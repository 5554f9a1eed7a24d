//! ERP CLI - command-line client for the ERP admin API
//!
//! Signs in, keeps the session renewed, and issues requests against any
//! resource endpoint.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use reqwest::Method;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use erp_cli::api::{ApiClient, ApiError, Payload, QueryParams, RequestBody, RequestOptions};
use erp_cli::auth::{self, jwt};
use erp_cli::config::{CredentialFile, Settings};
use erp_cli::session::{Session, SessionEvent, SessionEventKind};

#[derive(Parser)]
#[command(name = "erp-cli")]
#[command(about = "Command-line client for the ERP admin API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in and store the session credentials
    Login {
        #[arg(short, long)]
        username: String,

        #[arg(short, long, env = "ERP_PASSWORD", hide_env_values = true)]
        password: String,
    },

    /// Sign out and clear stored credentials
    Logout,

    /// Show current session status
    Status,

    /// GET a resource
    Get(ReadArgs),

    /// DELETE a resource
    Delete(ReadArgs),

    /// POST to a resource
    Post(WriteArgs),

    /// PUT a resource
    Put(WriteArgs),

    /// PATCH a resource
    Patch(WriteArgs),

    /// Print session events until the session expires
    Watch,
}

#[derive(Args)]
struct ReadArgs {
    /// Resource path, relative to the API base URL (e.g. /products)
    path: String,

    /// Query parameter, repeatable (key=value)
    #[arg(short, long = "query", value_parser = parse_pair)]
    query: Vec<(String, String)>,
}

#[derive(Args)]
struct WriteArgs {
    #[command(flatten)]
    target: ReadArgs,

    /// JSON request body
    #[arg(short, long, conflicts_with = "file")]
    data: Option<String>,

    /// Send a file as a raw binary body
    #[arg(short, long)]
    file: Option<std::path::PathBuf>,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", s))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let settings = Settings::load()?;
    let session = Session::new(
        Box::new(CredentialFile::default_location()?),
        settings.expiry_lead(),
    );
    let client = ApiClient::new(&settings, session.clone())?;

    match cli.command {
        Commands::Login { username, password } => {
            auth::sign_in(&client, &settings.login_path, &username, &password)
                .await
                .map_err(explain)?;
            println!("Login successful.");
        }
        Commands::Logout => {
            auth::sign_out(&session);
            println!("Logged out.");
        }
        Commands::Status => status(&settings, &session),
        Commands::Get(args) => request(&client, Method::GET, args, None).await?,
        Commands::Delete(args) => request(&client, Method::DELETE, args, None).await?,
        Commands::Post(args) => write(&client, Method::POST, args).await?,
        Commands::Put(args) => write(&client, Method::PUT, args).await?,
        Commands::Patch(args) => write(&client, Method::PATCH, args).await?,
        Commands::Watch => watch(&session).await?,
    }

    Ok(())
}

async fn write(client: &ApiClient, method: Method, args: WriteArgs) -> Result<()> {
    let body = match (args.data, args.file) {
        (Some(data), _) => {
            let value: serde_json::Value =
                serde_json::from_str(&data).context("--data is not valid JSON")?;
            Some(RequestBody::json(&value)?)
        }
        (None, Some(path)) => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Some(RequestBody::binary(bytes))
        }
        (None, None) => None,
    };
    request(client, method, args.target, body).await
}

async fn request(
    client: &ApiClient,
    method: Method,
    args: ReadArgs,
    body: Option<RequestBody>,
) -> Result<()> {
    let query: QueryParams = args.query.into_iter().collect();
    let options = RequestOptions::new().query(query);

    tracing::debug!("{} {}", method, args.path);
    let payload = client
        .send(method, &args.path, body, &options)
        .await
        .map_err(explain)?;

    match payload {
        Payload::Empty => eprintln!("(no content)"),
        Payload::Json(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        Payload::Text(text) => println!("{}", text),
    }
    Ok(())
}

/// Attach a next step to errors the user can act on.
fn explain(err: ApiError) -> anyhow::Error {
    let hint = if err.is_unauthorized() {
        Some("Session expired or invalid. Run 'erp-cli login'.")
    } else if err.is_network() {
        Some("Check that the API is reachable (ERP_API_URL).")
    } else {
        None
    };

    let mut message = match err.status {
        Some(status) => format!("{} (HTTP {})", err.message, status.as_u16()),
        None => err.message.clone(),
    };
    if let Some(details) = err.details.as_ref().filter(|d| d.is_object()) {
        message.push_str(&format!("\n{}", details));
    }
    if let Some(hint) = hint {
        message.push_str(&format!("\n{}", hint));
    }
    anyhow::anyhow!(message)
}

fn status(settings: &Settings, session: &Session) {
    let creds = session.tokens().snapshot();
    println!("API:         {}", settings.base_url);

    match creds.access_token.as_deref() {
        Some(token) => {
            if let Some(subject) = jwt::subject(token) {
                println!("User:        {}", subject);
            }
            match jwt::expires_at_ms(token) {
                Some(exp_ms) => {
                    let now_ms = chrono::Utc::now().timestamp_millis().max(0) as u64;
                    let when = chrono::DateTime::from_timestamp_millis(exp_ms as i64)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| exp_ms.to_string());
                    if exp_ms > now_ms {
                        println!(
                            "Access tok:  valid ({}s left)",
                            (exp_ms - now_ms) / 1000
                        );
                    } else {
                        println!("Access tok:  expired");
                    }
                    println!("  expires_at: {}", when);
                }
                None => println!("Access tok:  present (no expiry claim)"),
            }
        }
        None => println!("Access tok:  none"),
    }

    match creds.refresh_token {
        Some(_) => println!("Refresh tok: present"),
        None => println!("Refresh tok: none"),
    }

    if creds.is_empty() {
        println!("\nRun 'erp-cli login' to authenticate.");
    }
}

async fn watch(session: &Session) -> Result<()> {
    if session.tokens().access_token().is_none() {
        anyhow::bail!("Not logged in. Run 'erp-cli login' first.");
    }

    let events = session.events();
    let (soon_sub, mut soon) = events.subscribe_channel(SessionEventKind::ExpiringSoon);
    let (expired_sub, mut expired) = events.subscribe_channel(SessionEventKind::Expired);
    let (refreshed_sub, mut refreshed) = events.subscribe_channel(SessionEventKind::Refreshed);

    session.resume();
    println!("Watching session events... (Ctrl-C to stop)");

    loop {
        tokio::select! {
            Some(SessionEvent::ExpiringSoon { remaining_ms }) = soon.recv() => {
                println!("Session expires in {}s", remaining_ms / 1000);
            }
            Some(_) = refreshed.recv() => {
                println!("Session refreshed");
            }
            Some(_) = expired.recv() => {
                println!("Session expired. Run 'erp-cli login'.");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Shutting down...");
                break;
            }
        }
    }

    for sub in [soon_sub, expired_sub, refreshed_sub] {
        sub.unsubscribe();
    }
    Ok(())
}
