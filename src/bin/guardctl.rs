use std::time::{SystemTime, UNIX_EPOCH};

use clap::{Parser, Subcommand};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::Method;
use serde_json::{json, Value};

use toolguard::auth::token::request_signature;

#[derive(Parser)]
#[command(name = "guardctl")]
#[command(about = "Management CLI for the toolguard service", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:8081")]
    url: String,

    /// API key, sent as `ApiKey <key>`.
    #[arg(short, long, env = "TOOLGUARD_API_KEY", conflicts_with = "token")]
    key: Option<String>,

    /// Signed bearer token.
    #[arg(short, long, env = "TOOLGUARD_TOKEN")]
    token: Option<String>,

    /// Client id for HMAC request signing (requires --secret).
    #[arg(long, requires = "secret", conflicts_with_all = ["key", "token"])]
    hmac_client: Option<String>,

    /// Shared secret for HMAC request signing.
    #[arg(long, env = "TOOLGUARD_AUTH_SECRET", hide_env_values = true)]
    secret: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check service status
    Status,
    /// Show circuit breaker states
    Circuits,
    /// Force a circuit closed
    Reset { op_type: String },
    /// Show in-flight and recent governed operations
    Operations {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
    /// Show channel connections and blocked clients
    Connections,
    /// Issue an API key
    AddKey {
        client_id: String,
        #[arg(short, long, default_value = "internal")]
        level: String,
        #[arg(long)]
        ttl_secs: Option<u64>,
        /// Restrict the key to these operations
        #[arg(long = "operation")]
        operations: Vec<String>,
    },
    /// Revoke an API key
    RevokeKey { key: String },
    /// Show recent security events
    Audit {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },
}

impl Commands {
    /// Method, path and operation name the request performs.
    fn route(&self) -> (Method, String, &'static str) {
        match self {
            Self::Status => (Method::GET, "/admin/status".into(), "status"),
            Self::Circuits => (Method::GET, "/admin/circuits".into(), "view_circuits"),
            Self::Reset { op_type } => (
                Method::POST,
                format!("/admin/circuits/{op_type}/reset"),
                "reset_circuit",
            ),
            Self::Operations { limit } => (
                Method::GET,
                format!("/admin/operations?limit={limit}"),
                "view_operations",
            ),
            Self::Connections => (Method::GET, "/admin/connections".into(), "view_connections"),
            Self::AddKey { .. } => (Method::POST, "/admin/keys".into(), "manage_api_keys"),
            Self::RevokeKey { .. } => (Method::DELETE, "/admin/keys".into(), "manage_api_keys"),
            Self::Audit { limit } => (
                Method::GET,
                format!("/admin/audit?limit={limit}"),
                "view_audit",
            ),
        }
    }

    fn body(&self) -> Option<Value> {
        match self {
            Self::AddKey {
                client_id,
                level,
                ttl_secs,
                operations,
            } => Some(json!({
                "client_id": client_id,
                "access_level": level,
                "ttl_secs": ttl_secs,
                "operations": (!operations.is_empty()).then_some(operations),
            })),
            Self::RevokeKey { key } => Some(json!({ "key": key })),
            _ => None,
        }
    }
}

fn authorization(cli: &Cli, operation: &str) -> Result<Option<String>, Box<dyn std::error::Error>> {
    if let Some(key) = &cli.key {
        return Ok(Some(format!("ApiKey {key}")));
    }
    if let Some(token) = &cli.token {
        return Ok(Some(format!("Bearer {token}")));
    }
    if let (Some(client), Some(secret)) = (&cli.hmac_client, &cli.secret) {
        let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs() as i64;
        let signature = request_signature(secret.as_bytes(), client, operation, timestamp);
        return Ok(Some(format!("HMAC-SHA256 {client}:{timestamp}:{signature}")));
    }
    Ok(None)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let (method, path, operation) = cli.command.route();
    let mut headers = HeaderMap::new();
    if let Some(value) = authorization(&cli, operation)? {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&value)?);
    }

    let mut request = client
        .request(method, format!("{}{}", cli.url.trim_end_matches('/'), path))
        .headers(headers);
    if let Some(body) = cli.command.body() {
        request = request.json(&body);
    }

    let res = request.send().await?;
    print_response(res).await
}

async fn print_response(res: reqwest::Response) -> Result<(), Box<dyn std::error::Error>> {
    let status = res.status();
    if !status.is_success() {
        eprintln!("Error: management API returned status {}", status);
        if let Ok(text) = res.text().await {
            eprintln!("Response: {}", text);
        }
        std::process::exit(1);
    }

    let json: Value = res.json().await?;
    println!("{}", serde_json::to_string_pretty(&json)?);
    Ok(())
}
