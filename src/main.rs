use anyhow::{Context, Result, bail};
use clap::Parser;
use linctl::config::{API_URL_ENV, Config};
use linctl::http::Operation;
use linctl::runtime::{RealRuntime, Runtime};
use serde_json::{Map, Value};
use std::path::Path;

const VIEWER_QUERY: &str = "query Viewer { viewer { id name email } }";

/// linctl - Linear GraphQL client
///
/// Sends GraphQL operations to the Linear API with automatic retries,
/// rate-limit handling and credential refresh.
///
/// Authentication uses LINEAR_API_KEY when set, otherwise the OAuth
/// credentials stored in the linctl config directory.
///
/// Examples:
///   linctl whoami
///   linctl query 'query { teams { nodes { key name } } }'
///   linctl query @issue.graphql --vars '{"id": "ENG-123"}'
#[derive(Parser, Debug)]
#[command(author, version = env!("LINCTL_VERSION"), about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// GraphQL endpoint (defaults to https://api.linear.app/graphql)
    #[arg(long = "api-url", env = API_URL_ENV, value_name = "URL", global = true)]
    pub api_url: Option<String>,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run a GraphQL query or mutation and print its data
    Query(QueryArgs),

    /// Show the authenticated user
    Whoami,
}

#[derive(clap::Args, Debug)]
pub struct QueryArgs {
    /// Query text, or @FILE to read it from a file
    #[arg(value_name = "QUERY")]
    pub query: String,

    /// Variables as a JSON object
    #[arg(long = "vars", value_name = "JSON")]
    pub vars: Option<String>,
}

fn load_query<R: Runtime>(runtime: &R, arg: &str) -> Result<String> {
    match arg.strip_prefix('@') {
        Some(path) => runtime
            .read_to_string(Path::new(path))
            .with_context(|| format!("Failed to read query from {}", path)),
        None => Ok(arg.to_string()),
    }
}

fn parse_variables(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str::<Value>(raw).context("Variables must be valid JSON")? {
        Value::Object(map) => Ok(map),
        other => bail!("Variables must be a JSON object, got {}", other),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();
    let runtime = RealRuntime;

    match cli.command {
        Commands::Query(args) => {
            let query = load_query(&runtime, &args.query)?;
            let mut operation = Operation::new(query)?;
            if let Some(raw) = &args.vars {
                operation = operation.with_variables(parse_variables(raw)?);
            }

            let config = Config::new(runtime, cli.api_url)?;
            let data = config.client.execute_raw(&operation).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Commands::Whoami => {
            let config = Config::new(runtime, cli.api_url)?;
            let data = config
                .client
                .execute_raw(&Operation::new(VIEWER_QUERY)?)
                .await
                .context("Failed to fetch the authenticated user")?;
            let viewer = &data["viewer"];
            println!(
                "{} <{}> ({})",
                viewer["name"].as_str().unwrap_or("unknown"),
                viewer["email"].as_str().unwrap_or("no email"),
                viewer["id"].as_str().unwrap_or("?")
            );
        }
    }
    Ok(())
}
