use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mcporter::config::{load_servers, RuntimeSettings, SettingsFile, SettingsOverrides};
use mcporter::mcp::{resolve_lifecycle, RmcpConnector, Runtime, ServerDefinition, StdinTokenFlow};
use mcporter::output;

#[derive(Parser)]
#[command(name = "mcporter")]
#[command(about = "List and call tools on MCP servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Server config file (default: search for config/mcporter.json or .mcp.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Add an ad-hoc HTTP server by URL
    #[arg(long, global = true)]
    http_url: Option<String>,

    /// Name for the ad-hoc server (default: the URL host)
    #[arg(long, global = true, requires = "http_url")]
    name: Option<String>,

    /// Per-server discovery timeout in milliseconds
    #[arg(long, global = true, env = "MCPORTER_LIST_TIMEOUT")]
    list_timeout_ms: Option<u64>,

    /// Servers to keep alive (comma-separated, `*` for all)
    #[arg(long, global = true, env = "MCPORTER_KEEPALIVE")]
    keep_alive: Option<String>,

    /// Servers never kept alive (comma-separated, `*` for all)
    #[arg(long, global = true, env = "MCPORTER_DISABLE_KEEPALIVE")]
    disable_keep_alive: Option<String>,

    /// Allow interactive authorization during discovery
    #[arg(
        long,
        global = true,
        env = "MCPORTER_AUTO_AUTHORIZE",
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    auto_authorize: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers and their tools
    List {
        /// Only list tools from a specific server
        server: Option<String>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
        /// Include input schemas when listing a single server
        #[arg(long)]
        schema: bool,
    },
    /// Call a tool directly
    Call {
        /// Server name
        server: String,
        /// Tool name
        tool: String,
        /// Arguments as JSON
        #[arg(long, short)]
        args: Option<String>,
    },
    /// Authorize against a server that requires OAuth
    Auth {
        /// Server name
        server: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so JSON on stdout stays parseable
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let settings = RuntimeSettings::resolve(
        SettingsFile::load()?,
        SettingsOverrides {
            list_timeout_ms: cli.list_timeout_ms,
            keep_alive: cli.keep_alive.clone(),
            disable_keep_alive: cli.disable_keep_alive.clone(),
            auto_authorize: cli.auto_authorize,
        },
    );

    let mut servers = load_servers(cli.config.as_deref(), &settings.lifecycle_overrides)?;
    let adhoc = match &cli.http_url {
        Some(url) => {
            let server = adhoc_server(url, cli.name.as_deref(), &settings)?;
            let name = server.name.clone();
            servers.retain(|s| s.name != name);
            servers.push(server);
            Some(name)
        }
        None => None,
    };

    let runtime = Runtime::with_oauth_flow(
        servers,
        Arc::new(RmcpConnector::new()),
        Arc::new(StdinTokenFlow),
        settings,
    );

    let finished = run_or_interrupt(run(&runtime, cli.command, adhoc), ctrl_c()).await;

    runtime.close().await;
    match finished {
        Finished::Completed(result) => result,
        Finished::Interrupted => {
            eprintln!("Interrupted");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    }
}

/// Exit status after Ctrl-C (128 + SIGINT)
const INTERRUPTED_EXIT_CODE: i32 = 130;

/// How a command ended
#[derive(Debug)]
enum Finished {
    Completed(Result<()>),
    Interrupted,
}

/// Run `work` unless `interrupt` resolves first
async fn run_or_interrupt<W, I>(work: W, interrupt: I) -> Finished
where
    W: Future<Output = Result<()>>,
    I: Future<Output = ()>,
{
    tokio::select! {
        result = work => Finished::Completed(result),
        _ = interrupt => {
            tracing::info!("Interrupted");
            Finished::Interrupted
        }
    }
}

/// Resolves on Ctrl-C; never resolves if the handler can't be installed
async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run(runtime: &Runtime, command: Commands, adhoc: Option<String>) -> Result<()> {
    match command {
        Commands::List { server, json, schema } => match server.or(adhoc) {
            Some(server) => run_list_server(runtime, &server, json, schema).await,
            None => run_list_all(runtime, json).await,
        },
        Commands::Call { server, tool, args } => run_call_tool(runtime, &server, &tool, args).await,
        Commands::Auth { server } => {
            runtime.authorize(&server).await?;
            println!("Authorized '{}'.", server);
            Ok(())
        }
    }
}

async fn run_list_all(runtime: &Runtime, json: bool) -> Result<()> {
    let outcomes = runtime.list_all().await;
    let rows = output::list_rows(&outcomes, runtime.settings().list_timeout);

    if json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
    } else {
        print!("{}", output::render_rows(&rows));
    }
    Ok(())
}

async fn run_list_server(runtime: &Runtime, server: &str, json: bool, schema: bool) -> Result<()> {
    let tools = runtime.list_tools(server).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&tools)?);
    } else {
        print!("{}", output::render_tools(server, &tools, schema));
    }
    Ok(())
}

async fn run_call_tool(runtime: &Runtime, server: &str, tool: &str, args: Option<String>) -> Result<()> {
    let arguments = match args {
        Some(raw) => Some(serde_json::from_str(&raw).context("Invalid JSON in --args")?),
        None => None,
    };

    let result = runtime.call_tool(server, tool, arguments).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// Build an ad-hoc HTTP definition from `--http-url`
fn adhoc_server(url: &str, name: Option<&str>, settings: &RuntimeSettings) -> Result<ServerDefinition> {
    let parsed = url::Url::parse(url).with_context(|| format!("Invalid --http-url '{}'", url))?;
    let name = match name {
        Some(name) => name.to_string(),
        None => parsed
            .host_str()
            .map(str::to_string)
            .context("--http-url has no host; pass --name")?,
    };

    let mut server = ServerDefinition::adhoc_http(name, url);
    server.lifecycle = resolve_lifecycle(&server.name, None, &server.command, &settings.lifecycle_overrides);
    Ok(server)
}
