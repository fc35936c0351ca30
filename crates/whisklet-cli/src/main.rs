use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use whisklet_core::manifest::Manifest;
use whisklet_core::registry::RouteTable;
use whisklet_server::AppState;

#[derive(Parser)]
#[command(
    name = "whisklet",
    about = "Local host for sandboxed serverless actions — one HTTP route per manifest action",
    version,
    propagate_version = true
)]
struct Cli {
    /// Manifest file declaring environment, packages, and actions
    #[arg(long, global = true, default_value = "project.yml", env = "WHISKLET_MANIFEST")]
    manifest: PathBuf,

    /// Directory holding one subdirectory per package/action
    #[arg(long, global = true, default_value = "packages", env = "WHISKLET_PACKAGES")]
    packages: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve all registered actions over HTTP
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,
    },

    /// Print the route table without serving
    Routes {
        /// Output as JSON
        #[arg(long, short = 'j')]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .init();

    let result = match cli.command {
        Commands::Serve { port } => run_serve(&cli.manifest, &cli.packages, port),
        Commands::Routes { json } => run_routes(&cli.manifest, &cli.packages, json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

/// Load the manifest and build the route table. A malformed manifest is
/// fatal; individual bad actions were already skipped with warnings.
fn boot(
    manifest_path: &Path,
    packages_dir: &Path,
) -> anyhow::Result<(RouteTable, BTreeMap<String, String>)> {
    let manifest = Manifest::load(manifest_path)?;
    let table = RouteTable::from_manifest(&manifest, packages_dir);
    Ok((table, manifest.environment))
}

fn run_serve(manifest_path: &Path, packages_dir: &Path, port: u16) -> anyhow::Result<()> {
    let (table, global_env) = boot(manifest_path, packages_dir)?;
    if table.is_empty() {
        tracing::warn!("no actions registered; serving diagnostics only");
    }

    let state = AppState::new(table, global_env);
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(whisklet_server::serve(state, port))
}

fn run_routes(manifest_path: &Path, packages_dir: &Path, json: bool) -> anyhow::Result<()> {
    let (table, _) = boot(manifest_path, packages_dir)?;

    if json {
        let routes: Vec<serde_json::Value> = table
            .actions()
            .iter()
            .map(|a| {
                serde_json::json!({
                    "route": a.route,
                    "entrypoint": a.entrypoint,
                    "timeout": a.timeout_ms,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&routes)?);
    } else {
        for action in table.actions() {
            println!(
                "{}  ->  {} ({} ms)",
                action.route,
                action.entrypoint.display(),
                action.timeout_ms
            );
        }
    }
    Ok(())
}
