//! SF-040: CLI subcommands. Init, validate, plan, synth, deploy, status, schema.

use crate::core::types::{DeployConfig, ResourceGraph};
use crate::core::{collector, parser};
use crate::deploy::monitor::summarize;
use crate::deploy::orchestrator::Orchestrator;
use crate::deploy::state::{load_state, state_file_path};
use crate::pipeline::{self, CompiledPlan};
use crate::platform::local::{LocalArtifactStore, LocalControlPlane};
use crate::provenance::hasher;
use clap::Subcommand;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Environment variable holding the local token signing secret.
pub const TOKEN_SECRET_ENV: &str = "SHARDFORM_TOKEN_SECRET";

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter resource graph
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate a resource graph without touching any platform
    Validate {
        /// Path to the resource graph
        #[arg(short, long, default_value = "graph.yaml")]
        file: PathBuf,

        /// Deployment config overriding the graph's `config:` block
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show the document assignment and deployment tiers
    Plan {
        #[arg(short, long, default_value = "graph.yaml")]
        file: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the canonical assignment JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Render deployment documents into a directory
    Synth {
        #[arg(short, long, default_value = "graph.yaml")]
        file: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Output directory
        #[arg(short, long, default_value = "out")]
        out: PathBuf,
    },

    /// Deploy with the local artifact store and control plane
    Deploy {
        #[arg(short, long, default_value = "graph.yaml")]
        file: PathBuf,

        #[arg(short, long)]
        config: Option<PathBuf>,

        /// State directory
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Continue the interrupted run instead of starting a new one
        #[arg(long)]
        resume: bool,
    },

    /// Show recorded deployment runs
    Status {
        #[arg(long, default_value = "state")]
        state_dir: PathBuf,

        /// Deployment name (default: all)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Print the JSON schema of the resource graph format
    Schema,
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file, config } => cmd_validate(&file, config.as_deref()),
        Commands::Plan { file, config, json } => cmd_plan(&file, config.as_deref(), json),
        Commands::Synth { file, config, out } => cmd_synth(&file, config.as_deref(), &out),
        Commands::Deploy {
            file,
            config,
            state_dir,
            resume,
        } => cmd_deploy(&file, config.as_deref(), &state_dir, resume),
        Commands::Status { state_dir, name } => cmd_status(&state_dir, name.as_deref()),
        Commands::Schema => cmd_schema(),
    }
}

fn cmd_init(path: &Path) -> Result<(), String> {
    let graph_path = path.join("graph.yaml");
    if graph_path.exists() {
        return Err(format!("{} already exists", graph_path.display()));
    }

    let template = r#"name: my-deployment
description: "Managed by shardform"

resources:
  - id: plan
    type: Microsoft.Web/serverfarms
    api_version: "2022-03-01"
    properties:
      sku: { name: B1 }

  - id: site
    type: Microsoft.Web/sites
    api_version: "2022-03-01"
    properties:
      serverFarmId: "${ref:plan}"

config:
  rollback_on_failure: true
"#;
    std::fs::create_dir_all(path).map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&graph_path, template)
        .map_err(|e| format!("cannot write {}: {}", graph_path.display(), e))?;

    println!("Initialized shardform project at {}", path.display());
    println!("  Created: {}", graph_path.display());
    Ok(())
}

/// Parse a graph and the effective config (override file wins).
fn load(file: &Path, config: Option<&Path>) -> Result<(ResourceGraph, DeployConfig), String> {
    let graph = parser::parse_graph_file(file).map_err(|e| e.to_string())?;
    let config = match config {
        Some(path) => parser::parse_config_file(path).map_err(|e| e.to_string())?,
        None => graph.config.clone(),
    };
    Ok((graph, config))
}

fn compile(file: &Path, config: Option<&Path>) -> Result<CompiledPlan, String> {
    let (graph, config) = load(file, config)?;
    let base_dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    pipeline::compile_with(&graph, &config)
        .map(|plan| plan.with_base_dir(base_dir))
        .map_err(|e| e.to_string())
}

fn cmd_validate(file: &Path, config: Option<&Path>) -> Result<(), String> {
    let (graph, config) = load(file, config)?;
    let mut errors: Vec<String> = parser::validate_graph(&graph)
        .iter()
        .map(ToString::to_string)
        .collect();
    if let Err(e) = parser::validate_limits(&config) {
        errors.push(e.to_string());
    }
    if errors.is_empty() {
        if let Err(e) = collector::collect(&graph) {
            errors.push(e.to_string());
        }
    }

    if errors.is_empty() {
        println!(
            "OK: {} ({} resources, {} payloads)",
            graph.name,
            graph.resources.len(),
            graph.payloads.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

fn cmd_plan(file: &Path, config: Option<&Path>, json: bool) -> Result<(), String> {
    let plan = compile(file, config)?;
    if json {
        let canonical = plan
            .assignment
            .to_canonical_json()
            .map_err(|e| format!("serialize error: {}", e))?;
        println!("{}", canonical);
        return Ok(());
    }
    print_plan(&plan);
    Ok(())
}

fn print_plan(plan: &CompiledPlan) {
    println!(
        "Planning: {} ({} resources, {} documents)",
        plan.name,
        plan.metadata.len(),
        plan.assignment.documents.len()
    );
    println!();
    for doc in &plan.assignment.documents {
        let rendered = plan
            .synthesis
            .template(&doc.id)
            .map(|t| t.size_bytes)
            .unwrap_or_default();
        println!(
            "{}: {} resources, {} bytes (estimated {})",
            doc.id,
            doc.resources.len(),
            rendered,
            doc.estimated_size
        );
        for id in &doc.resources {
            println!("  + {}", id);
        }
    }

    println!();
    for tier in &plan.tiers {
        println!("Tier {}: {}", tier.index, tier.documents.join(", "));
    }
    if !plan.synthesis.cross_references.is_empty() {
        println!();
        for xref in &plan.synthesis.cross_references {
            println!(
                "  {} -> {} via {} ({})",
                xref.producer,
                xref.consumer,
                xref.parameter,
                xref.resource
            );
        }
    }
    println!();
    println!(
        "Plan: {} document(s) in {} tier(s), {} cross-document reference(s).",
        plan.assignment.documents.len(),
        plan.tiers.len(),
        plan.synthesis.cross_references.len()
    );
}

fn cmd_synth(file: &Path, config: Option<&Path>, out: &Path) -> Result<(), String> {
    let plan = compile(file, config)?;
    let written = plan.write_templates(out).map_err(|e| e.to_string())?;
    for path in &written {
        println!("  wrote {}", path.display());
    }
    println!("Synthesized {} document(s) into {}", written.len(), out.display());
    Ok(())
}

/// Token secret for the local store: env override, else derived from the
/// state directory so resumed runs can verify earlier tokens.
fn token_secret(state_dir: &Path) -> String {
    std::env::var(TOKEN_SECRET_ENV)
        .unwrap_or_else(|_| hasher::hash_string(&state_dir.display().to_string()))
}

fn cmd_deploy(file: &Path, config: Option<&Path>, state_dir: &Path, resume: bool) -> Result<(), String> {
    let plan = compile(file, config)?;
    let store = Arc::new(LocalArtifactStore::new(
        state_dir.join(&plan.name),
        &token_secret(state_dir),
    ));
    let plane = Arc::new(LocalControlPlane::new(Arc::clone(&store)));
    let orchestrator = Orchestrator::new(store, plane, state_dir);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("cannot start runtime: {}", e))?;
    let outcome = runtime
        .block_on(async {
            if resume {
                orchestrator.resume(&plan).await
            } else {
                orchestrator.deploy(&plan).await
            }
        })
        .map_err(|e| e.to_string())?;

    print!("{}", summarize(&outcome.state));
    outcome.into_result().map(|_| ()).map_err(|e| e.to_string())
}

fn cmd_status(state_dir: &Path, name: Option<&str>) -> Result<(), String> {
    let names: Vec<String> = match name {
        Some(name) => vec![name.to_string()],
        None => {
            if !state_dir.exists() {
                println!("No state found. Run `shardform deploy` first.");
                return Ok(());
            }
            let entries = std::fs::read_dir(state_dir)
                .map_err(|e| format!("cannot read state dir {}: {}", state_dir.display(), e))?;
            let mut names: Vec<String> = entries
                .flatten()
                .filter(|e| e.path().is_dir())
                .map(|e| e.file_name().to_string_lossy().to_string())
                .filter(|n| state_file_path(state_dir, n).exists())
                .collect();
            names.sort();
            names
        }
    };

    let mut found = false;
    for name in &names {
        if let Some(state) = load_state(state_dir, name).map_err(|e| e.to_string())? {
            found = true;
            print!("{}", summarize(&state));
            println!();
        }
    }
    if !found {
        println!("No state found. Run `shardform deploy` first.");
    }
    Ok(())
}

fn cmd_schema() -> Result<(), String> {
    let schema = schemars::schema_for!(ResourceGraph);
    let json =
        serde_json::to_string_pretty(&schema).map_err(|e| format!("serialize error: {}", e))?;
    println!("{}", json);
    Ok(())
}
