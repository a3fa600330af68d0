//! Guidance binary: thin CLI shell over the [`guidance_server`] library crate.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand};
use guidance_core::{AgentPrompt, Variables};
use tracing::{error, info};

use guidance_server::api::router;
use guidance_server::types::AppContext;
use guidance_server::{
    build_models, build_processor, load_config, parse_input, resolve_bind, GuidanceConfig, Processor,
};

// ---------------------------------------------------------------------------
// CLI definition (clap derive)
// ---------------------------------------------------------------------------

/// Guided text generation over OpenAI-compatible completion backends.
#[derive(Parser)]
#[command(name = "guidance", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to guidance.toml
    #[arg(long, global = true, default_value = "guidance.toml")]
    config: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve the HTTP API (default)
    Serve {
        /// Bind to 0.0.0.0 instead of the configured host
        #[arg(long)]
        bind_all: bool,
    },
    /// Process one template file and print the result map as JSON
    Run {
        /// Configured model name
        #[arg(long)]
        model: String,

        /// Template file
        #[arg(long)]
        template: PathBuf,

        /// JSON file with variable bindings
        #[arg(long)]
        vars: Option<PathBuf>,

        /// Print every snapshot as NDJSON
        #[arg(long)]
        stream: bool,
    },
    /// Render a few-shot agent prompt from a JSON definition
    Prompt {
        /// Agent definition (JSON)
        #[arg(long)]
        agent: PathBuf,

        /// Input value as KEY=VALUE (repeatable)
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<(String, String)>,
    },
    /// Print the token ids of TEXT for a configured model
    Tokenize {
        /// Configured model name
        #[arg(long)]
        model: String,

        text: String,
    },
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

// ---------------------------------------------------------------------------
// Graceful shutdown signal
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received SIGINT, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                error!(error = %e, "Could not register SIGTERM handler");
                let _ = ctrl_c.await;
                info!("Received SIGINT, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received Ctrl+C, shutting down...");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn exit_with(message: &str, e: impl std::fmt::Display) -> ! {
    error!(error = %e, "{message}");
    std::process::exit(1);
}

fn config_or_exit(path: &Path) -> GuidanceConfig {
    load_config(path).unwrap_or_else(|e| exit_with("Could not load config", e))
}

fn model_or_exit(config: &GuidanceConfig, name: &str) -> Processor {
    let Some(model) = config.models.get(name) else {
        let known: Vec<&str> = config.models.keys().map(String::as_str).collect();
        error!(model = name, known = %known.join(", "), "Unknown model");
        std::process::exit(1);
    };
    build_processor(name, model).unwrap_or_else(|e| exit_with("Could not initialize model", e))
}

fn read_variables(path: Option<&Path>) -> Variables {
    let Some(path) = path else {
        return Variables::new();
    };
    let content = std::fs::read_to_string(path).unwrap_or_else(|e| exit_with("Could not read variables file", e));
    serde_json::from_str(&content).unwrap_or_else(|e| exit_with("Invalid variables file", e))
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

async fn run_template(config: &GuidanceConfig, model: &str, template: &Path, vars: Option<&Path>, stream: bool) {
    let processor = Arc::new(model_or_exit(config, model));
    let template =
        std::fs::read_to_string(template).unwrap_or_else(|e| exit_with("Could not read template file", e));
    let variables = read_variables(vars);

    if stream {
        let mut snapshots = processor.process_template_stream(&template, &variables);
        while let Some(item) = snapshots.next().await {
            match item {
                Ok(results) => println!("{}", serde_json::json!(results)),
                Err(e) => exit_with("Template failed", e),
            }
        }
        return;
    }

    match processor.process_template(&template, &variables).await {
        Ok(results) => match serde_json::to_string_pretty(&results) {
            Ok(json) => println!("{json}"),
            Err(e) => exit_with("Could not encode results", e),
        },
        Err(e) => exit_with("Template failed", e),
    }
}

fn render_prompt(agent: &Path, inputs: &[(String, String)]) {
    let content = std::fs::read_to_string(agent).unwrap_or_else(|e| exit_with("Could not read agent file", e));
    let agent: AgentPrompt = serde_json::from_str(&content).unwrap_or_else(|e| exit_with("Invalid agent file", e));
    let inputs = inputs.iter().cloned().collect();
    print!("{}", agent.generate_prompt(&inputs));
}

fn tokenize(config: &GuidanceConfig, model: &str, text: &str) {
    let processor = model_or_exit(config, model);
    match processor.tokenizer().encode(text) {
        Ok(tokens) => println!("{}", serde_json::json!({ "tokens": tokens, "count": tokens.len() })),
        Err(e) => exit_with("Could not tokenize", e),
    }
}

async fn serve(config: &GuidanceConfig, bind_all: bool) {
    let models = build_models(config).unwrap_or_else(|e| exit_with("Could not initialize models", e));
    info!(models = models.len(), "Models ready");
    let app = router(AppContext::new(models));

    let port = std::env::var("PORT").ok();
    let addr = resolve_bind(config.bind.as_deref(), bind_all, port.as_deref());
    let listener = tokio::net::TcpListener::bind(&addr).await.unwrap_or_else(|e| {
        error!(addr = addr.as_str(), error = %e, "Could not bind");
        if port.is_some() {
            eprintln!("  PORT was set explicitly. Choose a different port.");
        }
        std::process::exit(1);
    });

    match listener.local_addr() {
        Ok(local) => info!(addr = %local, "http://{local}"),
        Err(e) => error!(error = %e, "Could not read listener address"),
    }

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        exit_with("Server error", e);
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() {
    // Initialize structured logging
    let filter = tracing_subscriber::EnvFilter::from_default_env();
    let filter = match "guidance=info".parse() {
        Ok(directive) => filter.add_directive(directive),
        Err(_) => filter,
    };
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stderr).init();

    let cli = Cli::parse();

    match &cli.command {
        Some(Commands::Completions { shell }) => {
            clap_complete::generate(*shell, &mut Cli::command(), "guidance", &mut std::io::stdout());
        }
        Some(Commands::Run { model, template, vars, stream }) => {
            let config = config_or_exit(&cli.config);
            run_template(&config, model, template, vars.as_deref(), *stream).await;
        }
        Some(Commands::Prompt { agent, inputs }) => render_prompt(agent, inputs),
        Some(Commands::Tokenize { model, text }) => {
            let config = config_or_exit(&cli.config);
            tokenize(&config, model, text);
        }
        Some(Commands::Serve { bind_all }) => {
            let config = config_or_exit(&cli.config);
            serve(&config, *bind_all).await;
        }
        None => {
            let config = config_or_exit(&cli.config);
            serve(&config, false).await;
        }
    }
}
