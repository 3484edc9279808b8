//! chatrelay - model-routing streaming relay for OpenAI-compatible chat APIs
//!
//! A small HTTP service that normalizes chat messages, picks an upstream
//! model for each request and streams the completion back to the client.

use chatrelay::config::{Config, KeySource};
use chatrelay::proxy::{normalize_messages, run_server};
use chatrelay::router::ModelRouter;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "chatrelay")]
#[command(about = "Model-routing streaming relay for OpenAI-compatible chat APIs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show the routing table and model catalog
    Models {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show which model a single user message would be routed to
    Route {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Requested model id
        #[arg(short, long, default_value = "auto")]
        model: String,

        /// The user message
        query: String,
    },
}

fn config_exists(path: &str) -> bool {
    std::path::Path::new(path).exists()
}

/// Load the config file, or fall back to defaults (plus convention env vars)
/// when it does not exist.
fn load_config(path: &str) -> anyhow::Result<(Config, Vec<(String, KeySource)>)> {
    if config_exists(path) {
        Ok(Config::from_file_with_env(path)?)
    } else {
        let (config, key_sources) = Config::from_raw(Default::default())?;
        config.validate()?;
        Ok((config, key_sources))
    }
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("chatrelay={},tower_http=info", level).into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            // The log level lives in the config, so read it before tracing starts.
            let (mut cfg, key_sources) = load_config(&config)?;
            init_tracing(&cfg.logging.level);
            if config_exists(&config) {
                tracing::info!(config = %config, "Loaded configuration");
            } else {
                tracing::warn!(config = %config, "Config file not found, using defaults");
            }

            for (section, source) in &key_sources {
                tracing::info!(section = %section, key_source = %source, "API key resolved");
            }

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            run_server(cfg).await
        }

        Commands::Check { config } => {
            init_tracing("warn");
            let (cfg, key_sources) = load_config(&config)?;

            if config_exists(&config) {
                println!("Configuration OK: {}", config);
            } else {
                println!("{} not found; defaults are valid", config);
            }
            println!("  listen:        {}", cfg.server.listen);
            println!("  upstream:      {}", cfg.upstream.url);
            for (section, source) in &key_sources {
                println!("  {} key: {}", section, source);
            }
            println!(
                "  idle timeout:  {}s, max_tokens cap {}",
                cfg.relay.idle_timeout_secs, cfg.relay.max_tokens_cap
            );
            println!("  retired rules: {}", cfg.routing.retired.len());
            match &cfg.database {
                Some(db) if cfg.logging.log_requests => println!("  request log:   {}", db.path),
                _ => println!("  request log:   disabled"),
            }
            Ok(())
        }

        Commands::Models { config } => {
            init_tracing("warn");
            let (cfg, _) = load_config(&config)?;
            let routing = &cfg.routing;

            println!("Routing table:");
            println!("  default:      {}", routing.default_model);
            println!("  vision:       {}", routing.vision_model);
            println!("  long context: {}", routing.long_context_model);
            println!("  reasoning:    {}", routing.reasoning_model);
            println!("  fast:         {}", routing.fast_model);
            println!("  versatile:    {}", routing.versatile_model);
            for rule in &routing.retired {
                println!("  retired:      *{}* -> {}", rule.matcher, rule.replacement);
            }

            println!();
            println!("Catalog:");
            for model in &cfg.models {
                let window = model
                    .context_window
                    .map(|w| format!("{} tokens", w))
                    .unwrap_or_else(|| "-".to_string());
                println!("  {:<32} {:<22} {}", model.id, model.name, window);
            }
            Ok(())
        }

        Commands::Route {
            config,
            model,
            query,
        } => {
            init_tracing("warn");
            let (cfg, _) = load_config(&config)?;
            let router = ModelRouter::new(cfg.routing)?;

            let messages = vec![serde_json::json!({ "role": "user", "content": query })];
            let conversation = normalize_messages(&messages);
            let selection = router.route(&conversation, Some(&model));

            println!("{} ({})", selection.routed, selection.reason);
            Ok(())
        }
    }
}
