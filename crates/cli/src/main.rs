mod config;
mod logging;
mod serve;

use std::path::{Path, PathBuf};
use std::process;

use clap::{Parser, Subcommand, ValueEnum};
use megamodel_engine::catalog::validate_gom_shape;
use megamodel_storage::GomRecord;

use crate::config::{Overrides, ServerConfig};
use crate::logging::{init_logging, LogFormat};

/// Output format for CLI responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub(crate) enum OutputFormat {
    Text,
    Json,
}

/// Component-state coherence service for distributed microservices.
#[derive(Parser)]
#[command(name = "megamodel", version, about = "Component-state coherence service")]
struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text", value_enum)]
    output: OutputFormat,

    /// Suppress non-essential output
    #[arg(long, global = true)]
    quiet: bool,

    /// Log filter used when RUST_LOG is unset (e.g. info, megamodel_engine=debug)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Log output format
    #[arg(long, global = true, default_value = "pretty", value_enum)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP JSON API server
    Serve {
        /// Path to a TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
        /// Port to listen on
        #[arg(long)]
        port: Option<u16>,
        /// Address to bind
        #[arg(long)]
        bind: Option<String>,
        /// Origin allowed to make credentialed cross-origin requests (repeatable)
        #[arg(long = "allowed-origin")]
        allowed_origins: Vec<String>,
    },

    /// Validate a GOM document (one GOM object or an array of them)
    CheckGom {
        /// Path to the GOM JSON file
        file: PathBuf,
    },

    /// Print the effective configuration
    Config {
        /// Path to a TOML configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve {
            config,
            port,
            bind,
            allowed_origins,
        } => {
            init_logging(cli.log_format, &cli.log_level);
            let overrides = Overrides {
                bind,
                port,
                allowed_origins,
            };
            let config = load_config(config.as_deref(), overrides, cli.output, cli.quiet);
            let rt = match tokio::runtime::Runtime::new() {
                Ok(rt) => rt,
                Err(e) => {
                    report_error(
                        &format!("failed to create tokio runtime: {}", e),
                        cli.output,
                        cli.quiet,
                    );
                    process::exit(1);
                }
            };
            if let Err(e) = rt.block_on(serve::start_server(config)) {
                tracing::error!(error = %e, "server error");
                report_error(&format!("server error: {}", e), cli.output, cli.quiet);
                process::exit(1);
            }
        }
        Commands::CheckGom { file } => {
            cmd_check_gom(&file, cli.output, cli.quiet);
        }
        Commands::Config { config } => {
            let config =
                load_config(config.as_deref(), Overrides::default(), cli.output, cli.quiet);
            cmd_config(&config, cli.output);
        }
    }
}

fn load_config(
    path: Option<&Path>,
    overrides: Overrides,
    output: OutputFormat,
    quiet: bool,
) -> ServerConfig {
    match ServerConfig::load(path, overrides) {
        Ok(config) => config,
        Err(e) => {
            report_error(&e.to_string(), output, quiet);
            process::exit(1);
        }
    }
}

fn cmd_config(config: &ServerConfig, output: OutputFormat) {
    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(config) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                report_error(&format!("error serializing config: {}", e), output, false);
                process::exit(1);
            }
        },
        OutputFormat::Text => match toml::to_string_pretty(config) {
            Ok(text) => print!("{}", text),
            Err(e) => {
                report_error(&format!("error serializing config: {}", e), output, false);
                process::exit(1);
            }
        },
    }
}

/// Parse a GOM document into its models.
fn parse_goms(text: &str) -> Result<Vec<GomRecord>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.is_array() {
        serde_json::from_value(value)
    } else {
        serde_json::from_value(value).map(|gom| vec![gom])
    }
}

/// Offline checks of GOM documents: duplicate steps and condition syntax.
/// Catalog references are checked by the server on create.
fn cmd_check_gom(path: &Path, output: OutputFormat, quiet: bool) {
    let text = match std::fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            let msg = format!("error reading file '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };
    let goms = match parse_goms(&text) {
        Ok(goms) => goms,
        Err(e) => {
            let msg = format!("error parsing GOM JSON in '{}': {}", path.display(), e);
            report_error(&msg, output, quiet);
            process::exit(1);
        }
    };

    let results: Vec<(String, Result<(), String>)> = goms
        .iter()
        .map(|gom| {
            (
                gom.id.clone(),
                validate_gom_shape(gom).map_err(|e| e.to_string()),
            )
        })
        .collect();
    let failed = results.iter().filter(|(_, r)| r.is_err()).count();

    if !quiet {
        match output {
            OutputFormat::Text => {
                for (id, result) in &results {
                    match result {
                        Ok(()) => println!("{}: ok", id),
                        Err(e) => println!("{}: {}", id, e),
                    }
                }
                println!("{} checked, {} invalid", results.len(), failed);
            }
            OutputFormat::Json => {
                let entries: Vec<serde_json::Value> = results
                    .iter()
                    .map(|(id, result)| match result {
                        Ok(()) => serde_json::json!({"id": id, "valid": true}),
                        Err(e) => serde_json::json!({"id": id, "valid": false, "error": e}),
                    })
                    .collect();
                let report = serde_json::json!({
                    "checked": results.len(),
                    "invalid": failed,
                    "goms": entries,
                });
                println!("{}", report);
            }
        }
    }
    if failed > 0 {
        process::exit(1);
    }
}

/// Report an error to stderr.
pub(crate) fn report_error(msg: &str, output: OutputFormat, quiet: bool) {
    if quiet {
        return;
    }
    match output {
        OutputFormat::Text => eprintln!("{}", msg),
        OutputFormat::Json => {
            eprintln!("{}", serde_json::json!({ "error": msg }));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_gom_and_arrays() {
        let one = r#"{"id": "g1", "name": "publish"}"#;
        assert_eq!(parse_goms(one).unwrap().len(), 1);

        let many = r#"[{"id": "g1", "name": "a"}, {"id": "g2", "name": "b"}]"#;
        let goms = parse_goms(many).unwrap();
        assert_eq!(goms[1].id, "g2");

        assert!(parse_goms(r#"{"name": "no id"}"#).is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
