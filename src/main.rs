use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use dicom_fusion::config::{self, ExportConfig, PreviewConfig, Settings};
use dicom_fusion::diagnostics::Diagnostics;
use dicom_fusion::pipeline::{self, respond};
use dicom_fusion::slice_order::SliceOrderResolver;
use dicom_fusion::transform::io::read_transform_file;

#[derive(Parser)]
#[command(name = "fusebox")]
#[command(about = "Resample a secondary DICOM series onto a primary grid")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Resample and return one plane as a JSON preview payload
    Preview {
        /// Request document (JSON)
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Resample and write a derived DICOM series with a manifest
    Export {
        /// Request document (JSON)
        #[arg(long, value_name = "FILE")]
        config: PathBuf,
    },
    /// Print files in ascending order along the slice normal
    Order {
        #[arg(value_name = "FILE", required = true)]
        paths: Vec<PathBuf>,
    },
    /// Describe a transform file and its inverse
    Inspect {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let payload = match cli.command {
        Command::Preview { config } => match load_config::<PreviewConfig>(&config) {
            Ok(request) => respond(request.and_then(|request| pipeline::run_preview(&request))),
            Err(missing) => return emit(&missing, ExitCode::from(1)),
        },
        Command::Export { config } => match load_config::<ExportConfig>(&config) {
            Ok(request) => respond(
                request.and_then(|request| pipeline::run_export(&request, &Settings::from_env())),
            ),
            Err(missing) => return emit(&missing, ExitCode::from(1)),
        },
        Command::Order { paths } => {
            let mut diagnostics = Diagnostics::new();
            respond(
                SliceOrderResolver::order_files("series", &paths, &mut diagnostics)
                    .map(|files| json!({"ok": true, "files": files, "diagnostics": diagnostics})),
            )
        }
        Command::Inspect { path } => respond(
            read_transform_file(&path)
                .map(|transform| json!({"ok": true, "inspection": transform.inspect()})),
        ),
    };

    let code = if payload["ok"] == false {
        ExitCode::from(2)
    } else {
        ExitCode::SUCCESS
    };
    emit(&payload, code)
}

/// A request that cannot be found is reported apart from pipeline failures.
fn load_config<T: DeserializeOwned>(path: &Path) -> Result<dicom_fusion::Result<T>, Value> {
    if !path.is_file() {
        return Err(json!({"ok": false, "error": format!("config not found: {}", path.display())}));
    }
    Ok(config::from_path(path))
}

fn emit(payload: &Value, code: ExitCode) -> anyhow::Result<ExitCode> {
    println!("{}", serde_json::to_string(payload)?);
    Ok(code)
}
