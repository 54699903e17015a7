use anyhow::Context;
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fhir::ResourceFormat;
use hammer_core::config::{
    fhir_version_from_env_value, java_runtime_from_env_value, resolve_app_dir,
    terminology_service_from_env_value, validator_jar_from_env_value,
};
use hammer_core::{CoreConfig, Orchestrator};

mod report;

use report::ReportFormat;

#[derive(Parser)]
#[command(name = "hammer")]
#[command(about = "Validate a FHIR resource with the in-process and Java validators")]
struct Cli {
    /// Resource file to validate (XML or JSON)
    resource_file: PathBuf,
    /// Directory of additional profiles (defaults to the resource file's directory)
    #[arg(short = 's', long)]
    scopedir: Option<PathBuf>,
    /// Target FHIR version: STU3 or R4
    #[arg(long)]
    fhir_version: Option<String>,
    /// Terminology server, or "n/a" to check locally only
    #[arg(long)]
    tx: Option<String>,
    /// Java runtime used to launch the validator jar
    #[arg(long)]
    java: Option<String>,
    /// Path to the Java validator jar
    #[arg(long)]
    validator_jar: Option<String>,
    /// Report format
    #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
    report: ReportFormat,
}

/// Main entry point for the Hammer validator
///
/// Validates one resource file with both engines, waits for them to finish and prints a
/// report. Ctrl-C cancels the run and kills the Java validator.
///
/// # Environment Variables
/// - `HAMMER_APP_DIR`: Directory holding the validator jar and core archives (default: executable directory)
/// - `HAMMER_JAVA`: Java runtime (default: "java")
/// - `HAMMER_VALIDATOR_JAR`: Validator jar (default: `<app dir>/org.hl7.fhir.validator.jar`)
/// - `HAMMER_FHIR_VERSION`: Target FHIR version, STU3 or R4 (default: "STU3")
/// - `HAMMER_TX`: Terminology server (default: "https://tx.fhir.org/r3")
///
/// Command-line flags take precedence over the environment.
///
/// # Returns
/// * `Ok(())` - If the run completed; the process exits with status 1 when errors were found
/// * `Err(anyhow::Error)` - If configuration, file loading or run startup fails
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("hammer=info".parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let config = resolve_config(&cli)?;

    let text = std::fs::read_to_string(&cli.resource_file)
        .with_context(|| format!("failed to read {}", cli.resource_file.display()))?;

    let orchestrator = Orchestrator::new(&config);
    let format = orchestrator.load_resource_text(text);
    if format == ResourceFormat::Unknown {
        tracing::warn!(
            "{} is neither XML nor JSON; both validators will report it",
            cli.resource_file.display()
        );
    }
    orchestrator.set_scope_directory(scope_directory(&cli))?;

    tracing::info!(
        "++ Validating {} ({}, FHIR {})",
        cli.resource_file.display(),
        format,
        config.fhir_version()
    );
    orchestrator.start_validation()?;

    let snapshot = tokio::select! {
        snapshot = orchestrator.wait_until_idle() => snapshot,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel_validation();
            tracing::info!("validation canceled");
            orchestrator.snapshot()
        }
    };

    print!("{}", report::render(&snapshot, cli.report));

    let errors = snapshot.managed.error_count + snapshot.external.error_count;
    if errors > 0 {
        drop(orchestrator);
        std::process::exit(1);
    }
    Ok(())
}

/// Resolve configuration once at startup: flags first, then the environment, then defaults.
fn resolve_config(cli: &Cli) -> anyhow::Result<CoreConfig> {
    let env = |name: &str| std::env::var(name).ok();

    let app_dir = resolve_app_dir(env("HAMMER_APP_DIR").map(PathBuf::from))?;
    let java_runtime = java_runtime_from_env_value(cli.java.clone().or_else(|| env("HAMMER_JAVA")));
    let validator_jar = validator_jar_from_env_value(
        cli.validator_jar
            .clone()
            .or_else(|| env("HAMMER_VALIDATOR_JAR")),
        &app_dir,
    );
    let fhir_version = fhir_version_from_env_value(
        cli.fhir_version
            .clone()
            .or_else(|| env("HAMMER_FHIR_VERSION")),
    )?;
    let terminology_service =
        terminology_service_from_env_value(cli.tx.clone().or_else(|| env("HAMMER_TX")));

    Ok(CoreConfig::new(
        app_dir,
        java_runtime,
        validator_jar,
        fhir_version,
        terminology_service,
    )?)
}

/// The explicit scope directory, or the directory the resource file sits in.
fn scope_directory(cli: &Cli) -> Option<PathBuf> {
    cli.scopedir.clone().or_else(|| {
        cli.resource_file
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .or_else(|| std::env::current_dir().ok())
    })
}
