use clap::Parser;
use pychub_packaging::build::{run, AuditSink, BuildOptions};
use std::path::PathBuf;
use std::str::FromStr;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use url::Url;

/// Package a Python wheel and its dependency closure into a chub archive.
#[derive(Parser)]
#[command(name = "pychub", about, long_about = None, disable_version_flag = true)]
struct Args {
    /// Print the version and exit
    #[clap(short = 'v', long = "version")]
    version: bool,

    /// Analyze the effective compatibility spec and exit
    #[clap(long)]
    analyze_compatibility: bool,

    /// Output path of the .chub file
    #[clap(short = 'c', long)]
    chub: Option<String>,

    /// Load build options from a chubproject file
    #[clap(long)]
    chubproject: Option<PathBuf>,

    /// Write the normalized project file to this path
    #[clap(long)]
    chubproject_save: Option<PathBuf>,

    /// Entry point invoked when the chub installs
    #[clap(short = 'e', long)]
    entrypoint: Option<String>,

    /// Files to include as FILE[::dest]
    #[clap(short = 'i', long = "include")]
    includes: Vec<String>,

    /// Other chub archives to nest
    #[clap(long = "include-chub")]
    include_chubs: Vec<String>,

    /// Metadata entries as KEY=VALUE[,VALUE...]
    #[clap(short = 'm', long = "metadata-entry")]
    metadata_entries: Vec<String>,

    /// Scripts to run after install
    #[clap(short = 'o', long = "post-script")]
    post_scripts: Vec<String>,

    /// Scripts to run before install
    #[clap(short = 'p', long = "pre-script")]
    pre_scripts: Vec<String>,

    /// Project directory (defaults to the current directory)
    #[clap(long)]
    project_path: Option<PathBuf>,

    /// Table path hint for --chubproject-save
    #[clap(short = 't', long)]
    table: Option<String>,

    /// Verbose logging
    #[clap(long)]
    verbose: bool,

    /// Additional audit log destinations (stdout, stderr, file:PATH)
    #[clap(long = "audit-log")]
    audit_logs: Vec<String>,

    /// Base URL of a PEP 691 Simple API index
    #[clap(long)]
    index_url: Option<Url>,

    /// Wheels to package: local .whl paths or pinned requirements
    #[clap(short = 'w', long = "wheel")]
    wheels: Vec<String>,

    /// Arguments passed to the entry point
    #[clap(long = "entrypoint-args", num_args = 1.., allow_hyphen_values = true)]
    entrypoint_args: Vec<String>,
}

/// Builds the package-table overlay that CLI options contribute on top of the project file.
fn cli_overlay(args: &Args) -> miette::Result<toml::Table> {
    use toml::Value;

    let mut table = toml::Table::new();
    let mut put_str = |key: &str, value: &Option<String>| {
        if let Some(value) = value {
            table.insert(key.to_owned(), Value::String(value.clone()));
        }
    };
    put_str("chub", &args.chub);
    put_str("entrypoint", &args.entrypoint);

    let mut put_list = |key: &str, values: &[String]| {
        if !values.is_empty() {
            table.insert(
                key.to_owned(),
                Value::Array(values.iter().cloned().map(Value::String).collect()),
            );
        }
    };
    put_list("wheels", &args.wheels);
    put_list("includes", &args.includes);
    put_list("include_chubs", &args.include_chubs);
    put_list("pre_scripts", &args.pre_scripts);
    put_list("post_scripts", &args.post_scripts);
    put_list("entrypoint_args", &args.entrypoint_args);

    if !args.metadata_entries.is_empty() {
        let mut metadata = toml::Table::new();
        for entry in &args.metadata_entries {
            let Some((key, value)) = entry.split_once('=') else {
                miette::bail!("invalid --metadata-entry '{entry}', expected KEY=VALUE[,VALUE...]");
            };
            let values: Vec<&str> = value.split(',').collect();
            let value = if values.len() == 1 {
                Value::String(values[0].to_owned())
            } else {
                Value::Array(values.into_iter().map(|v| Value::String(v.to_owned())).collect())
            };
            metadata.insert(key.to_owned(), value);
        }
        table.insert("metadata".to_owned(), Value::Table(metadata));
    }

    Ok(table)
}

async fn actual_main() -> miette::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_env_filter(args.verbose)),
        )
        .init();

    let cache_root = std::env::var_os("PYCHUB_CACHE_ROOT")
        .map(PathBuf::from)
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("pychub")));
    tracing::debug!(cache_root = ?cache_root, "resolved cache root");

    let mut extra_audit_sinks = Vec::new();
    for raw in &args.audit_logs {
        extra_audit_sinks.push(AuditSink::from_str(raw).map_err(|e| miette::miette!("{e}"))?);
    }

    let overlay = cli_overlay(&args)?;
    let options = BuildOptions {
        chubproject: args.chubproject,
        chubproject_save: args.chubproject_save,
        analyze_compatibility: args.analyze_compatibility,
        show_version: args.version,
        save_table_path: args.table,
        project_path: args.project_path,
        cache_root,
        index_base_url: args.index_url.map(|url| url.to_string()),
        cli_overlay: overlay,
        extra_audit_sinks,
    };

    run(options).await.map_err(|e| miette::miette!("{e}"))?;
    Ok(())
}

#[tokio::main]
async fn main() {
    match actual_main().await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("pychub: error: {e}");
            std::process::exit(1);
        }
    }
}

/// The default log filter when RUST_LOG is not set.
fn default_env_filter(verbose: bool) -> EnvFilter {
    let directive = if verbose {
        "pychub_packaging=debug"
    } else {
        "pychub_packaging=info"
    };
    EnvFilter::new("warn").add_directive(Directive::from_str(directive).expect("static directive"))
}
