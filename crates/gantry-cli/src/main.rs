mod commands;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;
use commands::build_images::BuildImagesOptions;
use commands::{GlobalOptions, EXIT_COMPILE_ERROR, EXIT_FAILURE, EXIT_MANIFEST_ERROR};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "gantry",
    version,
    about = "Builds container images and Kubernetes charts from BOSH-style releases"
)]
struct Cli {
    /// Work directory holding compilation output and scratch state.
    #[arg(long, default_value = "./output", global = true)]
    work_dir: PathBuf,

    /// Path to the role manifest.
    #[arg(short = 'm', long, default_value = "role-manifest.yml", global = true)]
    manifest: PathBuf,

    /// Path to a release directory; repeat for multiple releases.
    #[arg(short = 'r', long = "release", global = true)]
    releases: Vec<PathBuf>,

    /// Treat releases as dev releases with archives cached here by SHA-1.
    #[arg(long, global = true)]
    dev_cache_dir: Option<PathBuf>,

    /// Light opinions YAML (default overrides).
    #[arg(long, global = true)]
    light_opinions: Option<PathBuf>,

    /// Dark opinions YAML (property exclusions).
    #[arg(long, global = true)]
    dark_opinions: Option<PathBuf>,

    /// Image name prefix for generated images.
    #[arg(short = 'p', long, default_value = "gantry", global = true)]
    repository: String,

    /// Registry host prepended to image names.
    #[arg(long, default_value = "", global = true)]
    registry: String,

    /// Registry organization prepended to image names.
    #[arg(long, default_value = "", global = true)]
    organization: String,

    /// Container engine to use (docker or mock).
    #[arg(long, default_value = "docker", global = true)]
    engine: String,

    /// Number of compilation workers; defaults to the host CPU count.
    #[arg(short = 'w', long, global = true)]
    workers: Option<usize>,

    /// CSV metrics output file.
    #[arg(long, global = true)]
    metrics: Option<PathBuf>,

    /// Read-write package cache directory.
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// Treat the package cache as read-only.
    #[arg(long, default_value_t = false, global = true)]
    cache_read_only: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build artifacts from the loaded releases.
    Build {
        #[command(subcommand)]
        command: BuildCommands,
    },
    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum BuildCommands {
    /// Compile packages and build the packages layer and per-group images.
    Images(BuildImagesArgs),
}

#[derive(Debug, Args)]
struct BuildImagesArgs {
    /// Build only the named instance groups; comma separated.
    #[arg(long, value_delimiter = ',')]
    roles: Vec<String>,

    /// The stemcell image used as compilation environment and image base.
    #[arg(short = 's', long)]
    stemcell: String,

    /// Base OS type of the stemcell (ubuntu, sle).
    #[arg(long, default_value = "ubuntu")]
    stemcell_os: String,

    /// Additional information to use in computing the image tags.
    #[arg(long, default_value = "")]
    tag_extra: String,

    /// Proceed even when images already exist.
    #[arg(short = 'F', long, default_value_t = false)]
    force: bool,

    /// Create build contexts but do not build images.
    #[arg(short = 'N', long, default_value_t = false)]
    no_build: bool,

    /// Write tar files and deployment descriptors here instead of building
    /// with the container engine.
    #[arg(short = 'O', long)]
    output_directory: Option<PathBuf>,

    /// Additional label for the generated images. Format: label=value.
    #[arg(long = "add-label")]
    add_label: Vec<String>,

    /// Write the input dependency graph to this file as deterministic text.
    #[arg(long)]
    output_graph: Option<PathBuf>,

    /// Emit a helm-templated chart instead of concrete YAML.
    #[arg(long, default_value_t = false)]
    helm: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("GANTRY_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .init();

    let globals = GlobalOptions {
        work_dir: cli.work_dir.clone(),
        manifest: cli.manifest.clone(),
        releases: cli.releases.clone(),
        dev_cache_dir: cli.dev_cache_dir.clone(),
        light_opinions: cli.light_opinions.clone(),
        dark_opinions: cli.dark_opinions.clone(),
        repository: cli.repository.clone(),
        registry: cli.registry.clone(),
        organization: cli.organization.clone(),
        engine: cli.engine.clone(),
        workers: cli.workers,
        metrics: cli.metrics.clone(),
        cache_dir: cli.cache_dir.clone(),
        cache_read_only: cli.cache_read_only,
    };

    let result = match &cli.command {
        Commands::Build {
            command: BuildCommands::Images(args),
        } => {
            let labels = match commands::parse_labels(&args.add_label) {
                Ok(labels) => labels,
                Err(message) => {
                    eprintln!("error: {message}");
                    return ExitCode::from(EXIT_FAILURE);
                }
            };
            let options = BuildImagesOptions {
                roles: args.roles.clone(),
                stemcell: args.stemcell.clone(),
                stemcell_os: args.stemcell_os.clone(),
                tag_extra: args.tag_extra.clone(),
                force: args.force,
                no_build: args.no_build,
                output_directory: args.output_directory.clone(),
                labels,
                output_graph: args.output_graph.clone(),
                helm: args.helm,
            };
            commands::build_images::run(&globals, &options)
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(*shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(message) => {
            eprintln!("error: {message}");
            let code = if message.starts_with("error loading role manifest")
                || message.starts_with("error loading release")
            {
                EXIT_MANIFEST_ERROR
            } else if message.starts_with("compilation failed") {
                EXIT_COMPILE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
