//! depot - serve and push Nix, NPM and Python packages.

use clap::{Parser, Subcommand};
use lloggs::LoggingArgs;

mod nixcmd;
mod npm;
mod proxy;
mod push;
mod python;
mod serve;
mod sshkeys;

#[derive(Parser)]
#[command(name = "depot")]
#[command(about = "Serve Nix, NPM, and Python packages")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[command(flatten)]
    logging: LoggingArgs,
}

#[derive(Subcommand)]
enum Command {
    /// Start the depot server
    Serve(serve::ServeArgs),
    /// Proxy requests to a remote depot with authentication
    Proxy(ProxyArgs),
    /// Nix package management commands
    Nix {
        #[command(subcommand)]
        command: NixCommand,
    },
    /// NPM package management commands
    Npm {
        #[command(subcommand)]
        command: NpmCommand,
    },
    /// Python package management commands
    Python {
        #[command(subcommand)]
        command: PythonCommand,
    },
}

#[derive(clap::Args)]
struct ProxyArgs {
    /// Target cache URL to proxy to
    target: String,

    /// Port to listen on (0 for a random port)
    #[arg(long, default_value_t = 43407, env = "DEPOT_PROXY_PORT")]
    port: u16,
}

#[derive(Subcommand)]
enum NixCommand {
    /// Push Nix store paths and flake references to a remote depot
    Push {
        /// Target cache URL to push to
        target: String,

        /// Flake references to push
        #[arg(long = "flake-refs", num_args = 1..)]
        flake_refs: Vec<String>,

        /// Store paths to push
        #[arg(long = "store-paths", num_args = 1..)]
        store_paths: Vec<String>,

        /// Read store paths and flake references from stdin
        #[arg(long)]
        stdin: bool,
    },
}

#[derive(Subcommand)]
enum NpmCommand {
    /// Save NPM packages to a local store
    Save {
        /// Package names (format: package@version or ./path/to/package-lock.json)
        #[arg(default_value = "./package-lock.json")]
        packages: Vec<String>,

        /// Directory to save packages to
        #[arg(long, default_value = ".depot-storage/npm", env = "DEPOT_NPM_DIR")]
        dir: String,

        /// Read the package list from stdin
        #[arg(long)]
        stdin: bool,
    },
    /// Push NPM packages to a remote depot
    Push {
        /// Target depot URL to push to
        target: String,

        /// Directory containing NPM packages to push
        #[arg(long, default_value = ".depot-storage/npm", env = "DEPOT_NPM_DIR")]
        dir: String,

        /// JWT authentication token
        #[arg(long, env = "DEPOT_AUTH_TOKEN")]
        token: Option<String>,
    },
}

#[derive(Subcommand)]
enum PythonCommand {
    /// Save Python packages to a local store
    Save {
        /// Package specs (format: package==version)
        packages: Vec<String>,

        /// Directory to save packages to
        #[arg(long, default_value = ".depot-storage/python", env = "DEPOT_PYTHON_DIR")]
        dir: String,

        /// Read the package list from stdin
        #[arg(long)]
        stdin: bool,
    },
    /// Push Python packages to a remote depot
    Push {
        /// Target depot URL to push to
        target: String,

        /// Directory containing Python packages to push
        #[arg(long, default_value = ".depot-storage/python", env = "DEPOT_PYTHON_DIR")]
        dir: String,

        /// JWT authentication token
        #[arg(long, env = "DEPOT_AUTH_TOKEN")]
        token: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let _guard = cli.logging.setup(|v| match v {
        0 => "info",
        1 => "debug",
        _ => "trace",
    })?;

    match cli.command {
        Command::Serve(args) => serve::run(args).await,
        Command::Proxy(args) => proxy::run(&args.target, args.port).await,
        Command::Nix { command } => match command {
            NixCommand::Push {
                target,
                flake_refs,
                store_paths,
                stdin,
            } => {
                let pusher = push::Pusher::new(target);
                if stdin {
                    return pusher.push_from_stdin().await;
                }
                if flake_refs.is_empty() && store_paths.is_empty() {
                    return Err("no store paths or flake references specified".into());
                }
                for flake_ref in &flake_refs {
                    pusher.push_flake_reference(flake_ref).await?;
                }
                pusher.push_store_paths(&store_paths).await
            }
        },
        Command::Npm { command } => match command {
            NpmCommand::Save { packages, dir, stdin } => npm::save::run(&packages, &dir, stdin).await,
            NpmCommand::Push { target, dir, token } => npm::push::run(&target, &dir, token).await,
        },
        Command::Python { command } => match command {
            PythonCommand::Save { packages, dir, stdin } => python::save::run(&packages, &dir, stdin).await,
            PythonCommand::Push { target, dir, token } => python::push::run(&target, &dir, token).await,
        },
    }
}
