use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use ferry_core::InstanceDir;
use ferry_health::{DEFAULT_DELETE_TIMEOUT, DEFAULT_READY_TIMEOUT, DEFAULT_ROLLOUT_TIMEOUT};
use ferry_kubehub::Connection;
use ferry_ops::{
    check_cluster, cluster_status, ImageRef, ImageReport, ImageTarget, Lifecycle, UpdateOutcome, WaitOptions,
    DEFAULT_IMAGE_CONTAINER, DEFAULT_IMAGE_DEPLOYMENT,
};
use serde::Serialize;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "ferryctl", version, about = "Bring application instances up and down on Kubernetes")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubeconfig to use instead of in-cluster or default discovery
    #[arg(long, global = true, env = "FERRY_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Instance directory; its name determines the namespace
    #[arg(long, global = true, env = "FERRY_DIR", default_value = ".")]
    dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct WaitArgs {
    /// Return as soon as the cluster accepted the change
    #[arg(long)]
    no_wait: bool,
    /// Give up waiting after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,
}

impl WaitArgs {
    fn options(&self, default: Duration, output: Output) -> WaitOptions {
        let timeout = self.timeout.map(Duration::from_secs).unwrap_or(default);
        let w = WaitOptions::new(timeout).with_progress(output == Output::Human);
        if self.no_wait { w.no_wait() } else { w }
    }
}

#[derive(Args, Debug, Clone)]
struct ImageArgs {
    /// Registry host (and optional path prefix)
    registry: String,
    tag: String,
    /// Repository under the registry (default: container name)
    #[arg(long)]
    repository: Option<String>,
    #[arg(long, default_value = DEFAULT_IMAGE_DEPLOYMENT)]
    deployment: String,
    #[arg(long, default_value = DEFAULT_IMAGE_CONTAINER)]
    container: String,
    #[command(flatten)]
    wait: WaitArgs,
}

impl ImageArgs {
    fn target(&self) -> ImageTarget {
        ImageTarget { deployment: self.deployment.clone(), container: self.container.clone() }
    }

    fn image(&self) -> ImageRef {
        let repo = self.repository.clone().unwrap_or_else(|| self.container.clone());
        ImageRef::new(self.registry.clone(), repo, self.tag.clone())
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the namespace, restore the TLS secret and apply the stack
    Start {
        #[command(flatten)]
        wait: WaitArgs,
        #[arg(long)]
        dry_run: bool,
    },
    /// Back up the TLS secret and delete the namespace
    Stop {
        #[command(flatten)]
        wait: WaitArgs,
    },
    /// Re-apply the stack if the namespace is active
    Update {
        #[command(flatten)]
        wait: WaitArgs,
        #[arg(long)]
        dry_run: bool,
    },
    /// Re-apply one service's deployment manifest
    Scale {
        /// Service name; reads stack/<service>-deployment.yaml
        service: String,
        #[command(flatten)]
        wait: WaitArgs,
        #[arg(long)]
        dry_run: bool,
    },
    /// Point the application container at a new image
    UpdateImage(ImageArgs),
    /// Point the application container back at an earlier image
    Revert(ImageArgs),
    /// Pod readiness of the instance namespace
    Status,
    /// Node readiness across the cluster
    ClusterStatus,
}

fn init_tracing() {
    let env = std::env::var("FERRY_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("FERRY_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid FERRY_METRICS_ADDR; expected host:port");
        }
    }
}

fn emit<T: Serialize>(output: Output, value: &T, human: impl FnOnce(&T)) -> Result<()> {
    match output {
        Output::Human => human(value),
        Output::Json => println!("{}", serde_json::to_string_pretty(value)?),
    }
    Ok(())
}

fn print_image(verb: &str, r: &ImageReport) {
    println!(
        "{} {}/{}: {} -> {}",
        verb,
        r.deployment,
        r.container,
        r.previous.as_deref().unwrap_or("<none>"),
        r.image
    );
    if let Some(status) = &r.rollout {
        println!("rollout complete: {}", status);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let out = cli.output;

    let conn = Connection::connect(cli.kubeconfig.as_deref()).await?;
    info!(source = ?conn.source(), "cluster credentials resolved");

    if let Commands::ClusterStatus = cli.command {
        let report = cluster_status(&conn).await?;
        println!("{}", report.summary_line());
        emit(out, &report, |r| println!("{}", r))?;
        check_cluster(&report)?;
        return Ok(());
    }

    let instance = InstanceDir::open(&cli.dir)?;
    info!(dir = %instance.root().display(), namespace = %instance.namespace(), "instance");

    match cli.command {
        Commands::Start { wait, dry_run } => {
            let report = Lifecycle::new(&conn, &instance)
                .dry_run(dry_run)
                .start(&wait.options(DEFAULT_READY_TIMEOUT, out))
                .await?;
            emit(out, &report, |r| {
                println!("started {}: {} applied, {} failed", r.namespace, r.stack.applied.len(), r.stack.failed.len());
                for (path, reason) in &r.stack.failed {
                    println!("  failed {}: {}", path.display(), reason);
                }
                if let Some(h) = &r.health {
                    println!("{}", h);
                }
            })?;
        }
        Commands::Stop { wait } => {
            let report = Lifecycle::new(&conn, &instance).stop(&wait.options(DEFAULT_DELETE_TIMEOUT, out)).await?;
            emit(out, &report, |r| {
                match &r.backed_up {
                    Some(p) => println!("saved TLS secret to {}", p.display()),
                    None => println!("no TLS secret saved"),
                }
                let what = if r.deleted { "deleted" } else { "already absent" };
                println!("namespace {} {}", r.namespace, what);
            })?;
        }
        Commands::Update { wait, dry_run } => {
            let outcome = Lifecycle::new(&conn, &instance)
                .dry_run(dry_run)
                .update(&wait.options(DEFAULT_READY_TIMEOUT, out))
                .await?;
            emit(out, &outcome, |o| match o {
                UpdateOutcome::Skipped { namespace, phase } => {
                    println!("namespace {} is {}; nothing applied", namespace, phase.as_deref().unwrap_or("absent"))
                }
                UpdateOutcome::Applied { namespace, stack, health } => {
                    println!("updated {}: {} applied, {} failed", namespace, stack.applied.len(), stack.failed.len());
                    for (path, reason) in &stack.failed {
                        println!("  failed {}: {}", path.display(), reason);
                    }
                    if let Some(h) = health {
                        println!("{}", h);
                    }
                }
            })?;
        }
        Commands::Scale { service, wait, dry_run } => {
            let report = Lifecycle::new(&conn, &instance)
                .dry_run(dry_run)
                .scale(&service, &wait.options(DEFAULT_ROLLOUT_TIMEOUT, out))
                .await?;
            emit(out, &report, |r| {
                println!("applied {}/{} from {}", r.applied.kind, r.applied.name, r.manifest.display());
                if let Some(status) = &r.rollout {
                    println!("rollout complete: {}", status);
                }
            })?;
        }
        Commands::UpdateImage(args) => {
            let report = Lifecycle::new(&conn, &instance)
                .update_image(&args.target(), &args.image(), &args.wait.options(DEFAULT_ROLLOUT_TIMEOUT, out))
                .await?;
            emit(out, &report, |r| print_image("updated", r))?;
        }
        Commands::Revert(args) => {
            let report = Lifecycle::new(&conn, &instance)
                .revert_image(&args.target(), &args.image(), &args.wait.options(DEFAULT_ROLLOUT_TIMEOUT, out))
                .await?;
            emit(out, &report, |r| print_image("reverted", r))?;
        }
        Commands::Status => {
            let snap = Lifecycle::new(&conn, &instance).status().await?;
            emit(out, &snap, |s| println!("{}", s))?;
        }
        Commands::ClusterStatus => {}
    }
    Ok(())
}
