//! KACE operator binary
//!
//! ```bash
//! # Consume newline-delimited JSON tasks from stdin
//! kace-operator -c kace.yaml worker < tasks.ndjson
//!
//! # Run one conversion for a hook payload
//! kace-operator -c kace.yaml convert --event merge.json
//!
//! # Deploy a tagged release
//! kace-operator -c kace.yaml deploy --event tag.json --kg-name climatekg --cpu 2 --memory 4Gi
//!
//! # Print a rendered manifest
//! kace-operator -c kace.yaml render --set fuseki --kind deployment --param target=climatekg
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kace_operator::cluster::{KubeClusterApi, ResourceKind};
use kace_operator::config::OperatorConfig;
use kace_operator::events::{DeploymentRequest, MergeEvent, TagEvent, DEFAULT_HDT_PATH};
use kace_operator::pipeline::Orchestrator;
use kace_operator::queue::{LocalTaskQueue, PipelineTask, TaskQueue};
use kace_operator::templates::{FileTemplateProvider, TemplateProvider};
use kube::Client;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// KACE Kubernetes artifacts creation engine
#[derive(Parser, Debug)]
#[command(name = "kace-operator")]
#[command(about = "Converts and serves versioned knowledge graphs on Kubernetes")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "KACE_CONFIG", default_value = "kace.yaml")]
    config: PathBuf,

    /// Override the configured namespace
    #[arg(long, env = "KACE_NAMESPACE")]
    namespace: Option<String>,

    /// Metrics server address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,

    /// Health check address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run queued tasks read as newline-delimited JSON from stdin
    Worker,
    /// Run the conversion workflow for one merge/commit event
    Convert {
        /// Hook payload file
        #[arg(long)]
        event: PathBuf,
    },
    /// Run the deployment workflow for one tag event
    Deploy {
        /// Hook payload file
        #[arg(long)]
        event: PathBuf,
        #[arg(long)]
        kg_name: String,
        #[arg(long)]
        cpu: String,
        #[arg(long)]
        memory: String,
        /// Repository directory holding the HDT files
        #[arg(long, default_value = DEFAULT_HDT_PATH)]
        hdt_path: String,
    },
    /// Print a rendered manifest
    Render {
        /// Server set (fuseki, federation, ldf)
        #[arg(long)]
        set: String,
        #[arg(long, value_enum)]
        kind: KindArg,
        /// Template parameter as key=value; repeatable
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
    },
    /// Validate configuration and templates
    Validate,
}

impl Command {
    /// Only the long-running worker exposes metrics and health endpoints
    fn binds_listeners(&self) -> bool {
        matches!(self, Command::Worker)
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Config,
    Service,
    Ingress,
    Deployment,
}

impl From<KindArg> for ResourceKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Config => ResourceKind::Config,
            KindArg::Service => ResourceKind::Service,
            KindArg::Ingress => ResourceKind::Ingress,
            KindArg::Deployment => ResourceKind::Deployment,
        }
    }
}

fn parse_param(raw: &str) -> std::result::Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .filter(|(k, _)| !k.is_empty())
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let mut config = OperatorConfig::from_file(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(namespace) = &args.namespace {
        config.kubernetes.namespace = namespace.clone();
        config.check().context("Invalid namespace override")?;
    }

    match &args.command {
        Command::Validate => return validate(&config),
        Command::Render { set, kind, params } => return render(&config, set, *kind, params),
        _ => {}
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        namespace = %config.kubernetes.namespace,
        "Starting KACE operator"
    );

    if args.command.binds_listeners() {
        let metrics_addr = args.metrics_addr;
        tokio::spawn(async move {
            if let Err(e) = start_metrics_server(metrics_addr).await {
                error!(error = %e, "Metrics server failed");
            }
        });

        let health_addr = args.health_addr;
        tokio::spawn(async move {
            if let Err(e) = start_health_server(health_addr).await {
                error!(error = %e, "Health server failed");
            }
        });
    }

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    let orchestrator = Orchestrator::from_config(&config, Arc::new(KubeClusterApi::new(client)))
        .context("Failed to initialise pipeline")?;

    match args.command {
        Command::Worker => run_worker(Arc::new(orchestrator), config.pipeline.workers).await,
        Command::Convert { event } => {
            let event: MergeEvent = read_json(&event)?;
            let release = orchestrator.run_conversion(&event).await.into_result()?;
            println!("{}", serde_json::to_string_pretty(&release)?);
            Ok(())
        }
        Command::Deploy {
            event,
            kg_name,
            cpu,
            memory,
            hdt_path,
        } => {
            let event: TagEvent = read_json(&event)?;
            let mut request = DeploymentRequest::new(event, kg_name, cpu, memory);
            request.hdt_path = hdt_path;
            let summary = orchestrator.run_deployment(&request).await.into_result()?;
            println!("{}", summary.access_url);
            Ok(())
        }
        Command::Validate | Command::Render { .. } => Ok(()),
    }
}

/// Initialize logging subsystem
fn init_logging(args: &Args) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid event in {}", path.display()))
}

async fn run_worker(orchestrator: Arc<Orchestrator>, workers: usize) -> Result<()> {
    let queue = LocalTaskQueue::start(orchestrator, workers);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read task stream")? else {
                    info!("Task stream closed");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<PipelineTask>(&line) {
                    Ok(task) => queue.enqueue(task).await?,
                    Err(e) => warn!(error = %e, "Skipping malformed task"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    queue.shutdown().await;
    Ok(())
}

fn validate(config: &OperatorConfig) -> Result<()> {
    use kace_operator::jobs::JobTemplateRegistry;
    use kace_operator::reconciler::{FEDERATION_SET, FUSEKI_SET, LDF_SET};

    let mut problems = Vec::new();
    for set in [FUSEKI_SET, FEDERATION_SET, LDF_SET] {
        match FileTemplateProvider::load(config.set_templates_dir(set)) {
            Ok(provider) => {
                for kind in ResourceKind::ALL {
                    if !provider.has_template(kind.template_name()) {
                        problems.push(format!("{set}: missing {} template", kind.template_name()));
                    }
                }
            }
            Err(e) => problems.push(format!("{set}: {e}")),
        }
    }

    match JobTemplateRegistry::load(
        &config.kubernetes.job_templates,
        &config.kubernetes.local_pvc_name,
    ) {
        Ok(registry) => {
            for job_type in ["hdt-job", "doc-job", "spider-job"] {
                if registry.template(job_type).is_none() {
                    problems.push(format!("jobs: missing {job_type}"));
                }
            }
        }
        Err(e) => problems.push(format!("jobs: {e}")),
    }

    if !config.spider.is_configured() {
        warn!("Notarization endpoint not configured; deployments will skip it");
    }

    if problems.is_empty() {
        println!("Configuration is valid");
        Ok(())
    } else {
        for problem in &problems {
            eprintln!("  - {problem}");
        }
        bail!("{} configuration problem(s)", problems.len())
    }
}

fn render(
    config: &OperatorConfig,
    set: &str,
    kind: KindArg,
    params: &[(String, String)],
) -> Result<()> {
    let provider = FileTemplateProvider::load(config.set_templates_dir(set))?;
    let mut parameters = BTreeMap::from([
        ("namespace".to_string(), config.kubernetes.namespace.clone()),
        ("host_name".to_string(), config.serving.host_name.clone()),
        ("pvc_name".to_string(), config.kubernetes.shared_pvc_name.clone()),
    ]);
    parameters.extend(params.iter().cloned());
    if let Some(target) = parameters.get("target").cloned() {
        parameters
            .entry("name".to_string())
            .or_insert_with(|| format!("{set}-{target}"));
    }

    let kind = ResourceKind::from(kind);
    let manifest = provider.render(kind.template_name(), &parameters)?;
    print!("{}", serde_yaml::to_string(&manifest)?);
    Ok(())
}

/// Start the Prometheus metrics server
async fn start_metrics_server(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    info!(address = %addr, "Starting metrics server");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    std::future::pending::<()>().await;

    Ok(())
}

/// Start the health check server
async fn start_health_server(addr: SocketAddr) -> Result<()> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    info!(address = %addr, "Starting health server");

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind health server")?;

    loop {
        let (mut socket, _) = listener.accept().await?;

        tokio::spawn(async move {
            let mut buf = [0; 1024];
            if socket.read(&mut buf).await.is_ok() {
                let response = "HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nOK";
                let _ = socket.write_all(response.as_bytes()).await;
            }
        });
    }
}
