use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use kview_api::{pair, Backend, BridgeClient, BridgeConfig, KubeConnector};
use kview_core::{ChangeType, ResourceKind, Signal, TrackedObject};
use kview_store::ClusterView;
use tokio::signal;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "kviewctl", version, about = "kview CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace
    #[arg(long = "ns", global = true, default_value = "default")]
    namespace: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// List namespaces
    Namespaces,
    /// List objects of a kind once the watcher has synced
    Ls {
        /// pod, service, deployment or namespace (aliases accepted)
        kind: String,
    },
    /// Watch a kind and print +/~/- events until Ctrl-C
    Watch {
        kind: String,
    },
    /// Delete one object
    Delete {
        kind: String,
        name: String,
    },
    /// Set a deployment's replica count
    Scale {
        name: String,
        #[arg(allow_negative_numbers = true)]
        replicas: i64,
    },
}

fn init_tracing() {
    let env = std::env::var("KVIEW_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KVIEW_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid KVIEW_METRICS_ADDR; expected host:port");
        }
    }
}

fn render_age(creation_ts: i64) -> String {
    if creation_ts <= 0 { return "-".to_string(); }
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default().as_secs() as i64;
    let mut secs = (now - creation_ts).max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

fn print_table(items: &[TrackedObject]) {
    println!("{:<20} {:<40} AGE", "NAMESPACE", "NAME");
    for item in items {
        let ns_col = item.namespace.as_deref().unwrap_or("-");
        println!("{:<20} {:<40} {}", ns_col, item.name, render_age(item.creation_ts));
    }
}

fn parse_kind(s: &str) -> Result<ResourceKind> {
    ResourceKind::from_str(s).with_context(|| format!("unsupported kind {:?}", s))
}

/// Wait for the first `connected` (true) or `error` (false) signal.
async fn wait_synced(signals: &mut tokio::sync::mpsc::Receiver<Signal>, kind: ResourceKind, wait: Duration) -> Result<()> {
    let deadline = Instant::now() + wait;
    loop {
        let now = Instant::now();
        if now >= deadline { bail!("{} watcher did not connect within {}s", kind, wait.as_secs()); }
        match tokio::time::timeout(deadline - now, signals.recv()).await {
            Ok(Some(Signal::Connected { kind: k })) if k == kind => return Ok(()),
            Ok(Some(Signal::Error(notice))) => bail!("watch failed: {}", notice.message),
            Ok(Some(_)) => continue,
            Ok(None) => bail!("bridge closed"),
            Err(_) => continue,
        }
    }
}

async fn connect(config: &BridgeConfig) -> Result<BridgeClient> {
    let (client, endpoint) = pair(config);
    Backend::new(Arc::new(KubeConnector), config.clone()).spawn(endpoint);
    if !client.initialize().await {
        bail!("could not reach the cluster; check your kubeconfig (see logs with KVIEW_LOG=debug)");
    }
    Ok(client)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = BridgeConfig::from_env();
    let client = connect(&config).await?;
    let ns = cli.namespace.as_str();

    match cli.command {
        Commands::Namespaces => {
            let items = client.list_namespaces().await?;
            let mut view = ClusterView::new(ns);
            view.seed_namespaces(&items);
            match cli.output {
                Output::Human => {
                    for name in view.namespaces() { println!("{}", name); }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(view.namespaces())?),
            }
        }
        Commands::Ls { kind } => {
            let kind = parse_kind(&kind)?;
            info!(kind = %kind, ns = %ns, "ls invoked");
            let wait_secs = std::env::var("KVIEW_WAIT_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(8);
            let mut signals = client.subscribe_all();
            client.register_watcher(kind, Some(ns)).await?;
            wait_synced(&mut signals, kind, Duration::from_secs(wait_secs)).await?;
            drop(signals);
            let items = client.list_watched(kind).await?;
            match cli.output {
                Output::Human => print_table(&items),
                Output::Json => println!("{}", serde_json::to_string_pretty(&items)?),
            }
        }
        Commands::Watch { kind } => {
            let kind = parse_kind(&kind)?;
            info!(kind = %kind, ns = %ns, "watch invoked");
            let mut view = ClusterView::new(ns);
            let mut signals = client.subscribe_all();
            client.register_watcher(kind, Some(ns)).await?;
            loop {
                tokio::select! {
                    maybe = signals.recv() => {
                        let Some(sig) = maybe else {
                            warn!("signal stream closed; exiting watch loop");
                            break;
                        };
                        let before = view.status().clone();
                        view.handle_signal(&sig);
                        match cli.output {
                            Output::Json => println!("{}", serde_json::to_string(&sig)?),
                            Output::Human => match &sig {
                                Signal::ObjectChanged(ev) => {
                                    let mark = match ev.change_type {
                                        ChangeType::Added => '+',
                                        ChangeType::Modified => '~',
                                        ChangeType::Deleted => '-',
                                    };
                                    println!("{} {}", mark, ev.object.display_name());
                                }
                                _ if view.status() != &before => eprintln!("[{}]", view.status().message),
                                _ => {}
                            },
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
            if let Some(snap) = view.snapshot(kind) {
                info!(kind = %kind, items = snap.len(), "final snapshot");
            }
        }
        Commands::Delete { kind, name } => {
            let kind = parse_kind(&kind)?;
            let namespace = if kind.namespaced() { Some(ns) } else { None };
            let deleted = client.delete_object(kind, namespace, &name).await?;
            match cli.output {
                Output::Human => println!("{} {} deleted", kind, name),
                Output::Json => println!("{}", serde_json::to_string_pretty(&deleted)?),
            }
        }
        Commands::Scale { name, replicas } => {
            let ok = client.scale_deployment(ns, &name, replicas).await?;
            match cli.output {
                Output::Human => println!("deployment {}/{} scaled to {}", ns, name, replicas),
                Output::Json => println!("{}", serde_json::json!({ "scaled": ok, "replicas": replicas })),
            }
        }
    }

    if let Err(e) = client.shutdown().await {
        warn!(error = %e, "shutdown failed");
    }
    Ok(())
}
