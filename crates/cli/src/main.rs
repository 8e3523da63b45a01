//! placementctl (Milestone 0): computes the per-destination plan of a static
//! placement file and reconciles it against clusters.

#![forbid(unsafe_code)]

mod plan;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use placement_binder::{ApiMapProvider, SetBinder};
use placement_core::config::EngineConfig;
use placement_core::modes::ResourceModes;
use placement_core::runnable::{run_all, Runnable};
use placement_kubehub::{ClusterClients, KubeApiMapProvider, KubeMaterializer, KubeSourceWatcher};
use placement_projector::{
    object_channel, Applied, Materializer, NullWatcher, ObjectEvents, Projector, RecordingMaterializer, SourceWatcher,
    SyncerConfigSpec,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::plan::Plan;

#[derive(Parser, Debug)]
#[command(name = "placementctl", version, about = "Placement translator (M0)")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the sync configuration every destination would get
    Plan {
        /// Placement file (YAML or JSON)
        #[arg(long = "plan", env = "PLACEMENT_PLAN")]
        plan: PathBuf,
    },
    /// Reconcile the plan until interrupted
    Run {
        /// Placement file (YAML or JSON)
        #[arg(long = "plan", env = "PLACEMENT_PLAN")]
        plan: PathBuf,
        /// Record intended writes instead of talking to clusters
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
        /// Kubeconfig contexts to use, one per cluster (default: all)
        #[arg(long = "context")]
        contexts: Vec<String>,
        /// Seconds between discovery rounds
        #[arg(long = "discovery-interval", default_value_t = 30)]
        discovery_interval: u64,
    },
}

fn init_tracing() {
    let env = std::env::var("PLACEMENT_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PLACEMENT_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid PLACEMENT_METRICS_ADDR; expected host:port");
        }
    }
}

fn feed(binder: &SetBinder, plan: &Plan) {
    for p in &plan.placements {
        binder.put_what(p.external_name(), p.resolved_what());
        binder.put_where(p.external_name(), p.resolved_where());
    }
    info!(placements = plan.placements.len(), "plan loaded");
}

fn render_configs(configs: &BTreeMap<placement_core::SinglePlacement, SyncerConfigSpec>) -> String {
    let mut out = String::new();
    for (dest, spec) in configs {
        out.push_str(&format!("{} • mailbox {}\n", dest, dest.mailbox_name()));
        if !spec.namespace_scope.namespaces.is_empty() {
            out.push_str(&format!("  namespaces: {}\n", spec.namespace_scope.namespaces.join(", ")));
        }
        for objs in &spec.namespaced_objects {
            let r = &objs.resource;
            for by_ns in &objs.objects_by_namespace {
                for name in &by_ns.names {
                    out.push_str(&format!("  {} {} • {}/{}\n", gr_label(&r.group, &r.resource), r.version, by_ns.namespace, name));
                }
            }
        }
        for objs in &spec.cluster_scope {
            let r = &objs.resource;
            for name in &objs.objects {
                out.push_str(&format!("  {} {} • {}\n", gr_label(&r.group, &r.resource), r.version, name));
            }
        }
        for u in &spec.upsync {
            out.push_str(&format!(
                "  upsync {} • resources [{}] namespaces [{}] names [{}]\n",
                if u.api_group.is_empty() { "core" } else { u.api_group.as_str() },
                u.resources.join(","),
                u.namespaces.join(","),
                u.names.join(",")
            ));
        }
    }
    out
}

fn gr_label(group: &str, resource: &str) -> String {
    if group.is_empty() { resource.to_string() } else { format!("{resource}.{group}") }
}

fn render_applied(applied: &[Applied]) -> String {
    let mut out = String::new();
    for a in applied {
        let line = match a {
            Applied::SyncConfig { dest, spec } if spec.is_empty() => format!("clear sync config • {}", dest.mailbox_name()),
            Applied::SyncConfig { dest, .. } => format!("apply sync config • {}", dest.mailbox_name()),
            Applied::Upsert { object, api_version, .. } => format!(
                "upsert {} {} • {}/{} → {}",
                object.group_resource,
                api_version,
                object.namespace,
                object.name,
                object.dest.mailbox_name()
            ),
            Applied::Delete { object, .. } => format!(
                "delete {} • {}/{} → {}",
                object.group_resource,
                object.namespace,
                object.name,
                object.dest.mailbox_name()
            ),
        };
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn print_configs(configs: &BTreeMap<placement_core::SinglePlacement, SyncerConfigSpec>, output: Output) -> Result<()> {
    match output {
        Output::Human => print!("{}", render_configs(configs)),
        Output::Json => {
            let by_mailbox: BTreeMap<String, &SyncerConfigSpec> =
                configs.iter().map(|(d, s)| (d.mailbox_name(), s)).collect();
            println!("{}", serde_json::to_string_pretty(&by_mailbox)?);
        }
    }
    Ok(())
}

async fn cmd_plan(plan: &Plan, cfg: &EngineConfig, output: Output) -> Result<()> {
    let provider = Arc::new(plan.provider());
    let (_notifier, events) = object_channel();
    let projector = Projector::new(cfg, Arc::new(RecordingMaterializer::new()), Arc::new(NullWatcher), events);
    let binder = SetBinder::new(provider.clone(), projector.clone(), ResourceModes::builtin(), cfg);
    feed(&binder, plan);
    while provider.deliver_pending() + binder.process_discovery() > 0 {}
    print_configs(&projector.syncer_configs(), output)
}

async fn serve<P>(
    plan: &Plan,
    cfg: &EngineConfig,
    provider: Arc<P>,
    materializer: Arc<dyn Materializer>,
    watcher: Arc<dyn SourceWatcher>,
    events: ObjectEvents,
) -> Arc<Projector>
where
    P: ApiMapProvider + Runnable + 'static,
{
    let projector = Projector::new(cfg, materializer, watcher, events);
    let binder = SetBinder::new(provider.clone(), projector.clone(), ResourceModes::builtin(), cfg);
    feed(&binder, plan);
    let ctx = CancellationToken::new();
    tokio::spawn({
        let ctx = ctx.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("interrupt received; shutting down");
            }
            ctx.cancel();
        }
    });
    let components: Vec<Arc<dyn Runnable>> = vec![provider, binder, projector.clone()];
    run_all(components, ctx).await;
    let stats = projector.stats();
    info!(
        namespaced = stats.namespaced_distributions,
        cluster_scoped = stats.cluster_scoped_distributions,
        modes = stats.modes,
        upsyncs = stats.upsyncs,
        "reconciler stopped"
    );
    projector
}

async fn cmd_run(
    plan: &Plan,
    cfg: &EngineConfig,
    dry_run: bool,
    contexts: &[String],
    discovery_interval: Duration,
    output: Output,
) -> Result<()> {
    let (notifier, events) = object_channel();
    if dry_run {
        let recorder = Arc::new(RecordingMaterializer::new());
        serve(plan, cfg, Arc::new(plan.provider()), recorder.clone(), Arc::new(NullWatcher), events).await;
        let applied = recorder.take();
        match output {
            Output::Human => print!("{}", render_applied(&applied)),
            Output::Json => println!("{}", serde_json::to_string_pretty(&applied)?),
        }
        return Ok(());
    }
    let clients = Arc::new(ClusterClients::from_kubeconfig_contexts(contexts).await?);
    let served = clients.names();
    for name in plan.cluster_names() {
        if !served.contains(&name) {
            warn!(cluster = %name, "plan names a cluster without a kubeconfig context");
        }
    }
    let provider = Arc::new(KubeApiMapProvider::new(clients.clone(), discovery_interval));
    let materializer = Arc::new(KubeMaterializer::new(clients.clone(), cfg.include_system_objects));
    let watcher = Arc::new(KubeSourceWatcher::new(clients, notifier));
    let projector = serve(plan, cfg, provider, materializer, watcher, events).await;
    if output == Output::Json {
        println!("{}", serde_json::to_string_pretty(&projector.stats())?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let cfg = EngineConfig::from_env();
    cfg.validate().context("engine configuration")?;

    match cli.command {
        Commands::Plan { plan } => {
            let plan = Plan::load(&plan)?;
            cmd_plan(&plan, &cfg, cli.output).await
        }
        Commands::Run { plan, dry_run, contexts, discovery_interval } => {
            let plan = Plan::load(&plan)?;
            info!(dry_run, workers = cfg.workers, "starting reconciler");
            cmd_run(&plan, &cfg, dry_run, &contexts, Duration::from_secs(discovery_interval.max(1)), cli.output).await
        }
    }
}
