use std::path::{Path, PathBuf};

use color_eyre::eyre::{bail, eyre};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use beamo_core::models::{DeployEvent, ServiceStateChange};
use beamo_core::services::config_loader;
use beamo_core::BeamoSystem;

const USAGE: &str = "usage: beamo [--debug] [--json] <command>

commands:
  ps                 list services and their containers
  sync               reconcile local state with the docker daemon
  deploy [ids...]    build and run services (all when no ids are given)
  push <id>          upload a service image to the registry
  stop <id>          stop a service's containers
  clean <id>         remove a service's containers and image
  listen             follow container events until ctrl-c";

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let debug = args.iter().any(|a| a == "--debug");
    let json = args.iter().any(|a| a == "--json");
    let positional: Vec<&str> = args
        .iter()
        .filter(|a| !a.starts_with("--"))
        .map(String::as_str)
        .collect();
    let Some((&command, rest)) = positional.split_first() else {
        println!("{USAGE}");
        return Ok(());
    };

    let state_directory = find_state_directory();
    std::fs::create_dir_all(&state_directory)?;
    let _guard = setup_logging(&state_directory, debug);

    let config = config_loader::load(&state_directory)?;
    let system = BeamoSystem::with_docker(&state_directory, config);
    system.load_state().await?;
    tracing::debug!(state = %state_directory.display(), command, "starting");

    match (command, rest) {
        ("ps", []) => ps(&system, json).await,
        ("sync", []) => Ok(system.synchronize().await?),
        ("deploy", ids) => deploy(&system, ids).await,
        ("push", [id]) => push(&system, id).await,
        ("stop", [id]) => Ok(system.stop_service(id).await?),
        ("clean", [id]) => Ok(system.clean_up(id).await?),
        ("listen", []) => listen(&system).await,
        _ => bail!("unrecognized command line\n\n{USAGE}"),
    }
}

/// Logs go to stderr. With `--debug`, everything at debug level also goes to
/// `beamo-debug.log` in the state directory; the returned guard flushes it on exit.
fn setup_logging(state_directory: &Path, debug: bool) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{fmt, EnvFilter, Layer};

    let stderr = fmt::layer().with_writer(std::io::stderr).with_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    );

    if debug {
        let file_appender = tracing_appender::rolling::never(state_directory, "beamo-debug.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file = fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(EnvFilter::new("debug"));
        tracing_subscriber::registry().with(stderr).with(file).init();
        Some(guard)
    } else {
        tracing_subscriber::registry().with(stderr).init();
        None
    }
}

async fn ps(system: &BeamoSystem, json: bool) -> color_eyre::Result<()> {
    system.synchronize().await?;
    let manifest = system.get_manifest().await;
    let runtime = system.get_runtime().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&runtime)?);
        return Ok(());
    }

    for definition in &manifest.service_definitions {
        let instances = runtime.instances_for(&definition.beamo_id);
        let status = if runtime.is_service_running(&definition.beamo_id) {
            "running"
        } else if instances.is_empty() {
            "absent"
        } else {
            "stopped"
        };
        println!(
            "{:<24} {:<16} {:<12} {}",
            definition.beamo_id,
            format!("{:?}", definition.protocol),
            status,
            definition.truncated_image_id()
        );
        for instance in instances {
            let ports: Vec<String> = instance
                .active_port_bindings
                .iter()
                .map(|p| format!("{}->{}", p.local_port, p.in_container_port))
                .collect();
            println!(
                "  {} {} {}",
                instance.container_id.get(..12).unwrap_or(&instance.container_id),
                instance.container_name,
                ports.join(",")
            );
        }
    }
    Ok(())
}

/// Cancels `token` on the first ctrl-c.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("cancelling...");
            token.cancel();
        }
    });
}

async fn deploy(system: &BeamoSystem, ids: &[&str]) -> color_eyre::Result<()> {
    let targets: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
    let targets = (!targets.is_empty()).then_some(targets);

    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            match event {
                DeployEvent::ImageProgress { beamo_id, progress } => {
                    eprintln!("{beamo_id}: image {:>3.0}%", progress * 100.0);
                }
                DeployEvent::ServiceDeployed { beamo_id } => println!("{beamo_id}: deployed"),
            }
        }
    });

    let result = system.deploy(targets.as_deref(), &cancel, Some(&tx)).await;
    drop(tx);
    let _ = printer.await;
    Ok(result?)
}

async fn push(system: &BeamoSystem, beamo_id: &str) -> color_eyre::Result<()> {
    if system.config().registry_url.is_empty() {
        return Err(eyre!("registry_url is not configured"));
    }
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    let (tx, mut rx) = mpsc::unbounded_channel::<f32>();
    let printer = tokio::spawn(async move {
        while let Some(progress) = rx.recv().await {
            eprint!("\rupload {:>3.0}%", progress * 100.0);
        }
        eprintln!();
    });

    let result = system.upload(beamo_id, &cancel, Some(tx)).await;
    let _ = printer.await;
    let report = result?;
    println!(
        "{}: pushed {} layers ({} already in registry)",
        report.beamo_id,
        report.layers.len(),
        report.skipped_blobs.len()
    );
    Ok(())
}

async fn listen(system: &BeamoSystem) -> color_eyre::Result<()> {
    system.synchronize().await?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    system.start_listening(Some(tx)).await?;
    println!("listening for container events, ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            change = rx.recv() => match change {
                Some(ServiceStateChange::SubscriptionEnded) => {
                    eprintln!("docker event stream ended");
                    break;
                }
                Some(change) => print_change(&change),
                None => break,
            },
        }
    }

    system.stop_listening().await;
    system.save_state().await?;
    Ok(())
}

fn print_change(change: &ServiceStateChange) {
    let (verb, beamo_id, container_id) = match change {
        ServiceStateChange::Created { beamo_id, container_id } => ("created", beamo_id, container_id),
        ServiceStateChange::Started { beamo_id, container_id } => ("started", beamo_id, container_id),
        ServiceStateChange::Stopped { beamo_id, container_id } => ("stopped", beamo_id, container_id),
        ServiceStateChange::Removed { beamo_id, container_id } => ("removed", beamo_id, container_id),
        ServiceStateChange::SubscriptionEnded => return,
    };
    println!("{beamo_id}: {verb} {container_id}");
}

/// Walk up from the current directory looking for `.beamable`. Stops at the repository
/// root, and falls back to `./.beamable`.
fn find_state_directory() -> PathBuf {
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    let mut dir = cwd.as_path();
    loop {
        let candidate = dir.join(".beamable");
        if candidate.exists() {
            return candidate;
        }
        if dir.join(".git").exists() {
            return candidate;
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    cwd.join(".beamable")
}
