use anyhow::{Context, Result};
use tracing::info;

use crate::cli::DevArgs;
use crate::config::load_config_from_path;
use crate::proxy::{Bundle, ProxyController, ProxyData};
use crate::registry::DevRegistry;

pub async fn execute_dev(args: DevArgs) -> Result<()> {
    let mut config = load_config_from_path(&args.config)?;
    if let Some(port) = args.port {
        config.dev.port = port;
    }
    if let Some(port) = args.inspector_port {
        config.dev.inspector_port = port;
    }
    if args.live_reload {
        config.dev.live_reload = true;
    }
    if let Some(path) = args.registry {
        config.registry.path = Some(path);
    }

    let registry = DevRegistry::from_config(&config.registry);
    let live_reload = config.dev.live_reload;
    let controller = ProxyController::start(config, registry)
        .await
        .context("Failed to start worker proxy")?;

    let mut data = ProxyData::new(&args.upstream).with_live_reload(live_reload);
    if let Some(url) = &args.inspector_upstream {
        data = data.with_inspector(url);
    }
    controller.reload_start(Bundle::default())?;
    controller.reload_complete(data)?;

    let snapshot = controller.snapshot().await?;
    eprintln!("Worker '{}' ready", snapshot.name);
    eprintln!("  http://{}", snapshot.public_addr);
    eprintln!("  inspector http://{}/json", snapshot.inspector_addr);
    eprintln!("  bindings  http://{}", snapshot.outbound_addr);
    eprintln!("Press Ctrl+C to stop.\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("interrupt received");
    controller.shutdown().await;

    Ok(())
}
