use std::time::Duration;

use anyhow::{bail, Result};

use crate::cli::{RegistryListArgs, RegistryResolveArgs};
use crate::config::RegistryConfig;
use crate::registry::DevRegistry;

pub async fn execute_registry_list(config: RegistryConfig, args: RegistryListArgs) -> Result<()> {
    let workers = DevRegistry::from_config(&config).list().await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&workers)?);
        return Ok(());
    }

    if workers.is_empty() {
        eprintln!("No workers running.");
        return Ok(());
    }

    println!("{:<24} {:<28} DURABLE OBJECTS", "NAME", "ADDRESS");
    for worker in workers {
        let classes: Vec<&str> = worker.durable_objects.iter().map(String::as_str).collect();
        println!(
            "{:<24} {:<28} {}",
            worker.name,
            worker.origin(),
            if classes.is_empty() {
                "-".to_string()
            } else {
                classes.join(",")
            }
        );
    }

    Ok(())
}

pub async fn execute_registry_resolve(
    config: RegistryConfig,
    args: RegistryResolveArgs,
) -> Result<()> {
    let registry = DevRegistry::from_config(&config);
    let found = registry
        .resolve_with_retry(&args.name, Duration::from_millis(args.wait_ms))
        .await;

    match found {
        Some(descriptor) => {
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
            Ok(())
        }
        None => bail!("Worker '{}' is not registered", args.name),
    }
}

pub async fn execute_registry_prune(config: RegistryConfig) -> Result<()> {
    let removed = DevRegistry::from_config(&config).prune().await?;
    if removed.is_empty() {
        eprintln!("Nothing to prune.");
    } else {
        for name in removed {
            println!("removed {}", name);
        }
    }
    Ok(())
}
