use clap::Parser;
use devmesh::cli::{commands, Cli, Commands, RegistryCommands};
use devmesh::telemetry::init_tracing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Dev(args) => commands::execute_dev(args).await?,
        Commands::Registry(registry) => {
            let config = registry.registry_config()?;
            match registry.command {
                RegistryCommands::List(args) => commands::execute_registry_list(config, args).await?,
                RegistryCommands::Resolve(args) => {
                    commands::execute_registry_resolve(config, args).await?
                }
                RegistryCommands::Prune => commands::execute_registry_prune(config).await?,
            }
        }
    }

    Ok(())
}
