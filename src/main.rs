//! flexblock CLI - Main entry point.

use flexblock::cli::{
    AdminCommands, Cli, Commands, DomainCommands, IoCommands, NodeCommands, PoolCommands,
    VolumeCommands,
};
use flexblock::client::{AdminClient, Initiator, InitiatorConfig, RemoteAuthority, TcpDataPlane};
use flexblock::config::{FlexConfig, NodeRole};
use flexblock::metadata::{CreatePool, CreateVolume};
use flexblock::types::{AccessMode, Provisioning, GB};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse_args();

    match cli.command {
        Commands::Mdm {
            control_addr,
            admin_addr,
            token_secret,
        } => {
            let mut config = load_config(cli.config.as_deref(), NodeRole::Mdm)?;
            if let Some(addr) = control_addr {
                config.mdm.control_addr = addr.parse()?;
            }
            if let Some(addr) = admin_addr {
                config.mdm.admin_addr = addr.parse()?;
            }
            if let Some(secret) = token_secret {
                config.security.token_secret = secret;
            }
            config.observability.log_level = cli.log_level;
            flexblock::run(config).await?;
        }

        Commands::Sds {
            node_id,
            pool,
            capacity,
            data_addr,
            advertise_addr,
            mdm_addr,
            fault_set,
            data_dir,
            token_secret,
        } => {
            let mut config = load_config(cli.config.as_deref(), NodeRole::Sds)?;
            config.node.id = node_id;
            config.node.name = format!("sds-{}", node_id);
            config.sds.pool_id = pool;
            if let Some(capacity) = capacity {
                config.sds.capacity = capacity;
            }
            if let Some(addr) = data_addr {
                config.sds.data_addr = addr.parse()?;
            }
            if advertise_addr.is_some() {
                config.sds.advertise_addr = advertise_addr;
            }
            if let Some(addr) = mdm_addr {
                config.sds.mdm_addr = addr;
            }
            if fault_set.is_some() {
                config.sds.fault_set = fault_set;
            }
            if let Some(dir) = data_dir {
                config.storage.data_dir = dir;
            }
            if let Some(secret) = token_secret {
                config.security.token_secret = secret;
            }
            config.observability.log_level = cli.log_level;
            flexblock::run(config).await?;
        }

        Commands::Sdc { node_id, mdm_addr } => {
            let mut config = load_config(cli.config.as_deref(), NodeRole::Sdc)?;
            config.node.id = node_id;
            config.node.name = format!("sdc-{}", node_id);
            if let Some(addr) = mdm_addr {
                config.sdc.mdm_addr = addr;
            }
            config.observability.log_level = cli.log_level;
            config.observability.metrics_enabled = false;
            flexblock::run(config).await?;
        }

        Commands::Admin { addr, command } => {
            let client = AdminClient::new(&addr);
            if let Err(e) = run_admin(&client, command).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }

        Commands::Io {
            mdm_addr,
            client_id,
            command,
        } => {
            let config = load_config(cli.config.as_deref(), NodeRole::Sdc)?;
            let authority = Arc::new(RemoteAuthority::new(
                mdm_addr,
                config.network.connect_timeout,
                config.network.request_timeout,
            ));
            let data_plane = Arc::new(TcpDataPlane::new(
                config.network.connect_timeout,
                config.network.request_timeout,
            ));
            let initiator = Initiator::new(
                client_id,
                authority,
                data_plane,
                InitiatorConfig {
                    io_timeout: config.sdc.io_timeout,
                },
            );
            if let Err(e) = run_io(&initiator, command).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }

        Commands::Version => {
            println!("flexblock v{}", env!("CARGO_PKG_VERSION"));
            println!("Replicated block storage");
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>, role: NodeRole) -> anyhow::Result<FlexConfig> {
    let mut config = match path {
        Some(path) => FlexConfig::from_file(path)?,
        None => FlexConfig::development(),
    };
    config.node.role = role;
    Ok(config)
}

async fn run_admin(client: &AdminClient, command: AdminCommands) -> anyhow::Result<()> {
    match command {
        AdminCommands::Status { fresh } => {
            let snapshot = client.snapshot(fresh).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }

        AdminCommands::Events { limit, pool } => {
            for event in client.events(limit, pool).await? {
                println!(
                    "{}  {:?}  {}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.event_type,
                    event.message
                );
            }
        }

        AdminCommands::Domain { command } => match command {
            DomainCommands::Create { name } => {
                let domain = client.create_protection_domain(&name).await?;
                println!("Created protection domain {} ({})", domain.id, domain.name);
            }
            DomainCommands::List => {
                for domain in client.list_protection_domains().await? {
                    println!("{:>4}  {}", domain.id, domain.name);
                }
            }
            DomainCommands::Delete { id } => {
                client.delete_protection_domain(id).await?;
                println!("Deleted protection domain {}", id);
            }
        },

        AdminCommands::Pool { command } => match command {
            PoolCommands::Create {
                domain,
                name,
                capacity,
                reserved,
                copies,
                rebuild_rate,
            } => {
                let pool = client
                    .create_pool(&CreatePool {
                        protection_domain_id: domain,
                        name,
                        total_capacity: capacity,
                        reserved_capacity: reserved,
                        copies,
                        rebuild_rate_mbps: rebuild_rate,
                    })
                    .await?;
                println!(
                    "Created pool {} ({}) with {:.2} GB, {} copies",
                    pool.id,
                    pool.name,
                    pool.total_capacity_gb(),
                    pool.copies
                );
            }
            PoolCommands::List => {
                println!(
                    "{:>4}  {:<16}  {:>10}  {:>10}  {}  {}",
                    "ID", "NAME", "USED GB", "TOTAL GB", "HEALTH", "REBUILD"
                );
                for pool in client.list_pools().await? {
                    println!(
                        "{:>4}  {:<16}  {:>10.2}  {:>10.2}  {:?}  {:?}",
                        pool.id,
                        pool.name,
                        pool.used_capacity_gb(),
                        pool.total_capacity_gb(),
                        pool.health,
                        pool.rebuild_state
                    );
                }
            }
            PoolCommands::Show { id } => {
                let pool = client.get_pool(id).await?;
                println!("{}", serde_json::to_string_pretty(&pool)?);
                if let Some(job) = client.rebuild_status(id).await? {
                    println!(
                        "Rebuild: {:?} {:.1}% ({} of {} bytes)",
                        job.state,
                        job.progress_percent(),
                        job.bytes_done,
                        job.bytes_total
                    );
                }
            }
            PoolCommands::Delete { id } => {
                client.delete_pool(id).await?;
                println!("Deleted pool {}", id);
            }
            PoolCommands::Rebuild { id } => match client.start_rebuild(id).await? {
                Some(job) => println!(
                    "Rebuild of pool {} {:?}: {} bytes to copy",
                    id, job.state, job.bytes_total
                ),
                None => println!("Pool {} has nothing to rebuild", id),
            },
            PoolCommands::CancelRebuild { id } => {
                if client.cancel_rebuild(id).await? {
                    println!("Cancelled rebuild of pool {}", id);
                } else {
                    println!("No rebuild running on pool {}", id);
                }
            }
            PoolCommands::SetRebuildRate { id, rate } => {
                client.set_rebuild_rate(id, rate).await?;
                println!("Pool {} rebuild rate set to {} MiB/s", id, rate);
            }
        },

        AdminCommands::Node { command } => match command {
            NodeCommands::List => {
                for node in client.list_storage_nodes().await? {
                    println!(
                        "{:>4}  {:<16}  pool {:<4}  {:?}  {:>8.2}/{:.2} GB  {}",
                        node.id,
                        node.name,
                        node.pool_id,
                        node.state,
                        node.used as f64 / GB as f64,
                        node.capacity as f64 / GB as f64,
                        node.address
                    );
                }
            }
            NodeCommands::Remove { id } => {
                client.remove_storage_node(id).await?;
                println!("Removed storage node {}", id);
            }
            NodeCommands::Fail { id } => {
                if client.fail_node(id).await? {
                    println!("Storage node {} marked DOWN", id);
                } else {
                    println!("Storage node {} was already DOWN", id);
                }
            }
            NodeCommands::Recover { id } => {
                let report = client.recover_node(id).await?;
                println!(
                    "Storage node {} recovered: {} healed, {} resync, {} dropped, {} lost",
                    id,
                    report.healed.len(),
                    report.resync.len(),
                    report.dropped.len(),
                    report.lost.len()
                );
            }
        },

        AdminCommands::Volume { command } => match command {
            VolumeCommands::Create {
                pool,
                name,
                size,
                thin,
            } => {
                let provisioning = if thin {
                    Provisioning::Thin
                } else {
                    Provisioning::Thick
                };
                let volume = client
                    .create_volume(&CreateVolume {
                        pool_id: pool,
                        name,
                        size,
                        provisioning,
                    })
                    .await?;
                println!(
                    "Created volume {} ({}) of {} bytes in {} chunks",
                    volume.id,
                    volume.name,
                    volume.size,
                    volume.chunks.len()
                );
            }
            VolumeCommands::List => {
                for volume in client.list_volumes().await? {
                    println!(
                        "{:>4}  {:<16}  pool {:<4}  {:>14}  {:?}  {:?}  mapped {}",
                        volume.id,
                        volume.name,
                        volume.pool_id,
                        volume.size,
                        volume.provisioning,
                        volume.state,
                        volume.mapping_count
                    );
                }
            }
            VolumeCommands::Show { id } => {
                let volume = client.get_volume(id).await?;
                println!("{}", serde_json::to_string_pretty(&volume)?);
            }
            VolumeCommands::Extend { id, size } => {
                let volume = client.extend_volume(id, size).await?;
                println!("Volume {} is now {} bytes", volume.id, volume.size);
            }
            VolumeCommands::Delete { id } => {
                client.delete_volume(id).await?;
                println!("Deleted volume {}", id);
            }
            VolumeCommands::Map {
                id,
                client: client_id,
                read_only,
            } => {
                let mode = if read_only {
                    AccessMode::ReadOnly
                } else {
                    AccessMode::ReadWrite
                };
                client.map_volume(id, client_id, mode).await?;
                println!("Mapped volume {} to client {} ({:?})", id, client_id, mode);
            }
            VolumeCommands::Unmap {
                id,
                client: client_id,
            } => {
                client.unmap_volume(id, client_id).await?;
                println!("Unmapped volume {} from client {}", id, client_id);
            }
        },

        AdminCommands::Clients => {
            for node in client.list_clients().await? {
                let seen = node
                    .last_heartbeat
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "never".to_string());
                println!("{:>4}  {:<16}  last heartbeat {}", node.id, node.name, seen);
            }
        }

        AdminCommands::Mappings => {
            for mapping in client.list_mappings().await? {
                println!(
                    "volume {:>4}  client {:>4}  {:?}",
                    mapping.volume_id, mapping.client_id, mapping.access_mode
                );
            }
        }
    }

    Ok(())
}

async fn run_io(initiator: &Initiator, command: IoCommands) -> anyhow::Result<()> {
    match command {
        IoCommands::Read {
            volume,
            offset,
            length,
            output,
        } => {
            let data = initiator.read(volume, offset, length).await?;
            match output {
                Some(path) => std::fs::write(&path, &data)?,
                None => std::io::stdout().write_all(&data)?,
            }
        }
        IoCommands::Write {
            volume,
            offset,
            input,
        } => {
            let data = std::fs::read(&input)?;
            let result = initiator.write(volume, offset, &data).await?;
            if result.degraded_chunks.is_empty() {
                println!("Wrote {} bytes", result.bytes);
            } else {
                println!(
                    "Wrote {} bytes; {} chunks below full redundancy",
                    result.bytes,
                    result.degraded_chunks.len()
                );
            }
        }
    }
    Ok(())
}
