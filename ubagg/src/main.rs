use anyhow::{Context, Result};

mod cli;
mod config;
mod selftest;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = <cli::Cli as clap::Parser>::parse();
    let config_path = match cli.config {
        Some(p) => p,
        None => config::default_config_path()?,
    };

    match cli.command {
        cli::Command::PrintConfigPath => {
            println!("{}", config_path.display());
            Ok(())
        }
        cli::Command::InitConfig { force } => {
            let cfg = ubagg_core::BondConfig::default();
            config::save(&config_path, &cfg, force)?;
            println!("Wrote default config to {}", config_path.display());
            Ok(())
        }
        cli::Command::CheckConfig => {
            let cfg = config::load(&config_path)?;
            println!("{}: ok", config_path.display());
            println!("  mode:        {:?}", cfg.mode);
            println!("  window:      {} of {}", cfg.window_size, cfg.seq_space);
            println!("  so queue:    {}", cfg.so_queue_capacity);
            println!("  hdr slots:   {}", cfg.hdr_slots);
            println!("  max members: {}", cfg.max_members);
            Ok(())
        }
        cli::Command::Routes { topology } => {
            let map = config::load_topology(&topology)?;
            let current = map.current_node();
            println!("current node {}", current.bonding_eid);
            for node in map.nodes() {
                let Some(entry) = map.direct_routes(&node.bonding_eid) else {
                    continue;
                };
                println!("  -> {} ({} routes)", node.bonding_eid, entry.len());
                for route in entry.routes() {
                    let local = map
                        .port_eid(route.local)
                        .context("route refers to a missing local port")?;
                    let remote = map
                        .port_eid(route.remote)
                        .context("route refers to a missing remote port")?;
                    println!(
                        "     plane {} port {} {} -> plane {} port {} {}",
                        route.local.plane,
                        route.local.port,
                        local,
                        route.remote.plane,
                        route.remote.port,
                        remote
                    );
                }
            }
            println!("{} reachable directly", map.direct_target_count());
            Ok(())
        }
        cli::Command::Resolve { topology, eid } => {
            let map = config::load_topology(&topology)?;
            match map.bonding_eid_for(&eid) {
                Some(bonding) => {
                    let direct = if map.has_direct_route(&bonding) {
                        "direct"
                    } else {
                        "indirect"
                    };
                    println!("{eid} -> {bonding} ({direct})");
                }
                None => println!("{eid} is not in the topology"),
            }
            Ok(())
        }
        cli::Command::Selftest {
            members,
            count,
            fail_member,
        } => {
            let cfg = config::load(&config_path)?;
            let report = selftest::run(&cfg, members, count, fail_member)?;
            tracing::info!(?report, "selftest finished");
            println!(
                "delivered {} dropped {} rerouted {}",
                report.delivered, report.dropped, report.rerouted
            );
            for (idx, n) in report.per_member.iter().enumerate() {
                println!("  member {idx}: {n} sends");
            }
            Ok(())
        }
    }
}
