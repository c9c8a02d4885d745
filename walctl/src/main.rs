use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use walctl::config::RepairConfig;
use walctl::repair;

#[derive(Parser)]
#[command(
    name = "walctl",
    about = "Offline write-ahead-log and snapshot repair for a kv node",
    version
)]
struct Cli {
    /// Path to the node data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// TOML file holding `data_dir`
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List all members known to the snapshot storage and backend
    MemberList,
    /// Forcibly remove a member without a running consensus process
    MemberRemove {
        /// Member id, hexadecimal (an optional 0x prefix is accepted)
        member_id: String,
    },
}

fn main() -> anyhow::Result<()> {
    env_logger::try_init().unwrap_or_default();

    let cli = Cli::parse();
    let cfg = resolve_config(&cli)?;
    match cli.command {
        Command::MemberList => member_list(&cfg),
        Command::MemberRemove { member_id } => member_remove(&cfg, &member_id),
    }
}

fn resolve_config(cli: &Cli) -> anyhow::Result<RepairConfig> {
    if let Some(data_dir) = &cli.data_dir {
        return Ok(RepairConfig::new(data_dir.clone()));
    }
    if let Some(path) = &cli.config {
        return RepairConfig::from_toml(path)
            .with_context(|| format!("loading config from {}", path.display()));
    }
    bail!("either --data-dir or --config is required");
}

fn member_list(cfg: &RepairConfig) -> anyhow::Result<()> {
    let listing = repair::list_members(cfg)?;
    if let Some(metadata) = listing.metadata {
        println!("cluster id: {:016x}", metadata.cluster_id);
    }
    for member in listing.members {
        let status = if member.is_started() { "started" } else { "unstarted" };
        println!(
            "{:016x}: status={} name={} peerURLs={} clientURLs={}",
            member.id,
            status,
            member.name,
            member.peer_urls.join(","),
            member.client_urls.join(",")
        );
    }
    Ok(())
}

fn member_remove(cfg: &RepairConfig, raw_id: &str) -> anyhow::Result<()> {
    let member_id =
        parse_member_id(raw_id).with_context(|| format!("invalid member id {:?}", raw_id))?;
    repair::remove_member(cfg, member_id)?;
    println!("removed member {:016x}", member_id);
    Ok(())
}

/// Member ids are hexadecimal on the wire and in every listing.
fn parse_member_id(raw: &str) -> anyhow::Result<u64> {
    let digits = raw.strip_prefix("0x").unwrap_or(raw);
    let decoded = hex_pad_decode(digits)?;
    let mut id = [0u8; 8];
    id[8 - decoded.len()..].copy_from_slice(&decoded);
    Ok(u64::from_be_bytes(id))
}

/// Decode a hex string of at most 16 digits, tolerating an odd digit
/// count by left-padding with zero.
fn hex_pad_decode(digits: &str) -> anyhow::Result<Vec<u8>> {
    if digits.is_empty() || digits.len() > 16 {
        bail!("expected between 1 and 16 hex digits");
    }
    let padded = if digits.len() % 2 == 1 {
        format!("0{}", digits)
    } else {
        digits.to_string()
    };
    hex::decode(&padded).map_err(|e| anyhow::anyhow!(e))
}
