//! `cxl-region`: bind and tear down CXL regions on a described fabric.
//!
//! ```text
//! USAGE:
//!   cxl-region list <topology>                         Show ports, decoders, devices, regions
//!   cxl-region bind <topology> -g <gran> -s <size> -t <memdev>...
//!                                                      Create and bind one more region
//!   cxl-region unbind <topology> <region>              Unbind a region declared in the file
//!   cxl-region delete <topology> <region>              Delete a region declared in the file
//! ```
//!
//! The topology file describes the platform and any regions that exist
//! already; every invocation rebuilds the fabric from it before acting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cxl_core::{delete_region, unbind_region, Region, Topology};
use cxl_region::report::{RegionReport, TopologyReport};
use cxl_region::topology_file::{self, create_and_bind, RegionPlan};
use cxl_region::units::parse_size;
use serde as _;
#[cfg(test)]
use tempfile as _;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "cxl-region", about = "CXL region binding on a described fabric", version)]
struct Cli {
    /// Log decoder programming and validation steps.
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Show the fabric after loading the topology file.
    List {
        /// Topology description (JSON).
        topology: PathBuf,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Create a region, configure it, and bind it.
    Bind {
        /// Topology description (JSON).
        topology: PathBuf,
        /// Interleave granularity in bytes.
        #[arg(short, long)]
        granularity: u32,
        /// Region size, e.g. 512M or 0x20000000.
        #[arg(short, long, value_parser = parse_size)]
        size: u64,
        /// Memory device for the next interleave position; repeat per way.
        #[arg(short, long = "target", required = true)]
        targets: Vec<String>,
        /// Root decoder to allocate from; optional when the platform has one.
        #[arg(short, long)]
        root: Option<String>,
        /// Region UUID; generated when omitted.
        #[arg(long)]
        uuid: Option<String>,
        /// Print JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Unbind a region and release its decoders.
    Unbind {
        /// Topology description (JSON).
        topology: PathBuf,
        /// Region name, e.g. region0.1:0.
        region: String,
    },
    /// Delete a region, unbinding it first.
    Delete {
        /// Topology description (JSON).
        topology: PathBuf,
        /// Region name, e.g. region0.1:0.
        region: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Cmd::List { topology, json } => cmd_list(&topology, json)?,
        Cmd::Bind {
            topology,
            granularity,
            size,
            targets,
            root,
            uuid,
            json,
        } => cmd_bind(
            &topology,
            &RegionPlan {
                root,
                granularity,
                targets,
                size,
                uuid,
            },
            json,
        )?,
        Cmd::Unbind { topology, region } => cmd_unbind(&topology, &region)?,
        Cmd::Delete { topology, region } => cmd_delete(&topology, &region)?,
    }

    Ok(())
}

fn cmd_list(path: &Path, json: bool) -> Result<()> {
    let fabric = topology_file::load(path)?;
    let report = TopologyReport::capture(&fabric.topology);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

fn cmd_bind(path: &Path, plan: &RegionPlan, json: bool) -> Result<()> {
    let fabric = topology_file::load(path)?;
    let region = create_and_bind(&fabric.topology, plan)?;
    let report = RegionReport::capture(&fabric.topology, &region);
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{report}");
    }
    Ok(())
}

fn cmd_unbind(path: &Path, name: &str) -> Result<()> {
    let fabric = topology_file::load(path)?;
    let region = lookup(&fabric.topology, name)?;
    unbind_region(&fabric.topology, region.handle())
        .with_context(|| format!("unbinding {name}"))?;
    info!(region = name, "unbound");
    print!("{}", RegionReport::capture(&fabric.topology, &region));
    Ok(())
}

fn cmd_delete(path: &Path, name: &str) -> Result<()> {
    let fabric = topology_file::load(path)?;
    let region = lookup(&fabric.topology, name)?;
    delete_region(&fabric.topology, region.root(), name)
        .with_context(|| format!("deleting {name}"))?;
    println!("deleted {name}");
    print!("{}", TopologyReport::capture(&fabric.topology));
    Ok(())
}

fn lookup(topology: &Topology, name: &str) -> Result<Arc<Region>> {
    topology
        .regions()
        .into_iter()
        .find(|region| region.name() == name)
        .with_context(|| format!("no region named {name}"))
}
