//! Topology files, region planning, and reports behind the `cxl-region` binary.

use clap as _;
use tracing_subscriber as _;
#[cfg(test)]
use tempfile as _;

/// Text and JSON snapshots of a live topology.
pub mod report;
/// JSON fabric descriptions and the builder that brings them up.
pub mod topology_file;
/// Size and address parsing.
pub mod units;
