//! Integration tests for the cxl-region CLI.

use anyhow as _;
use clap as _;
use cxl_core as _;
use cxl_region as _;
use serde as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing as _;
use tracing_subscriber as _;

fn binary_path() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop();
    path.pop();
    path.join("cxl-region")
}

fn create_temp_file(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, content).unwrap();
    path
}

fn run(args: &[&str]) -> Output {
    Command::new(binary_path())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .expect("failed to run cxl-region")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// One host bridge, two root ports, one device each. `regions` is spliced
/// in as the file's region list.
fn one_bridge(bridge_commit: &str, regions: &str) -> String {
    format!(
        r#"{{
    "timing": {{ "settle_delay_ms": 0, "commit_timeout_ms": 2 }},
    "host_bridges": [
        {{
            "name": "pci0000:00",
            "dport": 0,
            "hdm": {{ "decoders": 2, "commit": "{bridge_commit}" }},
            "root_ports": [
                {{ "id": 0, "memdevs": [ {{ "name": "mem0", "capacity": "1G" }} ] }},
                {{ "id": 1, "memdevs": [ {{ "name": "mem1", "capacity": "1G" }} ] }}
            ]
        }}
    ],
    "root_decoders": [
        {{ "base": "0x1000000000", "size": "4G", "granularity": 256, "targets": [0] }}
    ],
    "regions": [{regions}]
}}"#
    )
}

const DECLARED: &str = r#"{ "granularity": 256, "targets": ["mem0", "mem1"], "size": "512M",
    "uuid": "6f1b5c3e-2a44-4d8e-9c1a-0b7d3e5f2a91" }"#;

#[test]
fn list_shows_the_fabric_and_declared_regions() {
    let temp_dir = tempfile::tempdir().unwrap();
    let topology = create_temp_file(
        temp_dir.path(),
        "fabric.json",
        &one_bridge("immediate", DECLARED),
    );

    let output = run(&["list", topology.to_str().unwrap()]);

    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("root0 (ACPI0017:00)"));
    assert!(text.contains("decoder0.0 root"));
    assert!(text.contains("mem1 on endpoint"));
    assert!(text.contains("region0.0:0 6f1b5c3e-2a44-4d8e-9c1a-0b7d3e5f2a91"));
    assert!(text.contains("active"));
}

#[test]
fn list_json_is_machine_readable() {
    let temp_dir = tempfile::tempdir().unwrap();
    let topology = create_temp_file(
        temp_dir.path(),
        "fabric.json",
        &one_bridge("immediate", DECLARED),
    );

    let output = run(&["list", topology.to_str().unwrap(), "--json"]);

    assert!(output.status.success(), "{}", stderr(&output));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let region = &report["regions"][0];
    assert_eq!(region["name"], "region0.0:0");
    assert_eq!(region["ways"], 2);
    assert_eq!(region["size"], 512_u64 << 20);
    assert_eq!(region["targets"], serde_json::json!(["mem0", "mem1"]));
    assert_eq!(region["decoders"].as_array().unwrap().len(), 3);
    assert_eq!(report["memdevs"][0]["free"], 768_u64 << 20);
}

#[test]
fn bind_creates_the_next_region() {
    let temp_dir = tempfile::tempdir().unwrap();
    let topology = create_temp_file(temp_dir.path(), "fabric.json", &one_bridge("immediate", ""));

    let output = run(&[
        "bind",
        topology.to_str().unwrap(),
        "-g",
        "256",
        "-s",
        "512M",
        "-t",
        "mem1",
        "-t",
        "mem0",
        "--json",
    ]);

    assert!(output.status.success(), "{}", stderr(&output));
    let region: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(region["name"], "region0.0:0");
    assert_eq!(region["active"], true);
    assert_eq!(region["targets"], serde_json::json!(["mem1", "mem0"]));
    assert_eq!(region["res"]["start"], 0x10_0000_0000_u64);
    assert_ne!(region["uuid"], "00000000-0000-0000-0000-000000000000");
}

#[test]
fn bind_after_declared_region_takes_the_next_id_and_range() {
    let temp_dir = tempfile::tempdir().unwrap();
    let declared = r#"{ "granularity": 256, "targets": ["mem0"], "size": "256M" }"#;
    let topology = create_temp_file(
        temp_dir.path(),
        "fabric.json",
        &one_bridge("immediate", declared),
    );

    let output = run(&[
        "bind",
        topology.to_str().unwrap(),
        "--granularity",
        "256",
        "--size",
        "0x10000000",
        "--target",
        "mem1",
    ]);

    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.starts_with("region0.0:1 "), "{text}");
    assert!(text.contains("[0x1010000000-0x101fffffff] active"), "{text}");
}

#[test]
fn bind_reports_unknown_targets() {
    let temp_dir = tempfile::tempdir().unwrap();
    let topology = create_temp_file(temp_dir.path(), "fabric.json", &one_bridge("immediate", ""));

    let output = run(&[
        "bind",
        topology.to_str().unwrap(),
        "-g",
        "256",
        "-s",
        "256M",
        "-t",
        "mem9",
    ]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("mem9"));
}

#[test]
fn bind_reports_commit_timeouts() {
    let temp_dir = tempfile::tempdir().unwrap();
    let topology = create_temp_file(temp_dir.path(), "fabric.json", &one_bridge("never", ""));

    let output = run(&[
        "bind",
        topology.to_str().unwrap(),
        "-g",
        "256",
        "-s",
        "512M",
        "-t",
        "mem0",
        "-t",
        "mem1",
    ]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("binding region0.0:0"));
}

#[test]
fn bind_rejects_malformed_sizes() {
    let temp_dir = tempfile::tempdir().unwrap();
    let topology = create_temp_file(temp_dir.path(), "fabric.json", &one_bridge("immediate", ""));

    let output = run(&[
        "bind",
        topology.to_str().unwrap(),
        "-g",
        "256",
        "-s",
        "12Q",
        "-t",
        "mem0",
    ]);

    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("12Q"));
}

#[test]
fn bind_requires_a_root_choice_with_several_windows() {
    let temp_dir = tempfile::tempdir().unwrap();
    let text = one_bridge("immediate", "").replace(
        r#"{ "base": "0x1000000000", "size": "4G", "granularity": 256, "targets": [0] }"#,
        r#"{ "base": "0x1000000000", "size": "4G", "granularity": 256, "targets": [0] },
        { "base": "0x2000000000", "size": "4G", "granularity": 256, "targets": [0] }"#,
    );
    let topology = create_temp_file(temp_dir.path(), "fabric.json", &text);
    let path = topology.to_str().unwrap();

    let output = run(&["bind", path, "-g", "256", "-s", "256M", "-t", "mem0"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("--root"));

    let output = run(&[
        "bind",
        path,
        "-g",
        "256",
        "-s",
        "256M",
        "-t",
        "mem0",
        "-r",
        "decoder0.1",
    ]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert!(stdout(&output).starts_with("region0.1:0 "));
}

#[test]
fn unbind_leaves_the_region_configured() {
    let temp_dir = tempfile::tempdir().unwrap();
    let topology = create_temp_file(
        temp_dir.path(),
        "fabric.json",
        &one_bridge("immediate", DECLARED),
    );

    let output = run(&["unbind", topology.to_str().unwrap(), "region0.0:0"]);

    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains("[unmapped] inactive"), "{text}");
    assert!(text.contains("targets: mem0 mem1"));
    assert!(!text.contains("decoders:"));
}

#[test]
fn delete_removes_the_region() {
    let temp_dir = tempfile::tempdir().unwrap();
    let topology = create_temp_file(
        temp_dir.path(),
        "fabric.json",
        &one_bridge("immediate", DECLARED),
    );

    let output = run(&["delete", topology.to_str().unwrap(), "region0.0:0"]);

    assert!(output.status.success(), "{}", stderr(&output));
    let text = stdout(&output);
    assert!(text.starts_with("deleted region0.0:0\n"));
    assert!(!text.contains("-> region"));
    assert!(!text.contains("6f1b5c3e"));

    let output = run(&["delete", topology.to_str().unwrap(), "region0.0:7"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("no region named region0.0:7"));
}

#[test]
fn passthrough_bridge_binds_without_registers() {
    let temp_dir = tempfile::tempdir().unwrap();
    let text = r#"{
        "timing": { "settle_delay_ms": 0 },
        "host_bridges": [
            {
                "name": "pci0000:00",
                "dport": 0,
                "root_ports": [ { "id": 0, "memdevs": [ { "name": "mem0", "capacity": "512M" } ] } ]
            }
        ],
        "root_decoders": [
            { "base": "0x1000000000", "size": "1G", "granularity": 256, "targets": [0] }
        ],
        "regions": [ { "granularity": 256, "targets": ["mem0"], "size": "256M" } ]
    }"#;
    let topology = create_temp_file(temp_dir.path(), "fabric.json", text);

    let output = run(&["list", topology.to_str().unwrap(), "--json"]);

    assert!(output.status.success(), "{}", stderr(&output));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["ports"][1]["hdm"], serde_json::Value::Null);
    assert_eq!(report["regions"][0]["active"], true);
    assert_eq!(report["regions"][0]["decoders"].as_array().unwrap().len(), 2);
}

#[test]
fn malformed_topology_files_are_rejected() {
    let temp_dir = tempfile::tempdir().unwrap();
    let topology = create_temp_file(temp_dir.path(), "fabric.json", r#"{ "host_bridges": [] }"#);

    let output = run(&["list", topology.to_str().unwrap()]);

    assert!(!output.status.success());
    assert!(stderr(&output).contains("parsing"));
}
