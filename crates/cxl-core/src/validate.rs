//! Root decoder selection and fabric routing checks.
//!
//! A root decoder can host a region only when every endpoint's address
//! stripes are routed to it by the root target list (the cross host bridge
//! check) and each host bridge can fan its share out to its root ports with
//! a single decoder (the host bridge root port check).

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{CxlError, Result, XhbViolation};
use crate::interleave::{floor_pow2, is_valid_granularity, is_valid_ways};
use crate::resource::HpaRange;
use crate::topology::{
    Decoder, DecoderId, DecoderKind, MemdevId, PortId, RegionHandle, TargetType,
    Topology,
};

/// Region geometry presented to the validator.
#[derive(Debug, Clone, Copy)]
pub struct RegionRequest<'a> {
    /// Region being placed.
    pub region: RegionHandle,
    /// Region name, for diagnostics.
    pub name: &'a str,
    /// Interleave ways.
    pub interleave_ways: u32,
    /// Interleave granularity in bytes.
    pub interleave_granularity: u32,
    /// Memory device per position; exactly `interleave_ways` entries.
    pub targets: &'a [MemdevId],
    /// Host physical range reserved for the region, once allocated.
    pub res: Option<HpaRange>,
}

/// Route from one region position up to the root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetPath {
    /// Region position.
    pub position: usize,
    /// Memory device at the position.
    pub memdev: MemdevId,
    /// Endpoint port of the device.
    pub endpoint: PortId,
    /// Endpoint port depth.
    pub depth: u32,
    /// Host bridge above the endpoint.
    pub host_bridge: PortId,
    /// Host bridge name.
    pub host_bridge_name: String,
    /// Root downstream port id leading to the host bridge.
    pub host_bridge_dport: u32,
    /// Host bridge downstream port id leading to the endpoint.
    pub root_port: u32,
}

/// Resolves the route of every region target.
///
/// # Errors
///
/// Returns [`CxlError::UnknownHandle`] for stale handles and
/// [`CxlError::WrongPortKind`] for an endpoint not below a host bridge.
pub fn target_paths(topology: &Topology, targets: &[MemdevId]) -> Result<Vec<TargetPath>> {
    targets
        .iter()
        .enumerate()
        .map(|(position, &memdev)| {
            let endpoint = topology.port(topology.memdev(memdev)?.endpoint())?;
            let host_bridge = topology.host_bridge_of(endpoint.id())?;
            let missing_link = || CxlError::WrongPortKind {
                port: endpoint.name().to_owned(),
                expected: "a port below a host bridge",
            };
            Ok(TargetPath {
                position,
                memdev,
                endpoint: endpoint.id(),
                depth: endpoint.depth(),
                host_bridge: host_bridge.id(),
                host_bridge_name: host_bridge.name().to_owned(),
                host_bridge_dport: host_bridge.parent_dport().ok_or_else(missing_link)?,
                root_port: endpoint.parent_dport().ok_or_else(missing_link)?,
            })
        })
        .collect()
}

/// QoS class check between a root window and an endpoint.
///
/// Always accepts; QTG selection is not modelled.
#[must_use]
pub const fn qtg_match(_root_qtg: u16, _endpoint_qtg: u16) -> bool {
    true
}

/// Window containment check for a region.
///
/// Always accepts; placement is decided by the window's address pool.
#[must_use]
pub const fn rootd_contains(_window: HpaRange, _res: Option<HpaRange>) -> bool {
    true
}

/// Checks that the root decoder routes every position to the host bridge above it.
///
/// # Errors
///
/// Returns [`CxlError::CrossHostBridge`] naming the violated rule.
pub fn xhb_valid(req: &RegionRequest<'_>, root: &Decoder, paths: &[TargetPath]) -> Result<()> {
    let host_bridges: Vec<PortId> = distinct(paths.iter().map(|path| path.host_bridge));
    if host_bridges.len() <= 1 {
        return Ok(());
    }

    let (root_ways, root_granularity) = {
        let state = root.lock();
        (state.interleave_ways, state.interleave_granularity)
    };
    if root_granularity < req.interleave_granularity {
        return Err(XhbViolation::RootGranularityTooFine {
            root_granularity,
            region_granularity: req.interleave_granularity,
        }
        .into());
    }
    let shift = root_granularity.trailing_zeros() - req.interleave_granularity.trailing_zeros();
    let required = (1_u32 << shift) * root_ways;
    if required > req.interleave_ways {
        return Err(XhbViolation::InsufficientWays {
            required,
            ways: req.interleave_ways,
        }
        .into());
    }
    if !req.interleave_ways.is_multiple_of(required) {
        return Err(XhbViolation::UnevenWays {
            required,
            ways: req.interleave_ways,
        }
        .into());
    }

    let root_targets = root
        .targets()
        .map(crate::topology::TargetList::snapshot)
        .unwrap_or_default();
    for path in paths {
        let expected = (path.position >> shift) % root_ways as usize;
        let actual = root_targets
            .iter()
            .position(|&dport| dport == path.host_bridge_dport);
        if actual != Some(expected) {
            return Err(XhbViolation::Misrouted {
                position: path.position,
                host_bridge: path.host_bridge_name.clone(),
                expected,
                actual,
            }
            .into());
        }
    }
    Ok(())
}

/// Checks root port grouping below each host bridge and optionally stages
/// one host bridge decoder per bridge.
///
/// Staged decoders are appended to `staging` only when every bridge could
/// be staged; on failure every claim made by this call is dropped.
///
/// # Errors
///
/// Returns [`CxlError::SwitchTopology`] when an endpoint sits below a
/// switch, [`CxlError::RootPortGrouping`] when positions below a root port
/// disagree under the position mask, and [`CxlError::NoFreeDecoder`] when a
/// bridge has no decoder to stage.
pub fn hb_rp_valid(
    topology: &Topology,
    req: &RegionRequest<'_>,
    root: &Decoder,
    paths: &[TargetPath],
    staging: Option<&mut Vec<DecoderId>>,
) -> Result<()> {
    if let Some(path) = paths.iter().find(|path| path.depth > 2) {
        let endpoint = topology.port(path.endpoint)?;
        return Err(CxlError::SwitchTopology {
            endpoint: endpoint.name().to_owned(),
            depth: path.depth,
        });
    }

    // (host bridge, root port) -> positions below it
    let mut root_ports: BTreeMap<(PortId, u32), Vec<usize>> = BTreeMap::new();
    for path in paths {
        root_ports
            .entry((path.host_bridge, path.root_port))
            .or_default()
            .push(path.position);
    }
    let host_bridges: Vec<PortId> = distinct(paths.iter().map(|path| path.host_bridge));

    if host_bridges.len() > 1 {
        let mask = floor_pow2(root_ports.len()) - 1;
        for ((host_bridge, root_port), positions) in &root_ports {
            let first = positions[0];
            if let Some(&second) = positions.iter().find(|&&pos| pos & mask != first & mask) {
                let name = topology.port(*host_bridge)?.name().to_owned();
                return Err(CxlError::RootPortGrouping {
                    host_bridge: name,
                    root_port: *root_port,
                    first,
                    second,
                    mask,
                });
            }
        }
    }

    let Some(staging) = staging else {
        return Ok(());
    };

    let granularity = bridge_granularity(req, root, host_bridges.len());
    let mut staged = Vec::with_capacity(host_bridges.len());
    for &host_bridge in &host_bridges {
        let mut below: Vec<(usize, u32)> = root_ports
            .iter()
            .filter(|((bridge, _), _)| *bridge == host_bridge)
            .map(|((_, root_port), positions)| {
                (positions.iter().copied().min().unwrap_or(usize::MAX), *root_port)
            })
            .collect();
        below.sort_unstable();
        let targets: Vec<u32> = below.iter().map(|&(_, root_port)| root_port).collect();
        let ways = u32::try_from(targets.len()).unwrap_or(u32::MAX);

        let claimed = if is_valid_ways(ways) {
            claim_switch_decoder(topology, host_bridge, req, ways, granularity, &targets)
        } else {
            Err(CxlError::InvalidWays { ways })
        };
        match claimed {
            Ok(decoder) => staged.push(decoder),
            Err(err) => {
                warn!(region = req.name, error = %err, "host bridge staging failed");
                release_staged(topology, &staged);
                return Err(err);
            }
        }
    }
    debug!(region = req.name, staged = staged.len(), "host bridge decoders staged");
    staging.extend(staged);
    Ok(())
}

/// Runs every root decoder predicate in order.
///
/// # Errors
///
/// Returns the first failing predicate's error. When `staging` is given,
/// host bridge decoders are staged into it on success.
pub fn rootd_valid(
    topology: &Topology,
    req: &RegionRequest<'_>,
    root: DecoderId,
    staging: Option<&mut Vec<DecoderId>>,
) -> Result<()> {
    let root = topology.decoder(root)?;
    let root_payload = root.as_root()?;
    let paths = target_paths(topology, req.targets)?;
    let first = topology.memdev(*req.targets.first().ok_or(CxlError::MissingTarget {
        position: 0,
    })?)?;

    if !qtg_match(root_payload.qtg_id(), first.qtg_id()) {
        return Err(CxlError::QtgMismatch {
            decoder: root.name().to_owned(),
            memdev: first.name().to_owned(),
        });
    }
    if !root.lock().flags.is_pmem_type3() {
        return Err(CxlError::NotPmemCapable {
            decoder: root.name().to_owned(),
        });
    }
    xhb_valid(req, &root, &paths)?;
    hb_rp_valid(topology, req, &root, &paths, staging)?;
    if !rootd_contains(root_payload.window(), req.res) {
        return Err(CxlError::OutsideWindow {
            decoder: root.name().to_owned(),
            region: req.name.to_owned(),
        });
    }
    Ok(())
}

/// Finds the first root decoder above the first target that can host the region.
///
/// # Errors
///
/// Returns [`CxlError::NoRootDecoder`] when none qualifies.
pub fn find_root_decoder(topology: &Topology, req: &RegionRequest<'_>) -> Result<DecoderId> {
    let first = req
        .targets
        .first()
        .ok_or(CxlError::MissingTarget { position: 0 })?;
    let endpoint = topology.memdev(*first)?.endpoint();
    let root_port = topology
        .ancestors(endpoint)?
        .pop()
        .ok_or(CxlError::UnknownHandle {
            kind: "port",
            index: 0,
        })?;
    topology
        .decoders_of(root_port.id())?
        .into_iter()
        .filter(|decoder| decoder.kind() == DecoderKind::Root)
        .find(|decoder| rootd_valid(topology, req, decoder.handle(), None).is_ok())
        .map(|decoder| decoder.handle())
        .ok_or_else(|| CxlError::NoRootDecoder {
            region: req.name.to_owned(),
        })
}

/// Drops the region claim on every decoder in `staged`.
pub fn release_staged(topology: &Topology, staged: &[DecoderId]) {
    for &handle in staged {
        if let Ok(decoder) = topology.decoder(handle) {
            decoder.lock().release();
            debug!(decoder = decoder.name(), "released staged decoder");
        }
    }
}

fn bridge_granularity(req: &RegionRequest<'_>, root: &Decoder, host_bridges: usize) -> u32 {
    if host_bridges <= 1 {
        return req.interleave_granularity;
    }
    let (root_ways, root_granularity) = {
        let state = root.lock();
        (state.interleave_ways, state.interleave_granularity)
    };
    if root_granularity > req.interleave_granularity {
        return req.interleave_granularity;
    }
    // bridge selection uses the low position bits, root ports the ones above
    let pow2_ways = if root_ways.is_power_of_two() { root_ways } else { root_ways / 3 };
    req.interleave_granularity * pow2_ways.max(1)
}

fn claim_switch_decoder(
    topology: &Topology,
    host_bridge: PortId,
    req: &RegionRequest<'_>,
    ways: u32,
    granularity: u32,
    targets: &[u32],
) -> Result<DecoderId> {
    let port = topology.port(host_bridge)?;
    if !is_valid_granularity(granularity) {
        return Err(CxlError::InvalidGranularity { granularity });
    }
    for decoder in topology.decoders_of(host_bridge)? {
        if decoder.kind() != DecoderKind::Switch {
            continue;
        }
        let mut state = decoder.lock();
        if !state.is_free() {
            continue;
        }
        if let Some(list) = decoder.targets() {
            if list.capacity() < targets.len() {
                continue;
            }
            list.store(targets)?;
        }
        state.region = Some(req.region);
        state.range = req.res;
        state.interleave_ways = ways;
        state.interleave_granularity = granularity;
        state.target_type = TargetType::Expander;
        debug!(
            decoder = decoder.name(),
            region = req.name,
            ways,
            granularity,
            ?targets,
            "staged host bridge decoder"
        );
        return Ok(decoder.handle());
    }
    Err(CxlError::NoFreeDecoder {
        port: port.name().to_owned(),
    })
}

fn distinct<T: Ord + Copy>(items: impl Iterator<Item = T>) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.sort_unstable();
    out.dedup();
    out
}
