//! Region bind and unbind.
//!
//! Bind runs sanitize, address allocation, root decoder validation with
//! host bridge staging, endpoint decoder collection, then commits staged
//! decoders from the endpoints upward. Every step before commit unwinds
//! completely on failure. A commit failure after at least one decoder went
//! live leaves those decoders enabled and the region must be unbound before
//! it can be bound again.

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::config::sanitize_region;
use super::{Region, RegionState};
use crate::error::{CxlError, Result};
use crate::hdm::driver::{commit_decoder, disable_decoder};
use crate::topology::{DecoderId, DecoderKind, RegionHandle, TargetType, Topology};
use crate::validate::{find_root_decoder, rootd_valid, RegionRequest};

/// Binds a configured region: reserves address space and programs every decoder on its path.
///
/// Binding an already active region is a no-op.
///
/// # Errors
///
/// Returns configuration, topology, or exhaustion errors with all partial
/// state released. A commit failure with no decoder committed returns the
/// raw hardware error, also fully unwound; a later one returns
/// [`CxlError::PartialCommit`] and leaves the committed decoders for
/// [`unbind_region`].
pub fn bind_region(topology: &Topology, handle: RegionHandle) -> Result<()> {
    let region = topology.region(handle)?;
    let mut state = region.lock();
    if state.active {
        return Ok(());
    }
    if state.dead {
        return Err(CxlError::RegionDead {
            region: region.name().to_owned(),
        });
    }
    if !state.committed.is_empty() {
        return Err(CxlError::RegionNeedsTeardown {
            region: region.name().to_owned(),
        });
    }
    if state.uuid.is_nil() {
        state.uuid = Uuid::new_v4();
    }

    let targets = sanitize_region(topology, &state)?;
    let root = topology.decoder(region.root())?;
    let res = {
        let mut resources = root.as_root()?.resources();
        if resources.is_removing() {
            return Err(CxlError::DecoderRemoved {
                decoder: root.name().to_owned(),
            });
        }
        resources
            .reserve(state.size, region.name())
            .ok_or_else(|| CxlError::AddressSpaceExhausted {
                decoder: root.name().to_owned(),
                size: state.size,
            })?
    };
    state.res = Some(res);
    debug!(region = region.name(), res = %res, "address space reserved");

    let req = RegionRequest {
        region: handle,
        name: region.name(),
        interleave_ways: state.interleave_ways,
        interleave_granularity: state.interleave_granularity,
        targets: &targets,
        res: Some(res),
    };
    let mut staged = Vec::new();
    let prepared = rootd_valid(topology, &req, root.handle(), Some(&mut staged)).and_then(|()| {
        if let Ok(found) = find_root_decoder(topology, &req) {
            if found != root.handle() {
                debug!(region = region.name(), ?found, "first matching root decoder differs");
            }
        }
        collect_ep_decoders(topology, &req, &mut staged)
    });
    if let Err(err) = prepared {
        debug!(region = region.name(), error = %err, staged = staged.len(), "bind rolled back");
        release_decoders(topology, &staged);
        release_address_space(topology, &region, &mut state);
        return Err(err);
    }

    state.staged = staged;
    commit_staged(topology, &region, &mut state)?;
    state.active = true;
    info!(
        region = region.name(),
        uuid = %state.uuid,
        res = %res,
        ways = state.interleave_ways,
        granularity = state.interleave_granularity,
        "region bound"
    );
    Ok(())
}

/// Disables every committed decoder and releases the region's decoders and address space.
///
/// Unbinding an unbound region is a no-op.
///
/// # Errors
///
/// Returns the first decoder disable failure; the remaining decoders and
/// the address space are released regardless.
pub fn unbind_region(topology: &Topology, handle: RegionHandle) -> Result<()> {
    let region = topology.region(handle)?;
    let mut state = region.lock();
    teardown(topology, &region, &mut state)
}

pub(super) fn teardown(
    topology: &Topology,
    region: &Region,
    state: &mut RegionState,
) -> Result<()> {
    let mut first_err = None;
    for &decoder in state.committed.iter().rev() {
        if let Err(err) = disable_decoder(topology, decoder) {
            error!(region = region.name(), error = %err, "decoder disable failed");
            first_err.get_or_insert(err);
        }
    }
    let committed = std::mem::take(&mut state.committed);
    let staged = std::mem::take(&mut state.staged);
    release_decoders(topology, &committed);
    release_decoders(topology, &staged);
    release_address_space(topology, region, state);
    if state.active {
        state.active = false;
        info!(region = region.name(), "region unbound");
    }
    first_err.map_or(Ok(()), Err)
}

fn collect_ep_decoders(
    topology: &Topology,
    req: &RegionRequest<'_>,
    staged: &mut Vec<DecoderId>,
) -> Result<()> {
    let per_device = req.res.map_or(0, |res| res.size / u64::from(req.interleave_ways));
    for &target in req.targets {
        let memdev = topology.memdev(target)?;
        let endpoint = topology.port(memdev.endpoint())?;
        let claimed = topology
            .decoders_of(endpoint.id())?
            .into_iter()
            .filter(|decoder| decoder.kind() == DecoderKind::Endpoint)
            .find(|decoder| {
                let mut state = decoder.lock();
                if !state.is_free() {
                    return false;
                }
                state.region = Some(req.region);
                state.range = req.res;
                state.interleave_ways = req.interleave_ways;
                state.interleave_granularity = req.interleave_granularity;
                state.target_type = TargetType::Expander;
                true
            })
            .ok_or_else(|| CxlError::NoFreeDecoder {
                port: endpoint.name().to_owned(),
            })?;
        staged.push(claimed.handle());

        let dpa = memdev
            .alloc_dpa(per_device)
            .ok_or_else(|| CxlError::CapacityExhausted {
                memdev: memdev.name().to_owned(),
                size: per_device,
            })?;
        claimed.as_endpoint()?.set_dpa(Some(dpa));
        debug!(
            decoder = claimed.name(),
            memdev = memdev.name(),
            dpa = %dpa,
            "staged endpoint decoder"
        );
    }
    Ok(())
}

fn commit_staged(topology: &Topology, region: &Region, state: &mut RegionState) -> Result<()> {
    let staged = std::mem::take(&mut state.staged);
    for (done, &handle) in staged.iter().rev().enumerate() {
        let Err(err) = commit_decoder(topology, handle) else {
            state.committed.push(handle);
            continue;
        };
        let decoder = topology
            .decoder(handle)
            .map(|decoder| decoder.name().to_owned())
            .unwrap_or_default();
        let uncommitted = &staged[..staged.len() - done];
        release_decoders(topology, uncommitted);
        let committed = state.committed.len();
        if committed == 0 {
            error!(
                region = region.name(),
                decoder = %decoder,
                error = %err,
                "commit failed, bind rolled back"
            );
            release_address_space(topology, region, state);
            return Err(err);
        }
        error!(
            region = region.name(),
            decoder = %decoder,
            committed,
            error = %err,
            "commit failed with decoders left active"
        );
        return Err(CxlError::PartialCommit {
            decoder,
            committed,
            source: Box::new(err),
        });
    }
    Ok(())
}

fn release_decoders(topology: &Topology, handles: &[DecoderId]) {
    for &handle in handles {
        let Ok(decoder) = topology.decoder(handle) else {
            continue;
        };
        decoder.lock().release();
        if let Ok(endpoint) = decoder.as_endpoint() {
            if let Some(dpa) = endpoint.set_dpa(None) {
                if let Some(memdev) = topology
                    .memdevs()
                    .into_iter()
                    .find(|memdev| memdev.endpoint() == decoder.port())
                {
                    memdev.free_dpa(dpa);
                }
            }
        }
        debug!(decoder = decoder.name(), "released decoder");
    }
}

fn release_address_space(topology: &Topology, region: &Region, state: &mut RegionState) {
    let Some(res) = state.res.take() else {
        return;
    };
    match topology.decoder(region.root()).and_then(|root| {
        root.as_root()?.resources().release(res);
        Ok(())
    }) {
        Ok(()) => debug!(region = region.name(), res = %res, "address space released"),
        Err(err) => warn!(region = region.name(), error = %err, "address space release failed"),
    }
}
