//! Region naming, creation, and removal under a root decoder.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::bind::teardown;
use super::Region;
use crate::error::{CxlError, Result};
use crate::topology::{DecoderId, RegionHandle, Topology};

/// Parsed `region<port>.<decoder>:<id>` triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegionName {
    /// Port id of the root decoder's port.
    pub port: u32,
    /// Root decoder id within that port.
    pub decoder: u32,
    /// Region id within the root decoder.
    pub id: u32,
}

impl fmt::Display for RegionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region{}.{}:{}", self.port, self.decoder, self.id)
    }
}

impl FromStr for RegionName {
    type Err = CxlError;

    fn from_str(name: &str) -> Result<Self> {
        parse_region_name(name)
    }
}

/// Formats a region name.
#[must_use]
pub fn format_region_name(port: u32, decoder: u32, id: u32) -> String {
    RegionName { port, decoder, id }.to_string()
}

/// Parses `region<port>.<decoder>:<id>`.
///
/// # Errors
///
/// Returns [`CxlError::InvalidRegionName`] for any other shape.
pub fn parse_region_name(name: &str) -> Result<RegionName> {
    let invalid = || CxlError::InvalidRegionName {
        name: name.to_owned(),
    };
    let rest = name.strip_prefix("region").ok_or_else(invalid)?;
    let (port, rest) = rest.split_once('.').ok_or_else(invalid)?;
    let (decoder, id) = rest.split_once(':').ok_or_else(invalid)?;
    let number = |text: &str| -> Result<u32> {
        if text.is_empty() || !text.bytes().all(|byte| byte.is_ascii_digit()) {
            return Err(invalid());
        }
        text.parse().map_err(|_| invalid())
    };
    Ok(RegionName {
        port: number(port)?,
        decoder: number(decoder)?,
        id: number(id)?,
    })
}

/// Reserves the next region id on `root` and returns the name to create it under.
///
/// # Errors
///
/// Returns [`CxlError::DecoderRemoved`] while the decoder is being torn
/// down and [`CxlError::RegionIdsExhausted`] when no id is left.
pub fn create_region_name(topology: &Topology, root: DecoderId) -> Result<String> {
    let decoder = topology.decoder(root)?;
    let payload = decoder.as_root()?;
    let mut resources = payload.resources();
    if resources.is_removing() {
        return Err(CxlError::DecoderRemoved {
            decoder: decoder.name().to_owned(),
        });
    }
    let id = resources
        .reserve_region_id()
        .ok_or_else(|| CxlError::RegionIdsExhausted {
            decoder: decoder.name().to_owned(),
        })?;
    let name = format_region_name(decoder.port().get(), decoder.id(), id);
    debug!(decoder = decoder.name(), region = %name, "reserved region id");
    Ok(name)
}

/// Creates the region `name` under `root`.
///
/// The name's port and decoder must match `root` and its id must have been
/// reserved by [`create_region_name`].
///
/// # Errors
///
/// Returns [`CxlError::InvalidRegionName`], [`CxlError::RegionNameMismatch`],
/// [`CxlError::RegionIdNotReserved`], or [`CxlError::DecoderRemoved`].
pub fn create_region(topology: &Topology, root: DecoderId, name: &str) -> Result<Arc<Region>> {
    let parsed = parse_region_name(name)?;
    let decoder = topology.decoder(root)?;
    let payload = decoder.as_root()?;
    if parsed.port != decoder.port().get() || parsed.decoder != decoder.id() {
        return Err(CxlError::RegionNameMismatch {
            name: name.to_owned(),
            decoder: decoder.name().to_owned(),
        });
    }

    let mut resources = payload.resources();
    if resources.is_removing() {
        return Err(CxlError::DecoderRemoved {
            decoder: decoder.name().to_owned(),
        });
    }
    if !resources.is_pending(parsed.id) {
        return Err(CxlError::RegionIdNotReserved {
            id: parsed.id,
            decoder: decoder.name().to_owned(),
        });
    }
    let region =
        topology.insert_region(|handle| Region::new(handle, parsed.id, root, parsed.to_string()));
    resources.claim_region_id(parsed.id, region.handle());
    info!(decoder = decoder.name(), region = region.name(), "created region");
    Ok(region)
}

/// Looks up a live region of `root` by name.
///
/// # Errors
///
/// Returns [`CxlError::NotFound`] when `root` owns no region of that name.
pub fn find_region(topology: &Topology, root: DecoderId, name: &str) -> Result<Arc<Region>> {
    let decoder = topology.decoder(root)?;
    let handles = decoder.as_root()?.resources().regions().to_vec();
    handles
        .into_iter()
        .filter_map(|handle| topology.region(handle).ok())
        .find(|region| region.name() == name)
        .ok_or_else(|| CxlError::NotFound {
            kind: "region",
            name: name.to_owned(),
        })
}

/// Deletes the region `name` under `root`, unbinding it first when active.
///
/// # Errors
///
/// Returns the lookup errors of [`find_region`] and the errors of [`remove_region`].
pub fn delete_region(topology: &Topology, root: DecoderId, name: &str) -> Result<()> {
    let region = find_region(topology, root, name)?;
    remove_region(topology, region.handle())
}

/// Tears down and destroys a region.
///
/// Explicit deletion and root decoder teardown both come through here; the
/// region's removal lock lets only one of them proceed. The region id is
/// returned to the root decoder only after hardware and address space have
/// been released.
///
/// # Errors
///
/// Returns [`CxlError::RegionDead`] when another remover got there first,
/// or the first teardown failure. The region is destroyed either way.
pub fn remove_region(topology: &Topology, handle: RegionHandle) -> Result<()> {
    let region = topology.region(handle)?;
    let _removal = region.removal();
    let result = {
        let mut state = region.lock();
        if state.dead {
            return Err(CxlError::RegionDead {
                region: region.name().to_owned(),
            });
        }
        state.dead = true;
        teardown(topology, &region, &mut state)
    };
    if let Err(err) = &result {
        warn!(region = region.name(), error = %err, "teardown incomplete during removal");
    }

    let root = topology.decoder(region.root())?;
    root.as_root()?
        .resources()
        .retire_region(region.id(), handle);
    topology.forget_region(handle);
    info!(region = region.name(), "removed region");
    result
}

/// Stops region creation on `root` and removes every region it owns.
///
/// # Errors
///
/// Returns the first removal failure other than a region already gone.
pub fn remove_root_decoder(topology: &Topology, root: DecoderId) -> Result<()> {
    let decoder = topology.decoder(root)?;
    let handles = {
        let mut resources = decoder.as_root()?.resources();
        resources.start_removal();
        resources.regions().to_vec()
    };
    info!(decoder = decoder.name(), regions = handles.len(), "removing root decoder");
    let mut first_err = None;
    for handle in handles {
        match remove_region(topology, handle) {
            Ok(()) | Err(CxlError::UnknownHandle { .. } | CxlError::RegionDead { .. }) => {}
            Err(err) => {
                first_err.get_or_insert(err);
            }
        }
    }
    first_err.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::{format_region_name, parse_region_name, RegionName};
    use crate::error::CxlError;

    #[test]
    fn names_round_trip_through_text() {
        let name = format_region_name(0, 1, 12);
        assert_eq!(name, "region0.1:12");
        assert_eq!(
            parse_region_name(&name),
            Ok(RegionName {
                port: 0,
                decoder: 1,
                id: 12
            })
        );
        assert_eq!("region3.0:0".parse::<RegionName>().map(|n| n.port), Ok(3));
    }

    #[test]
    fn malformed_names_are_rejected() {
        for bad in [
            "region0.1",
            "decoder0.1:2",
            "region0:1.2",
            "region.1:2",
            "region0.1:+2",
            "region0.1:x",
        ] {
            assert!(
                matches!(parse_region_name(bad), Err(CxlError::InvalidRegionName { .. })),
                "{bad} parsed"
            );
        }
    }
}
