//! Metadata manager (MDM) for flexblock.
//!
//! The manager is the single authority over cluster topology. It owns the
//! cluster store, runs placement and rebuild, tracks node health and issues
//! IO tokens. Storage and client nodes reach it over the control channel;
//! operators use the admin API.

// Panics in metadata operations can leave the topology inconsistent.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod manager;
mod server;

pub use manager::{CreatePool, CreateVolume, MetadataManager};
pub use server::{
    admin_router, dispatch_control, run_admin_server, ApiError, CancelResponse, ControlServer,
    CreateDomainRequest, ExtendVolumeRequest, FailResponse, MapVolumeRequest, RebuildRateRequest,
};
