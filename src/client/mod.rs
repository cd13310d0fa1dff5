//! Client side of flexblock: the IO initiator, the transports it and the
//! storage nodes use, and the admin API client.

mod admin;
mod initiator;
mod transport;

pub use admin::AdminClient;
pub use initiator::{split_range, write_quorum, Initiator, InitiatorConfig, IoResult, SubIo};
pub use transport::{AuthorityApi, DataPlane, LocalDataPlane, RemoteAuthority, TcpDataPlane};
