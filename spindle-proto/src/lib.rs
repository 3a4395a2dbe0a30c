//! Wire protocol for the spindle replication consumer.
//!
//! A small DER-flavored BER codec plus the sync protocol elements layered on
//! it: the sync request control the consumer sends, and the state/done/info
//! elements providers send back. Provider traffic surfaces as tagged
//! [`message::ProviderMessage`] variants; nothing here touches the network.

pub mod ber;
pub mod controls;
pub mod message;

pub use ber::{BerReader, BerWriter, ProtoError};
pub use controls::{
    DirSyncRequest, DirSyncResponse, SyncDoneControl, SyncInfoMessage, SyncMode, SyncRequestControl,
    SyncState, SyncStateControl,
};
pub use message::{ProviderMessage, ResultCode, SearchEntry, SearchResult};
