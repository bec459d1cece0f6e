//! SamePage sync protocol reference implementation.
//! Host-driven: no I/O; host passes events and receives actions.

pub mod boundary;
pub mod chunk;
pub mod config;
pub mod connection;
pub mod core;
pub mod crdt;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod integrity;
pub mod p2p;
pub mod page;
pub mod patch;
pub mod protocol;
pub mod wire;

pub use boundary::{Backend, BackendError, HostApp, HostError, QuotaResource, QuotaStatus, UnmarkedMessage};
pub use chunk::{Frame, Ingest, Reassembler};
pub use config::Config;
pub use connection::ConnectionStatus;
pub use self::core::{Channel, OutboundAction, SamePageCore, Session};
pub use crdt::{DocumentView, RangeAnnotation};
pub use error::{Error, ErrorKind, Result};
pub use events::{Event, Intent, SubscriptionId};
pub use identity::{AppId, Notebook, NotebookId};
pub use page::{PageState, PendingNotification};
pub use patch::{Patch, PatchOp};
pub use protocol::{LogicalMessage, Target, PROTOCOL_VERSION};
pub use wire::{decode_frame, encode_frame, FrameDecodeError, FrameEncodeError, LinkMessage};
