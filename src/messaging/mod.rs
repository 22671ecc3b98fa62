// Peer messaging - typed, TTL-bound messages between two devices
//
// Sending only records intent in the outbox. A separate loop drains the
// outbox through the relay and feeds pulled batches back via
// `deliver_queued`, so queued traffic survives a disconnect.

pub mod message;
pub mod router;

pub use message::{MessageStatus, MessageType, PeerMessage};
pub use router::{handler_fn, FnHandler, MessageHandler, PeerMessageRouter};
