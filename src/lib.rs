// Devicemesh - peer coordination for a multi-device assistant
// Library exports

pub mod config;
pub mod coordinator;
pub mod device;
pub mod errors;
pub mod messaging;
pub mod metrics;
pub mod relay;
pub mod responder;
pub mod scheduling;

pub use coordinator::{Coordinator, CoordinatorOptions, Submission, TickReport};
pub use device::{Device, DeviceClass, DeviceRegistry, LocalIdentity};
pub use errors::CoordError;
pub use messaging::{MessageStatus, MessageType, PeerMessage, PeerMessageRouter};
pub use responder::{DeviceResponderPolicy, InteractionKind, ResponderDecision, ResponderMode};
pub use scheduling::{Task, TaskPriority, TaskQueue, TaskStatus};
