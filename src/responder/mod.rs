// Responder election - which single online device answers an interaction
//
// Pure and side-effect free: it reads a registry snapshot and returns a
// decision, so it is safe to call on every inbound event. Cases the local
// view cannot settle alone (a remote chat message landing on several online
// devices at once) are additionally gated by a relay lock, see `relay::lock`.

pub mod policy;

pub use policy::{
    ConcurrentVoicePolicy, DeviceResponderPolicy, InteractionKind, ResponderDecision, ResponderMode,
};
