use crate::device::{Device, DeviceRegistry};
use crate::errors::CoordError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use uuid::Uuid;

/// How a winner is chosen among several online devices
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ResponderMode {
    /// Lowest priority number wins; ties go to the lowest device id
    PriorityBased,
    /// Most recent last-seen wins; ties go to the lowest device id
    LastActive,
    /// A pinned device wins while online
    Manual { device_id: Uuid },
}

impl ResponderMode {
    /// Parse the config vocabulary: "priority", "last_active", "manual".
    pub fn parse(mode: &str, pinned: Option<Uuid>) -> Result<Self, CoordError> {
        match mode.trim() {
            "priority" | "priority_based" => Ok(ResponderMode::PriorityBased),
            "last_active" => Ok(ResponderMode::LastActive),
            "manual" => pinned
                .map(|device_id| ResponderMode::Manual { device_id })
                .ok_or_else(|| {
                    CoordError::InvalidConfig("manual responder mode needs a pinned device".to_string())
                }),
            other => Err(CoordError::UnknownVariant {
                field: "responder mode",
                value: other.to_string(),
                expected: "priority, last_active, manual",
            }),
        }
    }
}

/// Whether simultaneous voice sessions on several devices are allowed.
/// Left as configuration: there is no agreed answer yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrentVoicePolicy {
    /// Voice goes through the normal election like any interaction
    #[default]
    ElectOne,
    /// Every device may answer a voice interaction started on it
    AllowConcurrent,
}

/// What kind of event is asking "should I act?"
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Chat,
    Voice,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponderDecision {
    ThisDevice,
    OtherDevice(Device),
    NoDeviceAvailable,
    /// Only one device is online, whichever it is
    SingleDevice(Device),
}

impl ResponderDecision {
    pub fn is_this_device(&self, local_id: Uuid) -> bool {
        match self {
            ResponderDecision::ThisDevice => true,
            ResponderDecision::SingleDevice(d) => d.id == local_id,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviceResponderPolicy {
    pub mode: ResponderMode,
    pub voice: ConcurrentVoicePolicy,
}

impl DeviceResponderPolicy {
    pub fn new(mode: ResponderMode) -> Self {
        Self {
            mode,
            voice: ConcurrentVoicePolicy::default(),
        }
    }

    pub fn with_voice_policy(mut self, voice: ConcurrentVoicePolicy) -> Self {
        self.voice = voice;
        self
    }

    /// Decide who answers, given a registry snapshot.
    pub fn evaluate_responder(
        &self,
        devices: &[Device],
        local_id: Uuid,
        now: DateTime<Utc>,
    ) -> ResponderDecision {
        let online: Vec<&Device> = devices
            .iter()
            .filter(|d| d.id == local_id || d.is_online_at(now))
            .collect();

        match online.len() {
            0 => return ResponderDecision::NoDeviceAvailable,
            1 => return ResponderDecision::SingleDevice(online[0].clone()),
            _ => {}
        }

        let winner = match self.mode {
            ResponderMode::PriorityBased => online.iter().min_by_key(|d| (d.priority, d.id)).copied(),
            ResponderMode::LastActive => online
                .iter()
                .min_by_key(|d| (Reverse(d.last_seen), d.id))
                .copied(),
            ResponderMode::Manual { device_id } => online
                .iter()
                .find(|d| d.id == device_id)
                .or_else(|| online.iter().find(|d| d.id == local_id))
                .copied(),
        };

        match winner {
            None => ResponderDecision::NoDeviceAvailable,
            Some(d) if d.id == local_id => ResponderDecision::ThisDevice,
            Some(d) => ResponderDecision::OtherDevice(d.clone()),
        }
    }

    /// Same as `evaluate_responder`, honouring the concurrent voice setting.
    pub fn evaluate_interaction(
        &self,
        kind: InteractionKind,
        devices: &[Device],
        local_id: Uuid,
        now: DateTime<Utc>,
    ) -> ResponderDecision {
        if kind == InteractionKind::Voice
            && self.voice == ConcurrentVoicePolicy::AllowConcurrent
            && devices.iter().any(|d| d.id == local_id)
        {
            return ResponderDecision::ThisDevice;
        }
        self.evaluate_responder(devices, local_id, now)
    }

    pub fn should_this_device_respond(&self, devices: &[Device], local_id: Uuid, now: DateTime<Utc>) -> bool {
        self.evaluate_responder(devices, local_id, now)
            .is_this_device(local_id)
    }

    /// Evaluate against the live registry.
    pub async fn evaluate_registry(&self, kind: InteractionKind, registry: &DeviceRegistry) -> ResponderDecision {
        let devices = registry.snapshot().await;
        self.evaluate_interaction(kind, &devices, registry.local_id(), Utc::now())
    }
}

impl Default for DeviceResponderPolicy {
    fn default() -> Self {
        Self::new(ResponderMode::PriorityBased)
    }
}
