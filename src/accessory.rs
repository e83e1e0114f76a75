//! Accessory-host boundary (consumed interface).
//!
//! The HomeKit SDK owns accessories, services and characteristics; the
//! bridge only drives them through the narrow contract below. Two design
//! points are fixed here rather than inherited from the host SDK:
//!
//! - Controller type tags resolve through the closed [`ControlKind`]
//!   enumeration. An unknown tag is a typed rejection, not a panic or a
//!   silently skipped device.
//! - Characteristic writes from the host are handled by a synchronous
//!   [`SetHandler`] returning a `Result`; the host-SDK adapter translates
//!   that into whatever callback convention the SDK wants.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use crate::controller::StateValue;
use crate::error::{BridgeError, Result};

/// Handler invoked when the host writes a characteristic.
pub type SetHandler = Box<dyn Fn(&StateValue) -> Result<()> + Send + Sync>;

/// One service owned by the host registry.
///
/// `kind` strings name host characteristic types (`"On"`, `"Brightness"`,
/// `"MotionDetected"`, ...); their semantics belong to the host SDK.
pub trait ServiceHandle: Send + Sync {
    /// Set a characteristic's initial/configured value.
    fn set_characteristic(&self, kind: &str, value: StateValue);

    /// Push a live value change to the host.
    fn update_characteristic(&self, kind: &str, value: StateValue);

    /// Register a handler for host-initiated writes.
    fn on_set(&self, kind: &str, handler: SetHandler);
}

/// The accessory-host registry.
pub trait AccessoryRegistry: Send + Sync {
    /// Fetch or create a service of the given kind under a stable subtype.
    fn get_or_create_service(
        &self,
        kind: &str,
        name: &str,
        subtype: &str,
    ) -> Arc<dyn ServiceHandle>;
}

/// Closed set of controller control types the bridge can map.
///
/// The Miniserver reports each control with a free-form type string; the
/// static table in [`from_type_tag`](Self::from_type_tag) is the only
/// place those strings are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlKind {
    Switch,
    Dimmer,
    LightController,
    Jalousie,
    Gate,
    Alarm,
    IntercomVideo,
    Mood,
    AudioZone,
}

impl ControlKind {
    /// Resolve a controller type tag to a control kind.
    ///
    /// Unknown tags yield [`BridgeError::UnsupportedControl`] so the
    /// mapping layer can log and skip the device explicitly.
    pub fn from_type_tag(tag: &str) -> Result<Self> {
        match tag {
            "Switch" | "TimedSwitch" => Ok(Self::Switch),
            "Dimmer" | "EIBDimmer" => Ok(Self::Dimmer),
            "LightControllerV2" => Ok(Self::LightController),
            "Jalousie" => Ok(Self::Jalousie),
            "Gate" => Ok(Self::Gate),
            "Alarm" => Ok(Self::Alarm),
            "Intercom" | "IntercomV2" => Ok(Self::IntercomVideo),
            "Mood" => Ok(Self::Mood),
            "AudioZoneV2" => Ok(Self::AudioZone),
            other => Err(BridgeError::UnsupportedControl(other.to_string())),
        }
    }

    /// Whether accessories of this kind carry a camera pipeline.
    pub fn has_camera(self) -> bool {
        matches!(self, Self::IntercomVideo)
    }

    /// Whether this kind maps to a sub-item of a parent accessory
    /// (moods under a light controller, zones under an audio server).
    pub fn is_sub_item(self) -> bool {
        matches!(self, Self::Mood | Self::AudioZone)
    }
}

/// Name-keyed directory of services sharing one update contract.
///
/// Used for mood switches and audio zones: the controller reports which
/// entry is active and every sibling service is updated by direct
/// iteration over this map.
#[derive(Default)]
pub struct ServiceDirectory {
    services: RwLock<HashMap<String, Arc<dyn ServiceHandle>>>,
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its resolved display name.
    /// Replaces any previous entry with the same name.
    pub fn insert(&self, name: &str, service: Arc<dyn ServiceHandle>) {
        self.services
            .write()
            .insert(name.to_string(), service);
        tracing::debug!(name, "service registered in directory");
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ServiceHandle>> {
        self.services.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.services.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.read().is_empty()
    }

    /// Push `value` to the named characteristic of one service.
    ///
    /// Returns false when no service is registered under `name`.
    pub fn update_service(&self, name: &str, kind: &str, value: StateValue) -> bool {
        match self.get(name) {
            Some(service) => {
                service.update_characteristic(kind, value);
                true
            }
            None => {
                tracing::warn!(name, "update for unknown service");
                false
            }
        }
    }

    /// Update every service: the active one gets `active_value`, all
    /// others `inactive_value`. This is how mood/zone exclusivity is
    /// reflected to the host.
    pub fn update_exclusive(
        &self,
        active_name: &str,
        kind: &str,
        active_value: StateValue,
        inactive_value: StateValue,
    ) {
        let services = self.services.read();
        for (name, service) in services.iter() {
            let value = if name == active_name {
                active_value.clone()
            } else {
                inactive_value.clone()
            };
            service.update_characteristic(kind, value);
        }
    }

    /// Drop all registered services (start of a new mapping pass).
    pub fn clear(&self) {
        self.services.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingService {
        updates: Mutex<Vec<(String, StateValue)>>,
    }

    impl ServiceHandle for RecordingService {
        fn set_characteristic(&self, _kind: &str, _value: StateValue) {}

        fn update_characteristic(&self, kind: &str, value: StateValue) {
            self.updates.lock().push((kind.to_string(), value));
        }

        fn on_set(&self, _kind: &str, _handler: SetHandler) {}
    }

    // --- ControlKind lookup ---

    #[test]
    fn known_tags_resolve() {
        assert_eq!(
            ControlKind::from_type_tag("Jalousie").unwrap(),
            ControlKind::Jalousie
        );
        assert_eq!(
            ControlKind::from_type_tag("IntercomV2").unwrap(),
            ControlKind::IntercomVideo
        );
    }

    #[test]
    fn unknown_tag_is_typed_rejection() {
        let err = ControlKind::from_type_tag("Hyperdrive").unwrap_err();
        assert!(matches!(err, BridgeError::UnsupportedControl(t) if t == "Hyperdrive"));
    }

    #[test]
    fn camera_and_sub_item_flags() {
        assert!(ControlKind::IntercomVideo.has_camera());
        assert!(!ControlKind::Switch.has_camera());
        assert!(ControlKind::Mood.is_sub_item());
        assert!(!ControlKind::Gate.is_sub_item());
    }

    // --- ServiceDirectory ---

    #[test]
    fn update_unknown_service_is_reported() {
        let dir = ServiceDirectory::new();
        assert!(!dir.update_service("nope", "On", StateValue::Number(1.0)));
    }

    #[test]
    fn update_exclusive_fans_out() {
        let dir = ServiceDirectory::new();
        let a = Arc::new(RecordingService::default());
        let b = Arc::new(RecordingService::default());
        dir.insert("Morning", a.clone());
        dir.insert("Evening", b.clone());

        dir.update_exclusive(
            "Morning",
            "On",
            StateValue::Number(1.0),
            StateValue::Number(0.0),
        );

        assert_eq!(a.updates.lock().as_slice(), &[("On".to_string(), StateValue::Number(1.0))]);
        assert_eq!(b.updates.lock().as_slice(), &[("On".to_string(), StateValue::Number(0.0))]);
    }

    #[test]
    fn clear_empties_directory() {
        let dir = ServiceDirectory::new();
        dir.insert("One", Arc::new(RecordingService::default()));
        assert_eq!(dir.len(), 1);
        dir.clear();
        assert!(dir.is_empty());
    }
}
