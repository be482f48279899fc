use serde::{Deserialize, Serialize};

/// Object ID of an audio device, unique within a [`DeviceRegistry`].
///
/// [`DeviceRegistry`]: crate::audio::devices::registry::DeviceRegistry
pub type DeviceId = u32;

/// ID meaning "no device" / "not resolved yet".
pub const DEVICE_UNKNOWN: DeviceId = 0;

/// UID of the virtual device that captures system audio.
pub const VIRTUAL_DEVICE_UID: &str = "PlaythruDevice_UID";

/// UID of the hidden, inert device used while toggling the default device.
pub const NULL_DEVICE_UID: &str = "PlaythruNullDevice_UID";

/// Identifies a registered IO callback on a device.
pub type IoProcId = u64;

/// Identifies a registered property listener.
pub type ListenerId = u64;

/// The master channel/element of a control.
pub const MASTER_CHANNEL: u32 = 0;

/// Property scope, mirroring the input/output/global split of audio objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Input,
    Output,
}

/// The property selectors the playthrough/control-sync core listens for or
/// notifies about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selector {
    /// At least one client is doing IO on the device.
    DeviceIsRunning,
    /// The device's IO thread missed its deadline.
    ProcessorOverload,
    /// A client other than the owning app is doing IO on the virtual device.
    RunningSomewhereOtherThanOwner,
    /// Scalar volume of a control changed.
    VolumeScalar,
    /// Mute state of a control changed.
    Mute,
    /// The virtual device's `[volume, mute]` enabled-controls array changed.
    EnabledOutputControls,
    /// The device's nominal sample rate changed.
    NominalSampleRate,
    /// The set of published devices changed.
    DeviceList,
}

/// A (selector, scope, element) triple identifying one property of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PropertyAddress {
    pub selector: Selector,
    pub scope: Scope,
    pub element: u32,
}

impl PropertyAddress {
    pub const fn global(selector: Selector) -> Self {
        Self {
            selector,
            scope: Scope::Global,
            element: MASTER_CHANNEL,
        }
    }

    pub const fn output_master(selector: Selector) -> Self {
        Self {
            selector,
            scope: Scope::Output,
            element: MASTER_CHANNEL,
        }
    }

    /// Whether a change notification for `changed` should be delivered to a
    /// listener registered at this address. Global listeners hear everything
    /// with the same selector.
    pub fn matches(&self, changed: &PropertyAddress) -> bool {
        self.selector == changed.selector
            && (self.scope == changed.scope
                || self.scope == Scope::Global
                || changed.scope == Scope::Global)
    }
}

/// Index of the volume flag in the enabled-controls array.
pub const ENABLED_CONTROLS_INDEX_VOLUME: usize = 0;
/// Index of the mute flag in the enabled-controls array.
pub const ENABLED_CONTROLS_INDEX_MUTE: usize = 1;

/// Audio device information, as reported to configuration consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: DeviceId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
    pub is_input: bool,
    pub is_output: bool,
    pub sample_rate: f64,
    pub channels: u32,
}

/// Timing info passed to an IO callback for one cycle.
#[derive(Debug, Clone, Copy)]
pub struct IoCycle {
    /// The device's sample time at the start of the cycle.
    pub sample_time: f64,
    /// Host clock time correlated with `sample_time`, in nanoseconds.
    pub host_time: u64,
    /// Frames in this cycle.
    pub frames: usize,
}

/// Number of frames the virtual device's audible state must have changed for
/// before it reports the change. The idle-stop delay is derived from this.
pub const AUDIBLE_STATE_MIN_CHANGED_FRAMES: u64 = 2 << 12;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_address_matching() {
        let listener = PropertyAddress::output_master(Selector::VolumeScalar);
        let changed = PropertyAddress::output_master(Selector::VolumeScalar);
        assert!(listener.matches(&changed));

        let wrong_selector = PropertyAddress::output_master(Selector::Mute);
        assert!(!listener.matches(&wrong_selector));

        let global_listener = PropertyAddress::global(Selector::VolumeScalar);
        assert!(global_listener.matches(&changed));
    }

    #[test]
    fn test_device_info_serialization() {
        let info = DeviceInfo {
            id: 3,
            name: "Test Output".to_string(),
            uid: Some("uid-3".to_string()),
            is_input: false,
            is_output: true,
            sample_rate: 44100.0,
            channels: 2,
        };

        let json = serde_json::to_string(&info).unwrap();
        let back: DeviceInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, 3);
        assert_eq!(back.uid.as_deref(), Some("uid-3"));
    }
}
