use playthru::audio::devices::registry::DeviceRegistry;
use playthru::audio::devices::simulated::{SimulatedCapabilities, SimulatedDevice};
use playthru::audio::devices::{AudioDevice, DeviceHandle};
use playthru::audio::types::{Scope, MASTER_CHANNEL, VIRTUAL_DEVICE_UID};
use playthru::{DeviceManager, PlaythroughStatus};
use serial_test::serial;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(test)]
mod manager_tests {
    use super::*;

    const FRAMES_PER_CYCLE: usize = 512;

    fn poll_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let limit = Instant::now() + deadline;
        while Instant::now() < limit {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn speakers(registry: &DeviceRegistry) -> Arc<SimulatedDevice> {
        let device = Arc::new(SimulatedDevice::with_generated_uid(
            registry.allocate_device_id(),
            "Speakers",
            Default::default(),
        ));
        // A high nominal rate keeps stop's cycle-sized wind-down wait and the
        // idle-stop delay short.
        device.set_nominal_sample_rate(2_000_000.0).unwrap();
        registry.register(DeviceHandle::new(
            Arc::clone(&device) as Arc<dyn AudioDevice>
        ));
        device
    }

    /// The full wiring: a client renders into the virtual device, playthrough
    /// starts itself, and the audio comes out of the chosen output device.
    #[test]
    #[serial]
    fn test_client_audio_reaches_output_device() {
        playthru::log::init();
        let registry = Arc::new(DeviceRegistry::new());
        let manager = DeviceManager::new(Arc::clone(&registry));
        let output = speakers(&registry);
        // Unity volume so the rendered frames come through unscaled.
        output.set_volume(Scope::Output, MASTER_CHANNEL, 1.0).unwrap();

        manager
            .set_output_device(
                DeviceHandle::new(Arc::clone(&output) as Arc<dyn AudioDevice>),
                false,
            )
            .unwrap();

        let virtual_device = Arc::clone(manager.virtual_device());
        let client = virtual_device.register_client("music app", false).unwrap();
        virtual_device.start_io(client).unwrap();
        assert!(poll_until(Duration::from_secs(5), || {
            manager.playthrough().is_playing_through()
        }));

        let signal: Vec<f32> = (0..FRAMES_PER_CYCLE * 2)
            .map(|i| (i % 89) as f32 / 89.0 + 0.01)
            .collect();
        let mut sample_time = 0.0;
        for _ in 0..4 {
            virtual_device
                .process_client_output(client, sample_time as i64, &signal)
                .unwrap();
            virtual_device.run_capture_cycle(sample_time, 0, FRAMES_PER_CYCLE);
            let rendered = output.run_output_cycle(sample_time, 0, FRAMES_PER_CYCLE);
            assert_eq!(rendered, signal);
            sample_time += FRAMES_PER_CYCLE as f64;
        }

        virtual_device.stop_io(client).unwrap();
    }

    /// Changing the virtual device's controls reaches the output device
    /// through the control sync.
    #[test]
    #[serial]
    fn test_virtual_controls_mirror_to_output_device() {
        let registry = Arc::new(DeviceRegistry::new());
        let manager = DeviceManager::new(Arc::clone(&registry));
        let output = speakers(&registry);
        manager
            .set_output_device(
                DeviceHandle::new(Arc::clone(&output) as Arc<dyn AudioDevice>),
                false,
            )
            .unwrap();

        let virtual_device = manager.virtual_device();
        virtual_device
            .set_volume(Scope::Output, MASTER_CHANNEL, 0.3)
            .unwrap();
        assert_eq!(output.volume(Scope::Output, MASTER_CHANNEL).unwrap(), 0.3);

        virtual_device
            .set_mute(Scope::Output, MASTER_CHANNEL, true)
            .unwrap();
        assert!(output.mute(Scope::Output, MASTER_CHANNEL).unwrap());
    }

    /// The synchronous start reports `Started` once the output device's
    /// callback is running, and a stop leaves the manager reusable.
    #[test]
    #[serial]
    fn test_start_playthrough_sync_with_running_output() {
        let registry = Arc::new(DeviceRegistry::new());
        let manager = DeviceManager::new(Arc::clone(&registry));
        let output = speakers(&registry);
        manager
            .set_output_device(
                DeviceHandle::new(Arc::clone(&output) as Arc<dyn AudioDevice>),
                false,
            )
            .unwrap();

        let shutdown = Arc::new(AtomicBool::new(false));
        let driver = {
            let output = Arc::clone(&output);
            let shutdown = Arc::clone(&shutdown);
            std::thread::spawn(move || {
                let mut t = 0.0;
                while !shutdown.load(Ordering::Acquire) {
                    output.run_output_cycle(t, 0, FRAMES_PER_CYCLE);
                    t += FRAMES_PER_CYCLE as f64;
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };

        assert_eq!(manager.start_playthrough_sync(), PlaythroughStatus::Started);
        manager.stop_playthrough().unwrap();
        assert!(!manager.playthrough().is_playing_through());

        shutdown.store(true, Ordering::Release);
        driver.join().unwrap();
    }

    /// Switching to an output device whose controls differ kicks off the
    /// default-device toggle; once it settles, the virtual device is the
    /// default again and the Null Device is hidden.
    #[test]
    #[serial]
    fn test_control_list_change_toggles_default_device_and_settles() {
        let registry = Arc::new(DeviceRegistry::new());
        let manager = DeviceManager::new(Arc::clone(&registry));

        let headphones = Arc::new(SimulatedDevice::with_generated_uid(
            registry.allocate_device_id(),
            "Headphones",
            SimulatedCapabilities::per_channel_only(),
        ));
        registry.register(DeviceHandle::new(
            Arc::clone(&headphones) as Arc<dyn AudioDevice>
        ));

        manager
            .set_output_device(
                DeviceHandle::new(Arc::clone(&headphones) as Arc<dyn AudioDevice>),
                false,
            )
            .unwrap();

        // The virtual device's volume control disappeared to match the
        // headphones; mute stayed.
        let virtual_device = manager.virtual_device();
        assert!(!virtual_device.has_volume(Scope::Output, MASTER_CHANNEL));
        assert!(virtual_device.has_mute(Scope::Output, MASTER_CHANNEL));

        // The toggle runs through its deferred phases and puts everything
        // back.
        assert!(poll_until(Duration::from_secs(10), || {
            let default_is_virtual = registry
                .default_output_device()
                .map(|device| device.uid() == VIRTUAL_DEVICE_UID)
                .unwrap_or(false);
            default_is_virtual && !registry.null_device_enabled()
        }));
    }
}
