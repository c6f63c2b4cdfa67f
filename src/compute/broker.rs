//! Resource arbitration for batch computation
//!
//! A single exclusive CPU gate (one batch executes at a time, fanning out
//! internally) and zero or more accelerator slots. Requests either block
//! until a resource frees or return `None` so the caller can fall back.

use std::sync::Mutex;
use std::thread;
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_micros(10);

/// A batch accelerator occupying one device slot.
///
/// The engine only ever offloads the distance kernel; intersection batches
/// stay on the CPU.
pub trait Accelerator: Send + Sync {
    /// Bytes of device memory currently available for staging a batch.
    fn free_memory(&self) -> usize;

    /// Run the segment-distance batch on the device. Result `i` must
    /// correspond to pair `i` exactly as on the CPU path.
    fn segments_distance_batch(
        &self,
        data: &[f32],
        offset_size: &[u32],
        distances: &mut [f32],
    ) -> Result<(), anyhow::Error>;
}

struct DeviceSlot {
    accelerator: Box<dyn Accelerator>,
    busy: Mutex<bool>,
}

/// Arbitration point for the CPU gate and the accelerator slots.
pub struct ResourceBroker {
    cpu_busy: Mutex<bool>,
    devices: Vec<DeviceSlot>,
}

impl ResourceBroker {
    pub fn new() -> Self {
        Self::with_devices(Vec::new())
    }

    pub fn with_devices(devices: Vec<Box<dyn Accelerator>>) -> Self {
        Self {
            cpu_busy: Mutex::new(false),
            devices: devices
                .into_iter()
                .map(|accelerator| DeviceSlot {
                    accelerator,
                    busy: Mutex::new(false),
                })
                .collect(),
        }
    }

    pub fn has_devices(&self) -> bool {
        !self.devices.is_empty()
    }

    /// Acquire the exclusive CPU gate, blocking until it frees.
    pub fn request_cpu(&self) -> CpuGuard<'_> {
        loop {
            {
                let mut busy = self.cpu_busy.lock().unwrap();
                if !*busy {
                    *busy = true;
                    return CpuGuard { broker: self };
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Acquire an idle device with more than `min_bytes` free.
    ///
    /// With `force` the call blocks until a fitting slot frees; otherwise
    /// it returns `None` and the caller decides the fallback.
    pub fn request_device(&self, min_bytes: usize, force: bool) -> Option<DeviceGuard<'_>> {
        if self.devices.is_empty() {
            return None;
        }
        loop {
            for slot in &self.devices {
                if slot.accelerator.free_memory() <= min_bytes {
                    continue;
                }
                let mut busy = slot.busy.lock().unwrap();
                if !*busy {
                    *busy = true;
                    return Some(DeviceGuard { slot });
                }
            }
            if !force {
                return None;
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Default for ResourceBroker {
    fn default() -> Self {
        Self::new()
    }
}

/// Holds the CPU gate; released on drop.
pub struct CpuGuard<'a> {
    broker: &'a ResourceBroker,
}

impl Drop for CpuGuard<'_> {
    fn drop(&mut self) {
        *self.broker.cpu_busy.lock().unwrap() = false;
    }
}

/// Holds one device slot; released on drop.
pub struct DeviceGuard<'a> {
    slot: &'a DeviceSlot,
}

impl DeviceGuard<'_> {
    pub fn accelerator(&self) -> &dyn Accelerator {
        self.slot.accelerator.as_ref()
    }
}

impl Drop for DeviceGuard<'_> {
    fn drop(&mut self) {
        *self.slot.busy.lock().unwrap() = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FakeAccelerator {
        memory: usize,
        calls: AtomicUsize,
    }

    impl Accelerator for FakeAccelerator {
        fn free_memory(&self) -> usize {
            self.memory
        }

        fn segments_distance_batch(
            &self,
            _data: &[f32],
            _offset_size: &[u32],
            distances: &mut [f32],
        ) -> Result<(), anyhow::Error> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            distances.fill(0.0);
            Ok(())
        }
    }

    #[test]
    fn test_cpu_gate_is_exclusive() {
        let broker = Arc::new(ResourceBroker::new());
        let inside = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let broker = Arc::clone(&broker);
            let inside = Arc::clone(&inside);
            let overlaps = Arc::clone(&overlaps);
            handles.push(thread::spawn(move || {
                for _ in 0..20 {
                    let _cpu = broker.request_cpu();
                    if inside.swap(true, Ordering::SeqCst) {
                        overlaps.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_micros(50));
                    inside.store(false, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(overlaps.load(Ordering::SeqCst), 0, "two batches held the gate at once");
    }

    #[test]
    fn test_request_device_without_devices() {
        let broker = ResourceBroker::new();
        assert!(!broker.has_devices());
        assert!(broker.request_device(1024, false).is_none());
    }

    #[test]
    fn test_request_device_respects_memory_and_busy() {
        let broker = ResourceBroker::with_devices(vec![Box::new(FakeAccelerator {
            memory: 1 << 20,
            calls: AtomicUsize::new(0),
        })]);

        // does not fit
        assert!(broker.request_device(1 << 20, false).is_none());

        // fits; second request finds the slot busy
        let guard = broker.request_device(1024, false).expect("device should be free");
        assert!(broker.request_device(1024, false).is_none());
        drop(guard);
        assert!(broker.request_device(1024, false).is_some());
    }
}
