//! Batch dispatch policy
//!
//! Routes each batch to an accelerator when one fits, otherwise through
//! the exclusive CPU gate. Both join drivers share this one interface.

use std::mem;
use std::thread;

use crate::geometry::{segments_distance_batch, triangles_intersect_batch};

use super::broker::ResourceBroker;

/// Executes primitive batches against whatever resource the broker grants.
pub struct GeometryComputer {
    broker: ResourceBroker,
    threads: usize,
}

impl GeometryComputer {
    /// `num_threads == 0` resolves to the machine's available parallelism.
    pub fn new(broker: ResourceBroker, num_threads: usize) -> Self {
        let threads = if num_threads == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            num_threads
        };
        Self { broker, threads }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Segment-distance batch; prefers an accelerator with enough free
    /// memory for the staged data, falls back to the CPU gate.
    pub fn get_distance(
        &self,
        data: &[f32],
        offset_size: &[u32],
        distances: &mut [f32],
    ) -> Result<(), anyhow::Error> {
        let staged = data.len() * mem::size_of::<f32>();
        if let Some(device) = self.broker.request_device(staged, false) {
            return device
                .accelerator()
                .segments_distance_batch(data, offset_size, distances);
        }
        self.get_distance_cpu(data, offset_size, distances);
        Ok(())
    }

    /// Segment-distance batch on the CPU gate only.
    pub fn get_distance_cpu(&self, data: &[f32], offset_size: &[u32], distances: &mut [f32]) {
        let _cpu = self.broker.request_cpu();
        segments_distance_batch(data, offset_size, distances, self.threads);
    }

    /// Triangle-intersection batch; always runs on the CPU gate.
    pub fn get_intersect(&self, data: &[f32], offset_size: &[u32], results: &mut [bool]) {
        let _cpu = self.broker.request_cpu();
        triangles_intersect_batch(data, offset_size, results, self.threads);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_fallback_without_devices() {
        let computer = GeometryComputer::new(ResourceBroker::new(), 2);
        let data: Vec<f32> = vec![
            0.0, 0.0, 0.0, 0.0, 1.0, 0.0, //
            4.0, 0.0, 0.0, 4.0, 1.0, 0.0,
        ];
        let offset_size: Vec<u32> = vec![0, 1, 1, 1];
        let mut distances = vec![0.0f32; 1];
        computer
            .get_distance(&data, &offset_size, &mut distances)
            .expect("cpu path is infallible");
        assert!((distances[0] - 4.0).abs() < 1e-5);
    }

    #[test]
    fn test_thread_resolution() {
        let computer = GeometryComputer::new(ResourceBroker::new(), 0);
        assert!(computer.threads() >= 1);
        let fixed = GeometryComputer::new(ResourceBroker::new(), 3);
        assert_eq!(fixed.threads(), 3);
    }
}
