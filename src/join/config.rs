//! Join configuration
//!
//! LOD schedule and resource knobs for a join run.

use serde::{Deserialize, Serialize};

/// Configuration for a spatial-join run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinConfig {
    /// First LOD of the progressive loop, in `[0, 100]`.
    pub base_lod: u32,
    /// Final LOD; measurements at this level are exact.
    pub top_lod: u32,
    /// Stride between LOD rounds, in `(0, 100]`.
    pub lod_gap: u32,
    /// Prefer an accelerator for distance batches when one fits.
    pub with_gpu: bool,
    /// Worker threads per batch; 0 means the machine's parallelism.
    pub num_threads: usize,
}

impl Default for JoinConfig {
    fn default() -> Self {
        Self {
            base_lod: 0,
            top_lod: 100,
            lod_gap: 50,
            with_gpu: false,
            num_threads: 0,
        }
    }
}

impl JoinConfig {
    pub fn from_json(json: &str) -> Result<Self, anyhow::Error> {
        let config: JoinConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.top_lod > 100 {
            return Err(anyhow::anyhow!("top_lod {} out of [0, 100]", self.top_lod));
        }
        if self.base_lod > self.top_lod {
            return Err(anyhow::anyhow!(
                "base_lod {} above top_lod {}",
                self.base_lod,
                self.top_lod
            ));
        }
        if self.lod_gap == 0 || self.lod_gap > 100 {
            return Err(anyhow::anyhow!("lod_gap {} out of (0, 100]", self.lod_gap));
        }
        Ok(())
    }

    /// The LOD schedule `base, base+gap, ...`; the top LOD is always the
    /// last entry.
    pub fn lods(&self) -> Vec<u32> {
        let mut lods = Vec::new();
        let mut lod = self.base_lod;
        while lod < self.top_lod {
            lods.push(lod);
            lod += self.lod_gap;
        }
        lods.push(self.top_lod);
        lods
    }
}
