// Activity estimation for long-lived flows
//
// Connection tables say nothing about traffic on a flow that is already
// open. To keep the dashboard moving, each cycle every established flow of
// the watched process gets a coin flip; a hit becomes an estimated burst of
// `min_size..max_size` bytes.

use crate::config::ActivityConfig;
use crate::connection::{ConnectionRecord, ConnectionState};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub struct ActivityEstimator {
    rng: StdRng,
    enabled: bool,
    probability: f64,
    min_size: u64,
    max_size: u64,
}

impl ActivityEstimator {
    pub fn new(config: &ActivityConfig) -> Self {
        Self::with_rng(config, StdRng::from_entropy())
    }

    pub fn with_rng(config: &ActivityConfig, rng: StdRng) -> Self {
        Self {
            rng,
            enabled: config.enabled,
            probability: config.probability.clamp(0.0, 1.0),
            min_size: config.min_size,
            max_size: config.max_size.max(config.min_size + 1),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Pick the flows of `pid` that "carried traffic" this cycle, with an
    /// estimated size for each
    pub fn sample<'a>(
        &mut self,
        rows: &'a [ConnectionRecord],
        pid: u32,
    ) -> Vec<(&'a ConnectionRecord, u64)> {
        if !self.enabled {
            return Vec::new();
        }

        rows.iter()
            .filter(|row| row.owner_pid == pid && row.state == ConnectionState::Established)
            .filter_map(|row| {
                if self.rng.gen_bool(self.probability) {
                    Some((row, self.rng.gen_range(self.min_size..self.max_size)))
                } else {
                    None
                }
            })
            .collect()
    }
}
