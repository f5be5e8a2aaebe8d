// Delay plan computation for latency compensation.
//
// Simultaneous outputs stay phase-aligned by delaying every enabled
// device relative to the slowest one: the highest-latency device plays
// undelayed, everything else waits out the difference.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Per-device compensation delays in milliseconds, keyed by sink name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayPlan {
    delays: BTreeMap<String, u32>,
}

impl DelayPlan {
    /// Compensation delay for a device, 0 if the device is not in the plan.
    pub fn delay_for(&self, name: &str) -> u32 {
        self.delays.get(name).copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.delays.is_empty()
    }

    pub fn len(&self) -> usize {
        self.delays.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.delays.iter().map(|(name, delay)| (name.as_str(), *delay))
    }
}

/// Build the delay plan for the enabled device set.
///
/// With sync compensation on, the device with the highest estimated
/// latency is the reference (delay 0) and every other device gets
/// `max_latency - own_latency`. A single enabled device never gets a
/// delay: there is nothing to synchronize against. With compensation
/// off, every delay is 0.
///
/// Latency ties are broken by picking the lexicographically smallest
/// name as reference; the tied devices all end up with delay 0 either
/// way, so the tie-break only pins which device is reported.
pub fn build_delay_plan<'a, I>(enabled: I, sync_enabled: bool) -> DelayPlan
where
    I: IntoIterator<Item = (&'a str, u32)>,
{
    let devices: Vec<(&str, u32)> = enabled.into_iter().collect();

    if devices.is_empty() {
        return DelayPlan::default();
    }

    let mut delays = BTreeMap::new();
    if !sync_enabled || devices.len() == 1 {
        for (name, _) in &devices {
            delays.insert((*name).to_string(), 0);
        }
        return DelayPlan { delays };
    }

    let Some((reference, max_latency)) = devices
        .iter()
        .copied()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
    else {
        return DelayPlan { delays };
    };

    for (name, latency) in &devices {
        delays.insert((*name).to_string(), max_latency.saturating_sub(*latency));
    }

    debug!(
        "Computed delay plan: reference={} ({}ms), delays={:?}",
        reference, max_latency, delays
    );

    DelayPlan { delays }
}
