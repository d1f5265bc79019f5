//! Fixed set of replication counters

use crate::Stat;

#[derive(Debug, Default, Clone)]
pub struct StatCounters {
    values: [u64; Stat::COUNT],
}

impl StatCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, stat: Stat, value: u64) {
        self.values[stat.index()] += value;
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.values[stat.index()]
    }

    /// Fold another component's counters into this one.
    pub fn merge(&mut self, other: &StatCounters) {
        for stat in Stat::ALL {
            self.values[stat.index()] += other.get(stat);
        }
    }

    pub fn reset_all(&mut self) {
        self.values = [0; Stat::COUNT];
    }

    pub fn iter(&self) -> impl Iterator<Item = (Stat, u64)> + '_ {
        Stat::ALL.iter().map(move |&stat| (stat, self.get(stat)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_adds_per_stat() {
        let mut a = StatCounters::new();
        let mut b = StatCounters::new();
        a.increment(Stat::UpdatesSent, 2);
        b.increment(Stat::UpdatesSent, 3);
        b.increment(Stat::Desyncs, 1);
        a.merge(&b);
        assert_eq!(a.get(Stat::UpdatesSent), 5);
        assert_eq!(a.get(Stat::Desyncs), 1);
        a.reset_all();
        assert_eq!(a.iter().map(|(_, v)| v).sum::<u64>(), 0);
    }
}
