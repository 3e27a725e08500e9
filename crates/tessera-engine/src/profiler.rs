// Profiler — Per-kernel wall time, aggregated by op name and by lane
//
// Enabled with `EngineConfig::profiling(true)`. Every lane records the time
// spent in each kernel it runs (skipped kernels of failed dependency chains
// included, at near-zero cost). `Engine::profile_report()` aggregates the
// records into a printable table.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use parking_lot::Mutex;

use crate::op::LaneId;

/// A single kernel execution.
#[derive(Debug, Clone)]
pub struct OpRecord {
    pub name: String,
    pub lane: LaneId,
    pub duration: Duration,
}

/// Collects [`OpRecord`]s from all lanes.
#[derive(Debug, Default)]
pub struct Profiler {
    records: Mutex<Vec<OpRecord>>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record(&self, name: &str, lane: LaneId, duration: Duration) {
        self.records.lock().push(OpRecord {
            name: name.to_string(),
            lane,
            duration,
        });
    }

    /// Copy of every record so far.
    pub fn records(&self) -> Vec<OpRecord> {
        self.records.lock().clone()
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    /// Aggregate the records by op name and by lane.
    pub fn report(&self) -> ProfileReport {
        let records = self.records.lock();

        let mut by_name: HashMap<&str, Vec<Duration>> = HashMap::new();
        let mut by_lane: HashMap<LaneId, (usize, Duration)> = HashMap::new();
        for r in records.iter() {
            by_name.entry(&r.name).or_default().push(r.duration);
            let lane = by_lane.entry(r.lane).or_default();
            lane.0 += 1;
            lane.1 += r.duration;
        }

        let mut entries: Vec<ProfileEntry> = by_name
            .into_iter()
            .map(|(name, durations)| {
                let count = durations.len();
                let total: Duration = durations.iter().sum();
                let min = durations.iter().min().copied().unwrap_or_default();
                let max = durations.iter().max().copied().unwrap_or_default();
                let avg = total / count as u32;
                ProfileEntry {
                    name: name.to_string(),
                    count,
                    total,
                    min,
                    max,
                    avg,
                }
            })
            .collect();
        // Sort by total time descending
        entries.sort_by(|a, b| b.total.cmp(&a.total).then_with(|| a.name.cmp(&b.name)));

        let mut lanes: Vec<LaneBusy> = by_lane
            .into_iter()
            .map(|(lane, (ops, busy))| LaneBusy { lane, ops, busy })
            .collect();
        lanes.sort_by_key(|l| l.lane.to_string());

        let total = records.iter().map(|r| r.duration).sum();
        ProfileReport {
            entries,
            lanes,
            total,
        }
    }
}

/// Aggregated statistics for a single op name.
#[derive(Debug, Clone)]
pub struct ProfileEntry {
    pub name: String,
    pub count: usize,
    pub total: Duration,
    pub min: Duration,
    pub max: Duration,
    pub avg: Duration,
}

/// How busy one lane was.
#[derive(Debug, Clone)]
pub struct LaneBusy {
    pub lane: LaneId,
    pub ops: usize,
    pub busy: Duration,
}

/// A formatted profiling report, printed with `Display`.
#[derive(Debug, Clone)]
pub struct ProfileReport {
    pub entries: Vec<ProfileEntry>,
    pub lanes: Vec<LaneBusy>,
    /// Sum of all kernel times (not wall time: lanes overlap).
    pub total: Duration,
}

impl ProfileReport {
    pub fn entry(&self, name: &str) -> Option<&ProfileEntry> {
        self.entries.iter().find(|e| e.name == name)
    }
}

impl fmt::Display for ProfileReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Tessera engine profile")?;
        writeln!(
            f,
            "{:<24} {:>6} {:>12} {:>12} {:>22} {:>7}",
            "Op", "Count", "Total", "Avg", "Min/Max", "%"
        )?;
        for entry in &self.entries {
            let pct = if self.total.as_nanos() > 0 {
                (entry.total.as_nanos() as f64 / self.total.as_nanos() as f64) * 100.0
            } else {
                0.0
            };
            let min_max = format!("{:.2?}/{:.2?}", entry.min, entry.max);
            writeln!(
                f,
                "{:<24} {:>6} {:>12.2?} {:>12.2?} {:>22} {:>6.1}%",
                truncate_str(&entry.name, 24),
                entry.count,
                entry.total,
                entry.avg,
                min_max,
                pct
            )?;
        }
        writeln!(f)?;
        writeln!(f, "{:<24} {:>6} {:>12}", "Lane", "Ops", "Busy")?;
        for lane in &self.lanes {
            writeln!(
                f,
                "{:<24} {:>6} {:>12.2?}",
                lane.lane.to_string(),
                lane.ops,
                lane.busy
            )?;
        }
        writeln!(f, "Total kernel time: {:.2?}", self.total)
    }
}

fn truncate_str(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max - 1).collect();
        format!("{head}…")
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::LaneKind;
    use tessera_core::Device;

    fn lane(index: usize) -> LaneId {
        LaneId {
            device: Device::cpu(),
            kind: LaneKind::Compute,
            index,
        }
    }

    #[test]
    fn test_report_aggregates_by_name_and_lane() {
        let p = Profiler::new();
        p.record("add", lane(0), Duration::from_millis(2));
        p.record("add", lane(1), Duration::from_millis(4));
        p.record("dot", lane(0), Duration::from_millis(10));

        let report = p.report();
        assert_eq!(report.total, Duration::from_millis(16));
        assert_eq!(report.entries[0].name, "dot");
        let add = report.entry("add").unwrap();
        assert_eq!(add.count, 2);
        assert_eq!(add.avg, Duration::from_millis(3));
        assert_eq!(add.min, Duration::from_millis(2));

        assert_eq!(report.lanes.len(), 2);
        assert_eq!(report.lanes[0].ops, 2);
        assert_eq!(report.lanes[0].busy, Duration::from_millis(12));

        let text = report.to_string();
        assert!(text.contains("dot"));
        assert!(text.contains("cpu(0)/compute#1"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate_str("short", 10), "short");
        assert_eq!(truncate_str("abcdefghij", 5), "abcd…");
    }
}
