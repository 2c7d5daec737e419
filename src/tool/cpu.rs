//! Cumulative CPU time of a child process and everything it started.
//!
//! The watchdog only needs to know whether a tool is still doing work, so
//! the probe reports a monotonic CPU total and the caller compares samples.
//! Tools are often launched through a wrapper script whose real work happens
//! in a grandchild, so the total covers the whole process tree: the tool's
//! process group plus any descendant that moved out of it.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};

/// Reports the cumulative CPU time consumed by a tool.
pub trait CpuProbe: Send {
    /// CPU time used so far by the tool rooted at `pid` and its
    /// descendants, or `None` if it cannot be read (the tool exited or the
    /// platform refused).
    fn cpu_time(&mut self, pid: u32) -> Option<Duration>;
}

/// One process as seen in `/proc/<pid>/stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatLine {
    /// Parent pid
    pub ppid: u32,
    /// Process group id
    pub pgrp: u32,
    /// `utime + stime + cutime + cstime`
    pub ticks: u64,
}

/// Sums `utime + stime + cutime + cstime` over every `/proc/<pid>/stat` in
/// the tool's process tree.
#[cfg(target_os = "linux")]
#[derive(Debug, Clone)]
pub struct ProcStatProbe {
    ticks_per_second: u64,
}

#[cfg(target_os = "linux")]
impl Default for ProcStatProbe {
    fn default() -> Self {
        // USER_HZ, fixed at 100 for the procfs ABI
        Self {
            ticks_per_second: 100,
        }
    }
}

#[cfg(target_os = "linux")]
impl ProcStatProbe {
    fn read_all() -> Option<HashMap<u32, StatLine>> {
        let mut table = HashMap::new();
        for dirent in std::fs::read_dir("/proc").ok()?.flatten() {
            let Some(pid) = dirent.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };
            // Processes vanish between listing and reading
            let Ok(stat) = std::fs::read_to_string(dirent.path().join("stat")) else {
                continue;
            };
            if let Some(line) = parse_stat_line(&stat) {
                table.insert(pid, line);
            }
        }
        Some(table)
    }
}

#[cfg(target_os = "linux")]
impl CpuProbe for ProcStatProbe {
    fn cpu_time(&mut self, pid: u32) -> Option<Duration> {
        let table = Self::read_all()?;
        let ticks = tree_ticks(&table, pid)?;
        Some(Duration::from_millis(
            ticks.saturating_mul(1000) / self.ticks_per_second,
        ))
    }
}

/// Parse the parent, group and CPU tick fields of a `/proc/<pid>/stat`
/// line.
///
/// The command name in field 2 may contain spaces and parentheses, so the
/// remaining fields are located after the last `)`.
#[must_use]
pub fn parse_stat_line(stat: &str) -> Option<StatLine> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // fields[0] is field 3 (state); ppid and pgrp follow, utime..cstime are
    // fields 14..=17
    let ppid = fields.get(1)?.parse().ok()?;
    let pgrp = fields.get(2)?.parse().ok()?;
    let ticks = fields
        .get(11..15)?
        .iter()
        .map(|f| f.parse::<u64>().ok())
        .try_fold(0u64, |acc, v| Some(acc + v?))?;
    Some(StatLine { ppid, pgrp, ticks })
}

/// Total ticks of `root`, every member of its process group, and every
/// descendant of those. `None` when nothing in the tree is left.
#[must_use]
pub fn tree_ticks(table: &HashMap<u32, StatLine>, root: u32) -> Option<u64> {
    let mut members: HashSet<u32> = table
        .iter()
        .filter(|(pid, line)| **pid == root || line.pgrp == root)
        .map(|(pid, _)| *pid)
        .collect();
    if members.is_empty() {
        return None;
    }

    // Children that called setsid or setpgid still belong to the tool
    loop {
        let before = members.len();
        let adopted: Vec<u32> = table
            .iter()
            .filter(|(pid, line)| !members.contains(*pid) && members.contains(&line.ppid))
            .map(|(pid, _)| *pid)
            .collect();
        members.extend(adopted);
        if members.len() == before {
            break;
        }
    }

    Some(members.iter().filter_map(|pid| table.get(pid)).map(|l| l.ticks).sum())
}

/// Integrates `sysinfo`'s per-process CPU usage over the sampling interval,
/// summed over the tool and its descendants.
///
/// Less exact than procfs, but only the "did anything happen" signal
/// matters to the watchdog.
#[derive(Debug)]
pub struct SysinfoProbe {
    system: System,
    last_sample: Option<Instant>,
    total: Duration,
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self {
            system: System::new(),
            last_sample: None,
            total: Duration::ZERO,
        }
    }
}

impl SysinfoProbe {
    /// Combined CPU usage in percent of `root` and its descendants.
    fn tree_usage(&self, root: Pid) -> Option<f32> {
        let processes = self.system.processes();
        processes.get(&root)?;

        let mut members: HashSet<Pid> = HashSet::from([root]);
        loop {
            let before = members.len();
            for (pid, process) in processes {
                if process.parent().is_some_and(|parent| members.contains(&parent)) {
                    members.insert(*pid);
                }
            }
            if members.len() == before {
                break;
            }
        }

        Some(
            members
                .iter()
                .filter_map(|pid| processes.get(pid))
                .map(|p| p.cpu_usage().max(0.0))
                .sum(),
        )
    }
}

impl CpuProbe for SysinfoProbe {
    fn cpu_time(&mut self, pid: u32) -> Option<Duration> {
        self.system.refresh_processes();
        let usage = self.tree_usage(Pid::from_u32(pid))?;
        let now = Instant::now();
        if let Some(last) = self.last_sample {
            let share = f64::from(usage) / 100.0;
            self.total += now.duration_since(last).mul_f64(share);
        }
        self.last_sample = Some(now);
        Some(self.total)
    }
}

/// The best probe for this platform.
#[must_use]
pub fn default_probe() -> Box<dyn CpuProbe> {
    #[cfg(target_os = "linux")]
    {
        Box::new(ProcStatProbe::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(SysinfoProbe::default())
    }
}
