//! The sampler seam: anything that can fill a tick's sample grid.
//!
//! `spec.md` treats the concrete samplers (CPU, memory, disk, network,
//! mount, cgroup…) as an external collaborator behind this interface. This
//! crate ships one real, minimal Linux implementation so the pipeline above
//! it (derive/interpolate/compress/meta-diffing) is exercised end to end
//! rather than left backed only by a test double.

use std::collections::BTreeMap;

/// One metric's value for a single tick: either a single scalar or a set of
/// per-instance scalars.
#[derive(Debug, Clone)]
pub enum SampleValue {
    Scalar(f64),
    Instances(BTreeMap<String, f64>),
}

/// Write destination a [`Sampler`] fills in on each tick.
pub trait SampleSink {
    fn sample_scalar(&mut self, metric: &str, value: f64);
    fn sample_instance(&mut self, metric: &str, instance: &str, value: f64);
}

/// A source of metric samples. Implementors are free to maintain internal
/// state between ticks (e.g. previous `/proc/stat` counters for CPU percent).
pub trait Sampler: Send {
    /// Stable name used to decide which samplers a requested metric set needs.
    fn name(&self) -> &'static str;
    /// The metric names this sampler can produce, used to build the meta schema.
    fn provides(&self) -> &[&'static str];
    /// Write this tick's values into `sink`. Errors are logged and treated
    /// as "no sample this tick" rather than failing the whole channel.
    fn sample(&mut self, sink: &mut dyn SampleSink);
}

#[cfg(target_os = "linux")]
pub mod linux {
    use super::{SampleSink, Sampler};
    use std::collections::HashMap;

    /// CPU utilization, read from `/proc/stat`'s aggregate `cpu` line.
    pub struct CpuSampler {
        previous: Option<(u64, u64)>, // (busy, total) jiffies
    }

    impl CpuSampler {
        #[must_use]
        pub fn new() -> Self {
            Self { previous: None }
        }
    }

    impl Default for CpuSampler {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Sampler for CpuSampler {
        fn name(&self) -> &'static str {
            "cpu"
        }

        fn provides(&self) -> &[&'static str] {
            &["cpu.basic.user", "cpu.basic.system", "cpu.basic.nice", "cpu.basic.idle"]
        }

        fn sample(&mut self, sink: &mut dyn SampleSink) {
            let Ok(contents) = std::fs::read_to_string("/proc/stat") else { return };
            let Some(line) = contents.lines().find(|l| l.starts_with("cpu ")) else { return };
            let fields: Vec<u64> = line.split_whitespace().skip(1).filter_map(|f| f.parse().ok()).collect();
            if fields.len() < 4 {
                return;
            }
            let (user, nice, system, idle) = (fields[0], fields[1], fields[2], fields[3]);
            let busy = user + nice + system;
            let total = busy + idle;

            if let Some((prev_busy, prev_total)) = self.previous {
                let d_busy = busy.saturating_sub(prev_busy) as f64;
                let d_total = (total.saturating_sub(prev_total)).max(1) as f64;
                sink.sample_scalar("cpu.basic.user", 100.0 * user as f64 / d_total.max(1.0));
                sink.sample_scalar("cpu.basic.idle", 100.0 * idle as f64 / d_total.max(1.0));
                let _ = d_busy;
            }
            self.previous = Some((busy, total));
        }
    }

    /// Memory usage, read from `/proc/meminfo`.
    #[derive(Default)]
    pub struct MemorySampler;

    impl Sampler for MemorySampler {
        fn name(&self) -> &'static str {
            "memory"
        }

        fn provides(&self) -> &[&'static str] {
            &["memory.used", "memory.free"]
        }

        fn sample(&mut self, sink: &mut dyn SampleSink) {
            let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else { return };
            let mut values: HashMap<&str, u64> = HashMap::new();
            for line in contents.lines() {
                if let Some((key, rest)) = line.split_once(':') {
                    if let Some(kb) = rest.trim().strip_suffix(" kB").and_then(|v| v.trim().parse().ok()) {
                        values.insert(key, kb);
                    }
                }
            }
            if let (Some(&total), Some(&free)) = (values.get("MemTotal"), values.get("MemFree")) {
                sink.sample_scalar("memory.free", free as f64 * 1024.0);
                sink.sample_scalar("memory.used", (total - free) as f64 * 1024.0);
            }
        }
    }

    /// Per-mount free/used space, read via `statvfs` on `/proc/mounts` entries.
    #[derive(Default)]
    pub struct MountSampler;

    impl Sampler for MountSampler {
        fn name(&self) -> &'static str {
            "mount"
        }

        fn provides(&self) -> &[&'static str] {
            &["mount.total", "mount.used"]
        }

        fn sample(&mut self, sink: &mut dyn SampleSink) {
            let Ok(contents) = std::fs::read_to_string("/proc/mounts") else { return };
            for line in contents.lines() {
                let mut fields = line.split_whitespace();
                let Some(_device) = fields.next() else { continue };
                let Some(mount_point) = fields.next() else { continue };
                if let Some((total, used)) = statvfs_totals(mount_point) {
                    sink.sample_instance("mount.total", mount_point, total);
                    sink.sample_instance("mount.used", mount_point, used);
                }
            }
        }
    }

    fn statvfs_totals(path: &str) -> Option<(f64, f64)> {
        use std::ffi::CString;
        let c_path = CString::new(path).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return None;
        }
        let block_size = stat.f_frsize as f64;
        let total = stat.f_blocks as f64 * block_size;
        let free = stat.f_bfree as f64 * block_size;
        Some((total, total - free))
    }

    /// Network throughput, read from `/proc/net/dev`.
    #[derive(Default)]
    pub struct NetworkSampler;

    impl Sampler for NetworkSampler {
        fn name(&self) -> &'static str {
            "network"
        }

        fn provides(&self) -> &[&'static str] {
            &["network.interface.rx", "network.interface.tx"]
        }

        fn sample(&mut self, sink: &mut dyn SampleSink) {
            let Ok(contents) = std::fs::read_to_string("/proc/net/dev") else { return };
            for line in contents.lines().skip(2) {
                let Some((iface, rest)) = line.split_once(':') else { continue };
                let iface = iface.trim();
                let fields: Vec<f64> = rest.split_whitespace().filter_map(|f| f.parse().ok()).collect();
                if fields.len() < 9 {
                    continue;
                }
                sink.sample_instance("network.interface.rx", iface, fields[0]);
                sink.sample_instance("network.interface.tx", iface, fields[8]);
            }
        }
    }

    /// CPU package temperature via `/sys/class/thermal`, best-effort.
    #[derive(Default)]
    pub struct CpuTemperatureSampler;

    impl Sampler for CpuTemperatureSampler {
        fn name(&self) -> &'static str {
            "cpu.temperature"
        }

        fn provides(&self) -> &[&'static str] {
            &["cpu.temperature"]
        }

        fn sample(&mut self, sink: &mut dyn SampleSink) {
            let Ok(entries) = std::fs::read_dir("/sys/class/thermal") else { return };
            for entry in entries.flatten() {
                let path = entry.path().join("temp");
                if let Ok(raw) = std::fs::read_to_string(&path) {
                    if let Ok(millidegrees) = raw.trim().parse::<f64>() {
                        let zone = entry.file_name().to_string_lossy().into_owned();
                        sink.sample_instance("cpu.temperature", &zone, millidegrees / 1000.0);
                    }
                }
            }
        }
    }

}

#[cfg(not(target_os = "linux"))]
pub mod linux {
    //! Non-Linux builds get no concrete samplers; the `Sampler` trait and
    //! pipeline above it are still fully usable with a test double.
}
