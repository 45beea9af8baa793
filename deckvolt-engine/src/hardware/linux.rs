//! Linux adapters
//!
//! - CPU counters from `/proc/stat`, frequency from cpufreq sysfs,
//!   temperature and fan from hwmon/thermal sysfs files
//! - Voltage offsets through an operator-configured external command
//! - Governor pinning through cpufreq sysfs
//! - Stress load through `stress-ng`
//!
//! All paths hang off configurable roots so tests can point them at a
//! temporary directory.

use super::{
    CpuTimes, FanReading, GovernorControl, LoadPattern, MetricsSource, StressWorkload,
    VoltageSink, WorkloadReport,
};
use crate::config::HardwareSettings;
use crate::error::HardwareError;
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, warn};

/// Governor restored when the original one could not be read
pub const FALLBACK_GOVERNOR: &str = "schedutil";

/// Parse the `cpuN` line of `/proc/stat` content
///
/// Busy time is every accounted field except idle and iowait.
pub fn parse_proc_stat(content: &str, core_id: usize) -> Option<CpuTimes> {
    let label = format!("cpu{}", core_id);
    let line = content
        .lines()
        .find(|l| l.split_whitespace().next() == Some(label.as_str()))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|f| f.parse().ok())
        .collect::<Option<Vec<u64>>>()?;
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        idle,
    })
}

/// Read the DMI product name used for model detection
pub fn read_product_name(sysfs_root: &Path) -> Option<String> {
    std::fs::read_to_string(sysfs_root.join("class/dmi/id/product_name"))
        .ok()
        .map(|s| s.trim().to_string())
}

fn read_trimmed(path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path).map(|s| s.trim().to_string())
}

fn io_to_hw(err: std::io::Error, core_id: usize, path: &Path) -> HardwareError {
    if err.kind() == ErrorKind::PermissionDenied {
        HardwareError::Permission(format!("{}: {}", path.display(), err))
    } else {
        HardwareError::Read {
            core_id,
            message: format!("{}: {}", path.display(), err),
        }
    }
}

/// procfs/sysfs metrics
pub struct SysfsMetrics {
    proc_root: PathBuf,
    sysfs_root: PathBuf,
    temperature_path: PathBuf,
    fan_rpm_path: Option<PathBuf>,
    fan_pwm_path: Option<PathBuf>,
}

impl SysfsMetrics {
    pub fn new(settings: &HardwareSettings) -> Self {
        Self {
            proc_root: settings.proc_root.clone(),
            sysfs_root: settings.sysfs_root.clone(),
            temperature_path: settings.temperature_path.clone(),
            fan_rpm_path: settings.fan_rpm_path.clone(),
            fan_pwm_path: settings.fan_pwm_path.clone(),
        }
    }

    fn cpufreq_dir(&self, core_id: usize) -> PathBuf {
        self.sysfs_root
            .join(format!("devices/system/cpu/cpu{}/cpufreq", core_id))
    }
}

impl MetricsSource for SysfsMetrics {
    fn cpu_times(&self, core_id: usize) -> Result<CpuTimes, HardwareError> {
        let path = self.proc_root.join("stat");
        let content = std::fs::read_to_string(&path).map_err(|e| io_to_hw(e, core_id, &path))?;
        parse_proc_stat(&content, core_id).ok_or_else(|| HardwareError::Read {
            core_id,
            message: format!("no cpu{} line in {}", core_id, path.display()),
        })
    }

    fn frequency_mhz(&self, core_id: usize) -> Result<u32, HardwareError> {
        let path = self.cpufreq_dir(core_id).join("scaling_cur_freq");
        let raw = read_trimmed(&path).map_err(|e| io_to_hw(e, core_id, &path))?;
        let khz: u64 = raw.parse().map_err(|_| HardwareError::Read {
            core_id,
            message: format!("bad frequency '{}' in {}", raw, path.display()),
        })?;
        Ok((khz / 1000) as u32)
    }

    fn temperature_c(&self) -> Result<f32, HardwareError> {
        let path = &self.temperature_path;
        let raw = read_trimmed(path).map_err(|e| io_to_hw(e, 0, path))?;
        let millis: f32 = raw.parse().map_err(|_| HardwareError::Read {
            core_id: 0,
            message: format!("bad temperature '{}' in {}", raw, path.display()),
        })?;
        Ok(millis / 1000.0)
    }

    fn fan(&self) -> Option<FanReading> {
        let rpm = read_trimmed(self.fan_rpm_path.as_ref()?).ok()?.parse().ok()?;
        let pwm = self
            .fan_pwm_path
            .as_ref()
            .and_then(|p| read_trimmed(p).ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Some(FanReading { rpm, pwm })
    }
}

/// Voltage offsets through an external tool
///
/// The configured argv may contain `{core}` and `{mv}` placeholders, e.g.
/// `["ryzenadj", "--set-coper={core}:{mv}"]`.
pub struct CommandVoltageSink {
    argv: Vec<String>,
}

impl CommandVoltageSink {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }

    fn render(&self, core_id: usize, offset_mv: i32) -> Vec<String> {
        self.argv
            .iter()
            .map(|arg| {
                arg.replace("{core}", &core_id.to_string())
                    .replace("{mv}", &offset_mv.to_string())
            })
            .collect()
    }
}

impl VoltageSink for CommandVoltageSink {
    fn apply(&self, core_id: usize, offset_mv: i32) -> Result<(), HardwareError> {
        let argv = self.render(core_id, offset_mv);
        let (program, args) = argv.split_first().ok_or_else(|| HardwareError::Write {
            core_id,
            message: "no voltage command configured".to_string(),
        })?;

        debug!("Applying {} mV to core {} via {}", offset_mv, core_id, program);
        let output = Command::new(program).args(args).output().map_err(|e| {
            if e.kind() == ErrorKind::PermissionDenied {
                HardwareError::Permission(format!("{}: {}", program, e))
            } else {
                HardwareError::Write {
                    core_id,
                    message: format!("{}: {}", program, e),
                }
            }
        })?;

        if !output.status.success() {
            return Err(HardwareError::Write {
                core_id,
                message: format!(
                    "{} exited with {}: {}",
                    program,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// cpufreq governor control
pub struct SysfsGovernor {
    sysfs_root: PathBuf,
}

impl SysfsGovernor {
    pub fn new(settings: &HardwareSettings) -> Self {
        Self {
            sysfs_root: settings.sysfs_root.clone(),
        }
    }

    fn file(&self, core_id: usize, name: &str) -> PathBuf {
        self.sysfs_root
            .join(format!("devices/system/cpu/cpu{}/cpufreq", core_id))
            .join(name)
    }

    fn write(&self, core_id: usize, name: &str, value: &str) -> Result<(), HardwareError> {
        let path = self.file(core_id, name);
        std::fs::write(&path, value).map_err(|e| {
            if e.kind() == ErrorKind::PermissionDenied {
                HardwareError::Permission(format!("{}: {}", path.display(), e))
            } else {
                HardwareError::Governor {
                    core_id,
                    message: format!("{}: {}", path.display(), e),
                }
            }
        })
    }
}

impl GovernorControl for SysfsGovernor {
    fn governor(&self, core_id: usize) -> Result<String, HardwareError> {
        let path = self.file(core_id, "scaling_governor");
        read_trimmed(&path).map_err(|e| HardwareError::Governor {
            core_id,
            message: format!("{}: {}", path.display(), e),
        })
    }

    fn lock_frequency(&self, core_id: usize, frequency_mhz: u32) -> Result<(), HardwareError> {
        let khz = (frequency_mhz as u64 * 1000).to_string();
        self.write(core_id, "scaling_governor", "userspace")?;
        self.write(core_id, "scaling_setspeed", &khz)
    }

    fn restore(&self, core_id: usize, governor: &str) -> Result<(), HardwareError> {
        let governor = if governor.is_empty() {
            FALLBACK_GOVERNOR
        } else {
            governor
        };
        self.write(core_id, "scaling_governor", governor)
    }
}

/// `stress-ng` workload
///
/// Pulsating patterns map onto `--cpu-load`/`--cpu-load-slice` so the load
/// alternates between bursts and idle gaps.
pub struct StressNg {
    program: String,
    workers: usize,
}

impl StressNg {
    pub fn new(settings: &HardwareSettings) -> Self {
        Self {
            program: settings.stress_program.clone(),
            workers: settings.stress_workers,
        }
    }

    pub fn args(&self, pattern: LoadPattern, duration: Duration) -> Vec<String> {
        let mut args = vec![
            "--cpu".to_string(),
            self.workers.to_string(),
            "--cpu-method".to_string(),
            "all".to_string(),
            "--verify".to_string(),
            "--timeout".to_string(),
            format!("{}s", duration.as_secs().max(1)),
            "--metrics-brief".to_string(),
        ];
        if let LoadPattern::Pulsating { load_ms, idle_ms } = pattern {
            let period = (load_ms + idle_ms).max(1);
            let pct = (load_ms * 100 / period).clamp(1, 100);
            args.extend([
                "--cpu-load".to_string(),
                pct.to_string(),
                "--cpu-load-slice".to_string(),
                load_ms.to_string(),
            ]);
        }
        args
    }
}

#[async_trait]
impl StressWorkload for StressNg {
    async fn run(
        &self,
        pattern: LoadPattern,
        duration: Duration,
    ) -> Result<WorkloadReport, HardwareError> {
        let output = tokio::process::Command::new(&self.program)
            .args(self.args(pattern, duration))
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| HardwareError::Workload(format!("{}: {}", self.program, e)))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let failed_line = stderr
            .lines()
            .find(|l| l.contains("fail") || l.contains("error"))
            .map(str::to_string);

        if !output.status.success() || failed_line.is_some() {
            warn!("stress-ng reported instability: {:?}", failed_line);
            return Ok(WorkloadReport {
                errors_detected: true,
                detail: failed_line.unwrap_or_else(|| format!("exit status {}", output.status)),
            });
        }
        Ok(WorkloadReport {
            errors_detected: false,
            detail: "stress-ng passed".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "cpu  100 0 100 800 0 0 0 0 0 0\n\
cpu0 10 5 5 70 10 0 0 0 0 0\n\
cpu1 50 0 25 20 5 0 0 0 0 0\n\
intr 12345\n";

    fn settings(root: &Path) -> HardwareSettings {
        HardwareSettings {
            proc_root: root.join("proc"),
            sysfs_root: root.join("sys"),
            temperature_path: root.join("sys/class/thermal/thermal_zone0/temp"),
            fan_rpm_path: Some(root.join("hwmon/fan1_input")),
            fan_pwm_path: None,
            ..HardwareSettings::default()
        }
    }

    #[test]
    fn test_parse_proc_stat_excludes_idle_and_iowait() {
        assert_eq!(
            parse_proc_stat(PROC_STAT, 0),
            Some(CpuTimes { busy: 20, idle: 80 })
        );
        assert_eq!(
            parse_proc_stat(PROC_STAT, 1),
            Some(CpuTimes { busy: 75, idle: 25 })
        );
        assert_eq!(parse_proc_stat(PROC_STAT, 7), None);
    }

    #[test]
    fn test_sysfs_metrics_reads_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        std::fs::create_dir_all(&s.proc_root).unwrap();
        std::fs::write(s.proc_root.join("stat"), PROC_STAT).unwrap();
        let freq_dir = s.sysfs_root.join("devices/system/cpu/cpu1/cpufreq");
        std::fs::create_dir_all(&freq_dir).unwrap();
        std::fs::write(freq_dir.join("scaling_cur_freq"), "2800000\n").unwrap();
        std::fs::create_dir_all(s.temperature_path.parent().unwrap()).unwrap();
        std::fs::write(&s.temperature_path, "61500\n").unwrap();
        std::fs::create_dir_all(dir.path().join("hwmon")).unwrap();
        std::fs::write(dir.path().join("hwmon/fan1_input"), "3100\n").unwrap();

        let metrics = SysfsMetrics::new(&s);
        assert_eq!(metrics.cpu_times(1).unwrap().busy, 75);
        assert_eq!(metrics.frequency_mhz(1).unwrap(), 2800);
        assert!((metrics.temperature_c().unwrap() - 61.5).abs() < f32::EPSILON);
        assert_eq!(metrics.fan(), Some(FanReading { rpm: 3100, pwm: 0 }));
        assert!(matches!(
            metrics.frequency_mhz(0),
            Err(HardwareError::Read { core_id: 0, .. })
        ));
    }

    #[test]
    fn test_governor_lock_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(dir.path());
        let freq_dir = s.sysfs_root.join("devices/system/cpu/cpu0/cpufreq");
        std::fs::create_dir_all(&freq_dir).unwrap();
        std::fs::write(freq_dir.join("scaling_governor"), "schedutil\n").unwrap();

        let governor = SysfsGovernor::new(&s);
        assert_eq!(governor.governor(0).unwrap(), "schedutil");
        governor.lock_frequency(0, 1200).unwrap();
        assert_eq!(
            std::fs::read_to_string(freq_dir.join("scaling_setspeed")).unwrap(),
            "1200000"
        );
        governor.restore(0, "").unwrap();
        assert_eq!(governor.governor(0).unwrap(), FALLBACK_GOVERNOR);
    }

    #[test]
    fn test_command_sink_renders_placeholders() {
        let sink = CommandVoltageSink::new(vec![
            "tool".to_string(),
            "--core={core}".to_string(),
            "--offset={mv}".to_string(),
        ]);
        assert_eq!(sink.render(2, -15), vec!["tool", "--core=2", "--offset=-15"]);
        assert!(CommandVoltageSink::new(Vec::new()).apply(0, -5).is_err());
    }

    #[test]
    fn test_stress_ng_pulsating_args() {
        let dir = tempfile::tempdir().unwrap();
        let stress = StressNg::new(&settings(dir.path()));
        let args = stress.args(LoadPattern::vdroop(), Duration::from_secs(30));
        assert!(args.contains(&"30s".to_string()));
        let idx = args.iter().position(|a| a == "--cpu-load").unwrap();
        assert_eq!(args[idx + 1], "50");

        let constant = stress.args(LoadPattern::Constant, Duration::from_secs(60));
        assert!(!constant.contains(&"--cpu-load".to_string()));
    }

    #[test]
    fn test_product_name_read() {
        let dir = tempfile::tempdir().unwrap();
        let dmi = dir.path().join("class/dmi/id");
        std::fs::create_dir_all(&dmi).unwrap();
        std::fs::write(dmi.join("product_name"), "Galileo\n").unwrap();
        assert_eq!(read_product_name(dir.path()).as_deref(), Some("Galileo"));
    }
}
