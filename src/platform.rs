// SPDX-FileCopyrightText: 2025 Jason Pena <jasonpena@awkless.com>
// SPDX-License-Identifier: MIT

//! Host capabilities.
//!
//! Battery state, system load, desktop notifications, and machine identifiers
//! differ per operating system. Each is reached through the [`Platform`] trait,
//! whose variant is chosen once by [`detect`] and then passed to whatever needs
//! it. Wall-clock time and network reachability are injected the same way
//! through [`Clock`] and [`NetworkProbe`], so gating logic can be driven by
//! tests without sleeping or touching the network.
//!
//! Every query here degrades to a harmless default instead of failing. A laptop
//! whose battery cannot be read is treated as plugged in at full charge.

use std::{
    fs::read_to_string,
    io,
    net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs},
    path::PathBuf,
    process::{Command, Stdio},
    sync::{mpsc, Arc},
    thread,
    time::{Duration, SystemTime, UNIX_EPOCH},
};
use tracing::debug;

/// Load average per core above which the host counts as busy.
pub const LOAD_FACTOR: f64 = 2.5;

/// Battery charge and power source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatteryStatus {
    pub percent: u8,
    pub plugged: bool,
}

impl Default for BatteryStatus {
    fn default() -> Self {
        Self {
            percent: 100,
            plugged: true,
        }
    }
}

/// Operating system specific capabilities.
pub trait Platform: Send + Sync + 'static {
    /// Current battery status, or a full plugged in battery if unknown.
    fn battery(&self) -> BatteryStatus;

    /// One minute load average, if the host exposes one.
    fn load_average(&self) -> Option<f64>;

    /// Send desktop notification. Failure is logged and ignored.
    fn notify(&self, title: &str, message: &str);

    /// Operating system machine identifier, if one exists.
    fn machine_id(&self) -> Option<String>;

    /// Short host name without domain part.
    fn hostname(&self) -> Option<String> {
        command_output("hostname", &[]).map(|name| short_hostname(&name))
    }

    /// Number of logical cores.
    fn cpu_count(&self) -> usize {
        std::thread::available_parallelism()
            .map(|count| count.get())
            .unwrap_or(1)
    }

    /// Whether one minute load average exceeds [`LOAD_FACTOR`] times core count.
    fn is_under_load(&self) -> bool {
        self.load_average()
            .map(|load| load > self.cpu_count() as f64 * LOAD_FACTOR)
            .unwrap_or(false)
    }
}

/// Select platform implementation for the running operating system.
pub fn detect() -> Arc<dyn Platform> {
    if cfg!(target_os = "linux") {
        Arc::new(Linux::default())
    } else if cfg!(target_os = "macos") {
        Arc::new(MacOs)
    } else {
        Arc::new(Generic)
    }
}

/// Linux through sysfs, procfs, and `notify-send`.
#[derive(Debug, Clone)]
pub struct Linux {
    power_supply: PathBuf,
    loadavg: PathBuf,
    machine_id_files: Vec<PathBuf>,
}

impl Default for Linux {
    fn default() -> Self {
        Self {
            power_supply: PathBuf::from("/sys/class/power_supply"),
            loadavg: PathBuf::from("/proc/loadavg"),
            machine_id_files: vec![
                PathBuf::from("/etc/machine-id"),
                PathBuf::from("/var/lib/dbus/machine-id"),
                PathBuf::from("/sys/class/dmi/id/product_uuid"),
            ],
        }
    }
}

impl Platform for Linux {
    fn battery(&self) -> BatteryStatus {
        for name in ["BAT0", "BAT1"] {
            let battery = self.power_supply.join(name);
            if !battery.exists() {
                continue;
            }

            let percent = read_to_string(battery.join("capacity"))
                .ok()
                .and_then(|data| data.trim().parse::<u8>().ok());
            let status = read_to_string(battery.join("status")).ok();
            if let (Some(percent), Some(status)) = (percent, status) {
                return BatteryStatus {
                    percent,
                    plugged: status.trim() != "Discharging",
                };
            }
        }

        BatteryStatus::default()
    }

    fn load_average(&self) -> Option<f64> {
        read_to_string(&self.loadavg)
            .ok()
            .and_then(|data| parse_load_average(&data))
    }

    fn notify(&self, title: &str, message: &str) {
        spawn_quietly("notify-send", &[title, message]);
    }

    fn machine_id(&self) -> Option<String> {
        self.machine_id_files.iter().find_map(|path| {
            read_to_string(path)
                .ok()
                .map(|data| data.trim().to_string())
                .filter(|id| !id.is_empty())
        })
    }

    fn hostname(&self) -> Option<String> {
        read_to_string("/etc/hostname")
            .ok()
            .map(|name| short_hostname(&name))
            .filter(|name| !name.is_empty())
            .or_else(|| command_output("hostname", &[]).map(|name| short_hostname(&name)))
    }
}

/// macOS through `pmset`, `sysctl`, `ioreg`, and `osascript`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MacOs;

impl Platform for MacOs {
    fn battery(&self) -> BatteryStatus {
        command_output("pmset", &["-g", "batt"])
            .map(|output| parse_pmset(&output))
            .unwrap_or_default()
    }

    fn load_average(&self) -> Option<f64> {
        command_output("sysctl", &["-n", "vm.loadavg"]).and_then(|output| {
            parse_load_average(output.trim().trim_start_matches('{').trim_start())
        })
    }

    fn notify(&self, title: &str, message: &str) {
        let script = format!(
            "display notification \"{}\" with title \"{}\"",
            message.replace('"', "'"),
            title.replace('"', "'")
        );
        spawn_quietly("osascript", &["-e", script.as_str()]);
    }

    fn machine_id(&self) -> Option<String> {
        command_output("ioreg", &["-rd1", "-c", "IOPlatformExpertDevice"])
            .and_then(|output| parse_ioreg_uuid(&output))
            .or_else(|| {
                command_output("scutil", &["--get", "LocalHostName"])
                    .map(|name| name.trim().to_string())
                    .filter(|name| !name.is_empty())
            })
    }
}

/// Any other host. Never on battery, never under load, never notifies.
#[derive(Debug, Default, Clone, Copy)]
pub struct Generic;

impl Platform for Generic {
    fn battery(&self) -> BatteryStatus {
        BatteryStatus::default()
    }

    fn load_average(&self) -> Option<f64> {
        None
    }

    fn notify(&self, title: &str, message: &str) {
        debug!("notification {title:?}: {message}");
    }

    fn machine_id(&self) -> Option<String> {
        None
    }
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync + 'static {
    /// Seconds since UNIX epoch.
    fn now(&self) -> f64;

    /// Block current thread.
    fn sleep(&self, duration: Duration);
}

/// Real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs_f64())
            .unwrap_or_default()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Reachability check for a remote host.
pub trait NetworkProbe: Send + Sync + 'static {
    /// Whether host answers at all.
    fn reachable(&self, host: &str) -> bool;
}

/// Probe hosts with short TCP connects on HTTPS then SSH ports.
///
/// The timeout bounds name resolution as well as each connect. A resolver that
/// hangs is abandoned and the host counts as unreachable.
#[derive(Debug, Clone, Copy)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    pub const PORTS: [u16; 2] = [443, 22];

    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

impl NetworkProbe for TcpProbe {
    fn reachable(&self, host: &str) -> bool {
        let name = host.to_string();
        let resolver = move || {
            (name.as_str(), 0)
                .to_socket_addrs()
                .map(|addrs| addrs.map(|addr| addr.ip()).collect())
        };
        let Some(ips) = resolve_within(resolver, self.timeout) else {
            debug!("cannot resolve {host:?} within {:?}", self.timeout);
            return false;
        };

        Self::PORTS.iter().any(|port| {
            ips.iter().any(|ip| {
                TcpStream::connect_timeout(&SocketAddr::new(*ip, *port), self.timeout).is_ok()
            })
        })
    }
}

/// Run `resolver` on its own thread, giving up on it after `timeout`.
fn resolve_within<F>(resolver: F, timeout: Duration) -> Option<Vec<IpAddr>>
where
    F: FnOnce() -> io::Result<Vec<IpAddr>> + Send + 'static,
{
    let (sender, receiver) = mpsc::channel();
    thread::spawn(move || {
        // INVARIANT: Receiver may be gone already, the answer is simply dropped then.
        let _ = sender.send(resolver());
    });

    match receiver.recv_timeout(timeout) {
        Ok(Ok(ips)) if !ips.is_empty() => Some(ips),
        Ok(Ok(_)) => None,
        Ok(Err(error)) => {
            debug!("name resolution failed: {error}");
            None
        }
        Err(_) => None,
    }
}

/// Render UNIX timestamp as local `YYYY-MM-DD HH:MM:SS`.
pub fn local_time(timestamp: i64) -> String {
    chrono::DateTime::from_timestamp(timestamp, 0)
        .map(|time| {
            time.with_timezone(&chrono::Local)
                .format("%Y-%m-%d %H:%M:%S")
                .to_string()
        })
        .unwrap_or_else(|| timestamp.to_string())
}

fn short_hostname(name: &str) -> String {
    name.trim().split('.').next().unwrap_or_default().to_string()
}

fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn spawn_quietly(program: &str, args: &[&str]) {
    let result = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    if let Err(error) = result {
        debug!("cannot run {program:?}: {error}");
    }
}

fn parse_load_average(data: &str) -> Option<f64> {
    data.split_whitespace().next()?.parse().ok()
}

fn parse_pmset(output: &str) -> BatteryStatus {
    let plugged = output.contains("AC Power");
    let percent = output
        .split('%')
        .next()
        .filter(|_| output.contains('%'))
        .and_then(|head| {
            let digits: String = head
                .chars()
                .rev()
                .take_while(char::is_ascii_digit)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect();
            digits.parse::<u8>().ok()
        })
        .unwrap_or(100);

    BatteryStatus { percent, plugged }
}

fn parse_ioreg_uuid(output: &str) -> Option<String> {
    output
        .lines()
        .find(|line| line.contains("\"IOPlatformUUID\""))
        .and_then(|line| line.split('=').nth(1))
        .map(|value| value.trim().trim_matches('"').to_string())
        .filter(|uuid| !uuid.is_empty())
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::Mutex;

    type SleepHook = Box<dyn Fn() + Send + Sync>;

    #[derive(Debug, Default)]
    pub(crate) struct FakePlatform {
        pub(crate) battery: Mutex<BatteryStatus>,
        pub(crate) load: Mutex<Option<f64>>,
        pub(crate) machine_id: Option<String>,
        pub(crate) hostname: Option<String>,
        pub(crate) notifications: Mutex<Vec<(String, String)>>,
    }

    impl FakePlatform {
        pub(crate) fn set_battery(&self, percent: u8, plugged: bool) {
            if let Ok(mut battery) = self.battery.lock() {
                *battery = BatteryStatus { percent, plugged };
            }
        }

        pub(crate) fn titles(&self) -> Vec<String> {
            self.notifications
                .lock()
                .map(|list| list.iter().map(|(title, _)| title.clone()).collect())
                .unwrap_or_default()
        }
    }

    impl Platform for FakePlatform {
        fn battery(&self) -> BatteryStatus {
            self.battery.lock().map(|b| *b).unwrap_or_default()
        }

        fn load_average(&self) -> Option<f64> {
            self.load.lock().ok().and_then(|load| *load)
        }

        fn notify(&self, title: &str, message: &str) {
            if let Ok(mut list) = self.notifications.lock() {
                list.push((title.into(), message.into()));
            }
        }

        fn machine_id(&self) -> Option<String> {
            self.machine_id.clone()
        }

        fn hostname(&self) -> Option<String> {
            self.hostname.clone()
        }

        fn cpu_count(&self) -> usize {
            4
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeClock {
        pub(crate) now: Mutex<f64>,
        pub(crate) sleeps: Mutex<Vec<Duration>>,
        pub(crate) on_sleep: Mutex<Option<SleepHook>>,
    }

    impl FakeClock {
        pub(crate) fn at(now: f64) -> Self {
            Self {
                now: Mutex::new(now),
                ..Default::default()
            }
        }

        pub(crate) fn set(&self, now: f64) {
            if let Ok(mut clock) = self.now.lock() {
                *clock = now;
            }
        }

        pub(crate) fn on_sleep(&self, hook: impl Fn() + Send + Sync + 'static) {
            if let Ok(mut slot) = self.on_sleep.lock() {
                *slot = Some(Box::new(hook));
            }
        }

        pub(crate) fn slept(&self) -> Vec<Duration> {
            self.sleeps.lock().map(|s| s.clone()).unwrap_or_default()
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> f64 {
            self.now.lock().map(|now| *now).unwrap_or_default()
        }

        fn sleep(&self, duration: Duration) {
            if let Ok(mut sleeps) = self.sleeps.lock() {
                sleeps.push(duration);
            }
            if let Ok(mut now) = self.now.lock() {
                *now += duration.as_secs_f64();
            }
            if let Ok(hook) = self.on_sleep.lock() {
                if let Some(hook) = hook.as_ref() {
                    hook();
                }
            }
        }
    }

    #[derive(Debug, Default)]
    pub(crate) struct FakeProbe {
        pub(crate) offline: bool,
        pub(crate) probed: Mutex<Vec<String>>,
    }

    impl NetworkProbe for FakeProbe {
        fn reachable(&self, host: &str) -> bool {
            if let Ok(mut probed) = self.probed.lock() {
                probed.push(host.into());
            }
            !self.offline
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use pretty_assertions::assert_eq;
    use simple_test_case::test_case;
    use std::fs::{create_dir_all, write};

    #[test_case("0.52 0.58 0.59 1/467 12345\n", Some(0.52); "procfs")]
    #[test_case("1.91 1.75 1.60 }", Some(1.91); "sysctl after brace")]
    #[test_case("", None; "empty")]
    #[test]
    fn load_average_parsing(data: &str, expect: Option<f64>) {
        use pretty_assertions::assert_eq;
        assert_eq!(parse_load_average(data), expect);
    }

    #[test]
    fn hung_resolver_is_abandoned() {
        let resolver = || {
            thread::sleep(Duration::from_secs(5));
            Ok(vec![IpAddr::from([127, 0, 0, 1])])
        };

        let started = std::time::Instant::now();
        assert_eq!(resolve_within(resolver, Duration::from_millis(100)), None);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn resolver_answer_within_timeout() {
        let localhost = IpAddr::from([127, 0, 0, 1]);
        let resolver = move || Ok(vec![localhost]);
        assert_eq!(
            resolve_within(resolver, Duration::from_secs(1)),
            Some(vec![localhost])
        );
    }

    #[test]
    fn failed_resolution_is_unreachable() {
        let resolver = || Err(io::Error::new(io::ErrorKind::NotFound, "no such host"));
        assert_eq!(resolve_within(resolver, Duration::from_secs(1)), None);
    }

    #[test]
    fn pmset_on_battery() {
        let output = indoc! {"
            Now drawing from 'Battery Power'
             -InternalBattery-0 (id=1234)	7%; discharging; 0:20 remaining present: true
        "};
        assert_eq!(
            parse_pmset(output),
            BatteryStatus {
                percent: 7,
                plugged: false
            }
        );
    }

    #[test]
    fn pmset_without_battery() {
        let output = "Now drawing from 'AC Power'\n";
        assert_eq!(parse_pmset(output), BatteryStatus::default());
    }

    #[test]
    fn ioreg_platform_uuid() {
        let output = indoc! {r#"
            +-o Mac  <class IOPlatformExpertDevice>
                {
                  "IOPlatformSerialNumber" = "C02XXXXX"
                  "IOPlatformUUID" = "9A7B2C44-1111-2222-3333-444455556666"
                }
        "#};
        assert_eq!(
            parse_ioreg_uuid(output),
            Some("9A7B2C44-1111-2222-3333-444455556666".to_string())
        );
    }

    #[test]
    fn linux_reads_sysfs_battery_and_machine_id() -> anyhow::Result<()> {
        let root = tempfile::tempdir()?;
        let battery = root.path().join("power_supply").join("BAT1");
        create_dir_all(&battery)?;
        write(battery.join("capacity"), "5\n")?;
        write(battery.join("status"), "Discharging\n")?;
        write(root.path().join("machine-id"), "\n")?;
        write(root.path().join("product_uuid"), "abcdef0123456789\n")?;

        let linux = Linux {
            power_supply: root.path().join("power_supply"),
            loadavg: root.path().join("loadavg"),
            machine_id_files: vec![
                root.path().join("machine-id"),
                root.path().join("missing"),
                root.path().join("product_uuid"),
            ],
        };

        assert_eq!(
            linux.battery(),
            BatteryStatus {
                percent: 5,
                plugged: false
            }
        );
        assert_eq!(linux.machine_id(), Some("abcdef0123456789".to_string()));
        assert_eq!(linux.load_average(), None);
        assert!(!linux.is_under_load());
        Ok(())
    }

    #[test_case(Some(10.1), true; "above factor")]
    #[test_case(Some(10.0), false; "at factor")]
    #[test_case(None, false; "unknown")]
    #[test]
    fn load_threshold_scales_with_cores(load: Option<f64>, expect: bool) {
        use pretty_assertions::assert_eq;
        let platform = fake::FakePlatform {
            load: std::sync::Mutex::new(load),
            ..Default::default()
        };
        assert_eq!(platform.is_under_load(), expect);
    }
}
