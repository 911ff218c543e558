//! Boot-partition preparation for a freshly flashed image.
//!
//! Runs against the mounted FAT partition, not over SSH. Every task compares
//! what is on disk with what it would write and leaves matching files alone.

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::debug;

use crate::layer::StepRecord;
use crate::report::{Mark, Reporter, StepStatus};
use crate::shell::{IdentifierError, quote, validate_hostname};

/// File whose presence enables the SSH server on first boot.
pub const SSH_MARKER: &str = "ssh";
/// Kernel command line, a single line of space-separated arguments.
pub const CMDLINE: &str = "cmdline.txt";
/// Wireless configuration picked up on first boot.
pub const WPA_SUPPLICANT: &str = "wpa_supplicant.conf";
/// Script run once by systemd on first boot.
pub const FIRSTRUN: &str = "firstrun.sh";

/// Kernel arguments appended when none are configured.
pub const DEFAULT_CMDLINE_ARGS: &[&str] = &[
    "cgroup_enable=cpuset",
    "cgroup_enable=memory",
    "cgroup_memory=1",
];

/// Hooks that make systemd run [`FIRSTRUN`] once and reboot.
pub const FIRSTRUN_HOOKS: &[&str] = &[
    "systemd.run=/boot/firstrun.sh",
    "systemd.run_success_action=reboot",
    "systemd.unit=kernel-command-line.target",
];

/// Errors raised while preparing the boot partition.
#[derive(Debug, Error)]
pub enum BootError {
    /// Raised when the boot path cannot be opened as a directory.
    #[error("`{path}` is not a directory: {source}")]
    NotADirectory {
        /// Requested boot path.
        path: Utf8PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Raised when the directory has no kernel command line.
    #[error("cmdline.txt does not exist in `{0}`")]
    MissingCmdline(Utf8PathBuf),
    /// Raised when a file cannot be read or written.
    #[error("failed to access `{file}`: {source}")]
    Io {
        /// File name inside the boot partition.
        file: &'static str,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// Raised for Wi-Fi credentials that cannot be written safely.
    #[error("invalid Wi-Fi credentials: {0}")]
    InvalidWifi(&'static str),
    /// Raised when the country is not an ISO 3166 alpha-2 code.
    #[error("invalid Wi-Fi country `{0}`: expected two uppercase letters")]
    InvalidCountry(String),
    /// Raised for a malformed hostname.
    #[error(transparent)]
    InvalidHostname(#[from] IdentifierError),
}

/// WPA-PSK network joined on first boot.
#[derive(Clone)]
pub struct WifiCredentials {
    /// Network name.
    pub ssid: String,
    /// Pre-shared key.
    pub pass: String,
}

impl WifiCredentials {
    fn validate(&self) -> Result<(), BootError> {
        let unsafe_char = |ch: char| ch == '"' || ch == '\n' || ch == '\r';
        if self.ssid.is_empty() || self.ssid.len() > 32 {
            return Err(BootError::InvalidWifi("the SSID must be 1 to 32 bytes"));
        }
        if !(8..=63).contains(&self.pass.len()) {
            return Err(BootError::InvalidWifi("the passphrase must be 8 to 63 characters"));
        }
        if self.ssid.contains(unsafe_char) || self.pass.contains(unsafe_char) {
            return Err(BootError::InvalidWifi("quotes and line breaks are not supported"));
        }
        Ok(())
    }
}

/// What to write to the boot partition.
#[derive(Clone)]
pub struct BootRequest {
    /// Mounted boot partition.
    pub boot_path: Utf8PathBuf,
    /// Hostname applied by the first-run script.
    pub hostname: Option<String>,
    /// Wireless network, if any.
    pub wifi: Option<WifiCredentials>,
    /// Regulatory domain for the wireless radio.
    pub wifi_country: String,
    /// Kernel arguments to append.
    pub cmdline_args: Vec<String>,
}

impl BootRequest {
    /// Checks the request before touching the partition.
    ///
    /// # Errors
    ///
    /// Returns [`BootError`] for an invalid hostname, country or
    /// Wi-Fi credentials.
    pub fn validate(&self) -> Result<(), BootError> {
        if let Some(hostname) = &self.hostname {
            validate_hostname(hostname)?;
        }
        let country = &self.wifi_country;
        if country.len() != 2 || !country.chars().all(|ch| ch.is_ascii_uppercase()) {
            return Err(BootError::InvalidCountry(country.clone()));
        }
        if let Some(wifi) = &self.wifi {
            wifi.validate()?;
        }
        Ok(())
    }
}

/// Renders `wpa_supplicant.conf`.
#[must_use]
pub fn render_wpa_supplicant(wifi: &WifiCredentials, country: &str) -> String {
    format!(
        "country={country}\n\
         ctrl_interface=DIR=/var/run/wpa_supplicant GROUP=netdev\n\
         update_config=1\n\
         \n\
         network={{\n\
         \tssid=\"{ssid}\"\n\
         \tpsk=\"{pass}\"\n\
         \tkey_mgmt=WPA-PSK\n\
         }}\n",
        ssid = wifi.ssid,
        pass = wifi.pass,
    )
}

/// Renders the first-boot script setting `hostname` and the Wi-Fi country.
///
/// The script strips its own kernel hooks from `cmdline.txt` and deletes
/// itself, so it runs exactly once.
#[must_use]
pub fn render_firstrun(hostname: &str, country: &str) -> String {
    let name = quote(hostname);
    let hosts_edit = quote(&format!(
        "s/^127\\.0\\.1\\.1[[:space:]].*/127.0.1.1\\t{hostname}/"
    ));
    format!(
        "#!/bin/bash\n\
         set +e\n\
         \n\
         echo {name} > /etc/hostname\n\
         if grep -q '^127\\.0\\.1\\.1[[:space:]]' /etc/hosts; then\n\
         \tsed -i -E {hosts_edit} /etc/hosts\n\
         else\n\
         \tprintf '127.0.1.1\\t%s\\n' {name} >> /etc/hosts\n\
         fi\n\
         raspi-config nonint do_wifi_country {country}\n\
         \n\
         rm -f /boot/firstrun.sh\n\
         sed -i 's| systemd\\.run.*||g' /boot/cmdline.txt\n\
         exit 0\n",
        country = quote(country),
    )
}

/// Appends `extra` to a kernel command line, keeping existing order and
/// dropping duplicates. Returns `None` when nothing would change.
#[must_use]
pub fn merge_cmdline<S: AsRef<str>>(current: &str, extra: &[S]) -> Option<String> {
    let mut args: Vec<&str> = Vec::new();
    for arg in current.split_whitespace() {
        if !args.contains(&arg) {
            args.push(arg);
        }
    }
    for arg in extra.iter().map(AsRef::as_ref) {
        if !arg.is_empty() && !args.contains(&arg) {
            args.push(arg);
        }
    }
    let merged = format!("{}\n", args.join(" "));
    (merged != current).then_some(merged)
}

/// Which tasks changed the partition.
#[derive(Debug, Clone, Default)]
pub struct BootReport {
    /// One record per task, in order.
    pub steps: Vec<StepRecord>,
}

impl BootReport {
    /// Whether any task wrote to the partition.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.steps
            .iter()
            .any(|record| record.status == StepStatus::Changed)
    }
}

struct BootRun<'a> {
    dir: Dir,
    reporter: &'a mut dyn Reporter,
    report: BootReport,
}

impl BootRun<'_> {
    fn task<F>(&mut self, title: &str, body: F) -> Result<(), BootError>
    where
        F: FnOnce(&Dir) -> Result<bool, BootError>,
    {
        self.reporter.started(title);
        let status = match body(&self.dir) {
            Ok(true) => StepStatus::Changed,
            Ok(false) => StepStatus::Unchanged,
            Err(err) => {
                self.reporter.finished(title, Mark::Fail);
                return Err(err);
            }
        };
        self.reporter.finished(title, status.mark());
        self.report.steps.push(StepRecord {
            title: title.to_owned(),
            status,
        });
        Ok(())
    }
}

fn write_if_changed(dir: &Dir, file: &'static str, content: &str) -> Result<bool, BootError> {
    if dir.exists(file) {
        let current = dir
            .read_to_string(file)
            .map_err(|source| BootError::Io { file, source })?;
        if current == content {
            debug!(file, "already up to date");
            return Ok(false);
        }
    }
    dir.write(file, content)
        .map_err(|source| BootError::Io { file, source })?;
    Ok(true)
}

fn open_boot_dir(path: &Utf8Path) -> Result<Dir, BootError> {
    let dir = Dir::open_ambient_dir(path, ambient_authority()).map_err(|source| {
        BootError::NotADirectory {
            path: path.to_owned(),
            source,
        }
    })?;
    if !dir.is_file(CMDLINE) {
        return Err(BootError::MissingCmdline(path.to_owned()));
    }
    Ok(dir)
}

/// Prepares the boot partition described by `request`.
///
/// # Errors
///
/// Returns [`BootError`] for an invalid request, a path that is not a boot
/// partition, or the first failed file operation.
pub fn prepare_boot(
    request: &BootRequest,
    reporter: &mut dyn Reporter,
) -> Result<BootReport, BootError> {
    request.validate()?;
    let mut run = BootRun {
        dir: open_boot_dir(&request.boot_path)?,
        reporter,
        report: BootReport::default(),
    };

    run.task("Enabling ssh", |dir| {
        if dir.exists(SSH_MARKER) {
            return Ok(false);
        }
        dir.write(SSH_MARKER, "").map_err(|source| BootError::Io {
            file: SSH_MARKER,
            source,
        })?;
        Ok(true)
    })?;

    if let Some(wifi) = &request.wifi {
        let config = render_wpa_supplicant(wifi, &request.wifi_country);
        run.task("Setting up WiFi connection", |dir| {
            write_if_changed(dir, WPA_SUPPLICANT, &config)
        })?;
    }

    let mut args = request.cmdline_args.clone();
    if let Some(hostname) = &request.hostname {
        let script = render_firstrun(hostname, &request.wifi_country);
        run.task("Setting up first run script", |dir| {
            write_if_changed(dir, FIRSTRUN, &script)
        })?;
        args.extend(FIRSTRUN_HOOKS.iter().map(|hook| (*hook).to_owned()));
    }

    run.task("Adding args to cmdline.txt", |dir| {
        let current = dir.read_to_string(CMDLINE).map_err(|source| BootError::Io {
            file: CMDLINE,
            source,
        })?;
        let Some(merged) = merge_cmdline(&current, &args) else {
            return Ok(false);
        };
        dir.write(CMDLINE, merged).map_err(|source| BootError::Io {
            file: CMDLINE,
            source,
        })?;
        Ok(true)
    })?;

    Ok(run.report)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("console=tty1 root=PARTUUID=1\n", &["quiet"], Some("console=tty1 root=PARTUUID=1 quiet\n"))]
    #[case("console=tty1 quiet\n", &["quiet"], None)]
    #[case("console=tty1  quiet", &["quiet"], Some("console=tty1 quiet\n"))]
    #[case("a b a\n", &["c", "b"], Some("a b c\n"))]
    #[case("a\n", &[""], None)]
    fn merges_kernel_arguments(
        #[case] current: &str,
        #[case] extra: &[&str],
        #[case] expected: Option<&str>,
    ) {
        assert_eq!(merge_cmdline(current, extra).as_deref(), expected);
    }

    #[test]
    fn firstrun_quotes_the_hostname_and_removes_its_hooks() {
        let script = render_firstrun("rpi-lab", "ES");
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("echo rpi-lab > /etc/hostname"));
        assert!(script.contains("do_wifi_country ES"));
        assert!(script.contains("sed -i 's| systemd\\.run.*||g' /boot/cmdline.txt"));
    }

    #[rstest]
    #[case("home", "hunter22", true)]
    #[case("", "hunter22", false)]
    #[case("home", "short", false)]
    #[case("ho\"me", "hunter22", false)]
    #[case("home", "hunter22\nnetwork={", false)]
    fn wifi_credentials_are_checked(#[case] ssid: &str, #[case] pass: &str, #[case] valid: bool) {
        let wifi = WifiCredentials {
            ssid: ssid.to_owned(),
            pass: pass.to_owned(),
        };
        assert_eq!(wifi.validate().is_ok(), valid);
    }

    #[rstest]
    #[case("ES", true)]
    #[case("es", false)]
    #[case("ESP", false)]
    fn country_codes_are_checked(#[case] country: &str, #[case] valid: bool) {
        let request = BootRequest {
            boot_path: Utf8PathBuf::from("/boot"),
            hostname: None,
            wifi: None,
            wifi_country: country.to_owned(),
            cmdline_args: Vec::new(),
        };
        assert_eq!(request.validate().is_ok(), valid);
    }

    #[test]
    fn wpa_supplicant_lists_the_network() {
        let wifi = WifiCredentials {
            ssid: String::from("home"),
            pass: String::from("hunter22"),
        };
        let config = render_wpa_supplicant(&wifi, "GB");
        assert!(config.starts_with("country=GB\n"));
        assert!(config.contains("\tssid=\"home\"\n\tpsk=\"hunter22\"\n"));
    }
}
