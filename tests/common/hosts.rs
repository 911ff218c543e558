//! Scripted hosts shared by the layer behaviour tests.
//!
//! Include with:
//!
//! ```rust
//! #[path = "common/hosts.rs"]
//! mod hosts;
//! ```
//!
//! Each probe answers with the factory state until the matching mutation has
//! run, then with the provisioned state, so a second run against the same
//! host sees a converged machine.

#![expect(dead_code, reason = "each test binary uses a subset of the fixtures")]

use rpi_provisioner::keys::{AuthorizedKey, StaticKeys};
use rpi_provisioner::session::SshTarget;
use rpi_provisioner::test_support::{ScriptedHost, fail, ok};

pub const LOGIN_PASSWORD: &str = "raspberry";
pub const DEPLOYER_PASSWORD: &str = "correct-horse";
pub const INITIAL_ZSHRC: &str = "export ZSH=$HOME/.oh-my-zsh\nZSH_THEME=\"robbyrussell\"\nplugins=(git)\n";
pub const HARDENED_SSHD: &str = "UsePAM no\nPermitRootLogin no\nPasswordAuthentication no\n";

pub fn keys() -> StaticKeys {
    StaticKeys(vec![AuthorizedKey {
        key_type: String::from("ssh-ed25519"),
        material: String::from("AAAAC3NzaC1lZDI1NTE5AAAAIlaptop"),
        alias: String::from("laptop"),
    }])
}

/// A freshly flashed Pi reachable as `pi@10.0.0.12`.
pub fn factory_pi() -> ScriptedHost {
    let host = ScriptedHost::new(SshTarget::new("pi", "10.0.0.12", 22));
    host.on("getent group deploy", fail(2, ""))
        .on_after("groupadd deploy", "getent group deploy", ok("deploy:x:1001:\n"))
        .on("cat /etc/sudoers", ok("root ALL=(ALL:ALL) ALL\n"))
        .on_after(
            "NOPASSWD",
            "cat /etc/sudoers",
            ok("root ALL=(ALL:ALL) ALL\n%deploy ALL=(ALL) NOPASSWD: ALL\n"),
        )
        .on("id -u deployer", fail(1, "id: 'deployer': no such user"))
        .on_after("useradd", "id -u deployer", ok("1001\n"))
        .on("test -d /home/deployer/.ssh", fail(1, ""))
        .on_after("useradd", "test -d /home/deployer/.ssh", ok(""))
        .on("cat /home/deployer/.ssh/authorized_keys", fail(1, "No such file or directory"))
        .on_after(
            "chmod 600",
            "cat /home/deployer/.ssh/authorized_keys",
            ok("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIlaptop laptop\n"),
        )
        .on(
            "cat /etc/ssh/sshd_config",
            ok("#PermitRootLogin prohibit-password\nPasswordAuthentication yes\nUsePAM yes\n"),
        )
        .on_after("sshd_config.rpi-provisioner", "cat /etc/ssh/sshd_config", ok(HARDENED_SSHD))
        .on("getent passwd pi", ok("pi:x:1000:1000:,,,:/home/pi:/bin/bash\n"))
        .on_after(
            "usermod -s /usr/sbin/nologin pi",
            "getent passwd pi",
            ok("pi:x:1000:1000:,,,:/home/pi:/usr/sbin/nologin\n"),
        )
        .on("passwd -S pi", ok("pi P 01/01/2024 0 99999 7 -1\n"))
        .on_after("passwd -d pi", "passwd -S pi", ok("pi NP 01/01/2024 0 99999 7 -1\n"));
    host
}

/// A Pi that finished layer 1, reachable as `deployer@10.0.0.50`.
///
/// Nothing from layer 2 is installed yet.
pub fn hardened_pi() -> ScriptedHost {
    let host = ScriptedHost::new(SshTarget::new("deployer", "10.0.0.50", 22));
    host.on("find /var/lib/apt/lists", ok(""))
        .on_after(
            "apt-get update",
            "find /var/lib/apt/lists",
            ok("/var/lib/apt/lists/deb.debian.org_debian_dists_bookworm_main_binary-arm64_Packages\n"),
        )
        .on("apt-get -s upgrade", ok("Inst libc6 [2.36-9] (2.36-9+deb12u4 Debian:12.5/stable)\n"))
        .on_after("apt-get upgrade -y", "apt-get -s upgrade", ok("0 upgraded, 0 newly installed\n"))
        .on("dpkg-query", ok("git install ok installed\n"))
        .on_after(
            "apt-get install",
            "dpkg-query",
            ok(&installed_utility_packages()),
        )
        .on("command -v batcat", fail(1, ""))
        .on("command -v zsh", fail(1, ""))
        .on_after("apt-get install -y zsh", "command -v zsh", ok("/usr/bin/zsh\n"))
        .on("getent passwd deployer", ok("deployer:x:1001:1001:deployer:/home/deployer:/bin/bash\n"))
        .on_after(
            "usermod -s /usr/bin/zsh",
            "getent passwd deployer",
            ok("deployer:x:1001:1001:deployer:/home/deployer:/usr/bin/zsh\n"),
        )
        .on("test -d /home/deployer/.oh-my-zsh", fail(1, ""))
        .on_after("ohmyzsh", "test -d /home/deployer/.oh-my-zsh", ok(""))
        .on("test -d /home/deployer/.oh-my-zsh/custom", fail(1, ""))
        .on_after("fzf-zsh-plugin.git", ".oh-my-zsh/custom/plugins/", ok(""))
        .on_after("powerlevel10k.git", ".oh-my-zsh/custom/themes/", ok(""))
        .on("cat /home/deployer/.zshrc", ok(INITIAL_ZSHRC))
        .on("command -v tailscale", fail(1, ""))
        .on_after("tailscale.com/install.sh", "command -v tailscale", ok("/usr/bin/tailscale\n"))
        .on("tailscale status --json", ok(r#"{"BackendState": "NeedsLogin"}"#))
        .on_after("tailscale up", "tailscale status --json", ok(r#"{"BackendState": "Running"}"#))
        .on("command -v docker", fail(1, ""))
        .on_after("sh /tmp/get-docker.sh", "command -v docker", ok("/usr/bin/docker\n"))
        .on("id -nG deployer", ok("deployer sudo\n"))
        .on_after("usermod -aG docker", "id -nG deployer", ok("deployer sudo docker\n"));
    host
}

fn installed_utility_packages() -> String {
    rpi_provisioner::layer2::UTILITY_PACKAGES
        .iter()
        .map(|package| format!("{package} install ok installed\n"))
        .collect()
}
