//! Behavioural coverage for the bootstrap layer against a hardened Pi.

#[path = "common/hosts.rs"]
mod hosts;

use camino::Utf8PathBuf;
use hosts::{INITIAL_ZSHRC, hardened_pi};
use rpi_provisioner::layer2::{ENABLED_PLUGINS, set_plugins, set_theme};
use rpi_provisioner::report::{Mark, RecordingReporter};
use rpi_provisioner::session::SshTarget;
use rpi_provisioner::test_support::{ScriptedConnector, ScriptedHost, fail, ok};
use rpi_provisioner::{
    Advisory, BootstrapOrchestrator, BootstrapRequest, LayerError, LayerReport, StepStatus,
};
use rstest::{fixture, rstest};

const AUTH_KEY: &str = "tskey-auth-k3y";

#[fixture]
fn request() -> BootstrapRequest {
    BootstrapRequest {
        target: SshTarget::new("deployer", "10.0.0.50", 22),
        key_path: Utf8PathBuf::from("/home/operator/.ssh/id_ed25519"),
        key_passphrase: None,
        tailscale_auth_key: Some(String::from(AUTH_KEY)),
    }
}

fn bootstrap(
    host: &ScriptedHost,
    request: &BootstrapRequest,
    reporter: &mut RecordingReporter,
) -> Result<LayerReport, LayerError> {
    BootstrapOrchestrator::new(ScriptedConnector::new(host.clone())).execute(request, reporter)
}

#[rstest]
fn fresh_host_gets_every_step(request: BootstrapRequest) {
    let host = hardened_pi();
    let mut reporter = RecordingReporter::default();

    let report = bootstrap(&host, &request, &mut reporter).expect("bootstrap should succeed");

    let titles: Vec<&str> = report.steps.iter().map(|step| step.title.as_str()).collect();
    assert_eq!(
        titles,
        [
            "Updating and upgrading packages",
            "Installing utility packages",
            "Installing zsh",
            "Installing oh-my-zsh",
            "Configuring zsh plugins",
            "Installing powerlevel10k theme",
            "Installing Tailscale",
            "Starting Tailscale",
            "Installing Docker",
            "Adding deployer to the docker group",
        ]
    );
    assert!(report.steps.iter().all(|step| step.status == StepStatus::Changed));
    assert_eq!(host.count("git clone"), 4);
    assert_eq!(host.close_calls(), 1);

    let expected_rc = set_theme(&set_plugins(INITIAL_ZSHRC, ENABLED_PLUGINS).expect("plugins"))
        .expect("theme");
    assert_eq!(
        host.written_files().get("/home/deployer/.zshrc"),
        Some(&expected_rc)
    );
}

#[rstest]
fn second_run_only_probes(request: BootstrapRequest) {
    let host = hardened_pi();
    bootstrap(&host, &request, &mut RecordingReporter::default()).expect("first run");
    host.clear_history();

    let mut reporter = RecordingReporter::default();
    let report = bootstrap(&host, &request, &mut reporter).expect("second run");

    assert!(!report.changed());
    assert!(report.steps.iter().all(|step| step.status == StepStatus::Unchanged));
    assert!(
        reporter
            .lines
            .iter()
            .skip(1)
            .all(|(_, mark)| *mark == Mark::Skipped)
    );
    for mutation in [
        "apt-get update",
        "apt-get upgrade -y",
        "apt-get install",
        "usermod",
        "ohmyzsh",
        "git clone",
        "install.sh",
        "get-docker.sh",
        "tailscale up",
    ] {
        assert_eq!(host.count(mutation), 0, "{mutation} ran again");
    }
}

#[rstest]
fn docker_installer_failure_is_soft(request: BootstrapRequest) {
    let host = hardened_pi();
    host.on(
        "sh /tmp/get-docker.sh",
        fail(100, "E: Sub-process /usr/bin/dpkg returned an error code (1)"),
    );

    let report = bootstrap(&host, &request, &mut RecordingReporter::default())
        .expect("a failed docker install does not abort the layer");

    let Some(StepStatus::SoftFailure(advisory)) = report.status_of("Installing Docker") else {
        panic!("docker install should be a soft failure: {report:?}");
    };
    assert!(matches!(advisory, Advisory::Reboot { .. }));
    assert!(advisory.reason().contains("dpkg returned an error code"));
    assert_eq!(
        advisory.next_command("deployer", "10.0.0.50"),
        "ssh deployer@10.0.0.50 sudo reboot"
    );
    assert!(report.has_soft_failure());
    assert_eq!(
        report.status_of("Adding deployer to the docker group"),
        Some(&StepStatus::Changed)
    );
    assert!(host.position("rm -f /tmp/get-docker.sh") < host.position("usermod -aG docker"));
}

#[rstest]
fn docker_without_compose_plugin_stops_the_run(request: BootstrapRequest) {
    let host = hardened_pi();
    host.on("command -v docker", ok("/usr/bin/docker\n"))
        .on("docker compose version", fail(125, "docker: 'compose' is not a docker command."));

    let err = bootstrap(&host, &request, &mut RecordingReporter::default())
        .expect_err("a docker install without compose v2 is a hard failure");

    let LayerError::Step { title, .. } = &err else {
        panic!("expected a step failure, got {err:?}");
    };
    assert_eq!(title, "Installing Docker");
    assert_eq!(host.count("usermod -aG docker"), 0);
    assert_eq!(host.close_calls(), 1);
}

#[rstest]
fn missing_auth_key_leaves_vpn_login_to_the_operator(mut request: BootstrapRequest) {
    request.tailscale_auth_key = None;
    let host = hardened_pi();

    let report = bootstrap(&host, &request, &mut RecordingReporter::default())
        .expect("bootstrap should succeed");

    let follow_ups = report.manual_follow_ups();
    assert_eq!(follow_ups.len(), 1);
    let advisory = follow_ups.first().expect("one follow-up");
    assert_eq!(
        advisory.next_command("deployer", "10.0.0.50"),
        "ssh deployer@10.0.0.50 sudo tailscale up"
    );
    assert!(report.needs_manual_follow_up());
    assert!(!report.has_soft_failure());
    assert_eq!(host.count("tailscale up"), 0);
    assert_eq!(
        report.status_of("Installing Docker"),
        Some(&StepStatus::Changed)
    );
}

#[rstest]
fn auth_key_never_reaches_the_logs(request: BootstrapRequest) {
    let host = hardened_pi();

    bootstrap(&host, &request, &mut RecordingReporter::default()).expect("bootstrap should succeed");

    assert_eq!(host.count(AUTH_KEY), 1);
    assert!(host.commands().iter().all(|line| !line.contains(AUTH_KEY)));
}

#[rstest]
fn blank_auth_key_is_rejected_before_connecting(mut request: BootstrapRequest) {
    request.tailscale_auth_key = Some(String::from("  "));
    let host = hardened_pi();
    let connector = ScriptedConnector::new(host.clone());

    let err = BootstrapOrchestrator::new(connector.clone())
        .execute(&request, &mut RecordingReporter::default())
        .expect_err("blank keys are invalid");

    assert!(matches!(err, LayerError::Invalid(_)));
    assert!(connector.attempts().is_empty());
}
