//! Behavioural coverage for the hardening layer against a scripted Pi.

#[path = "common/hosts.rs"]
mod hosts;

use hosts::{DEPLOYER_PASSWORD, LOGIN_PASSWORD, factory_pi, keys};
use rpi_provisioner::keys::StaticKeys;
use rpi_provisioner::report::RecordingReporter;
use rpi_provisioner::session::{SessionError, SshTarget};
use rpi_provisioner::test_support::{ScriptedConnector, ScriptedHost, fail};
use rpi_provisioner::{
    DeployerAccount, HardeningOrchestrator, HardeningRequest, LayerError, MergePolicy, StepStatus,
};
use rstest::{fixture, rstest};

#[fixture]
fn request() -> HardeningRequest {
    HardeningRequest {
        target: SshTarget::new("pi", "10.0.0.12", 22),
        password: String::from(LOGIN_PASSWORD),
        deployer: DeployerAccount {
            user: String::from("deployer"),
            group: String::from("deploy"),
            password: String::from(DEPLOYER_PASSWORD),
        },
        root_password: None,
        keys_uri: String::from("keys.json"),
        merge: MergePolicy::Replace,
        hostname: None,
        network: None,
    }
}

fn orchestrator(host: &ScriptedHost) -> HardeningOrchestrator<ScriptedConnector, StaticKeys> {
    HardeningOrchestrator::new(ScriptedConnector::new(host.clone()), keys())
}

fn position(host: &ScriptedHost, pattern: &str) -> usize {
    host.position(pattern)
        .unwrap_or_else(|| panic!("expected a command containing {pattern:?}"))
}

#[rstest]
fn hardening_runs_every_step_in_order(request: HardeningRequest) {
    let host = factory_pi();
    let mut reporter = RecordingReporter::default();

    let report = orchestrator(&host)
        .execute(&request, &mut reporter)
        .expect("hardening should succeed");

    let titles: Vec<&str> = report.steps.iter().map(|step| step.title.as_str()).collect();
    assert_eq!(
        titles,
        [
            "Creating group deploy",
            "Granting passwordless sudo to deploy",
            "Creating user deployer",
            "Uploading authorized keys for deployer",
            "Hardening sshd configuration",
            "Disabling login for pi",
        ]
    );
    assert!(report.steps.iter().all(|step| step.status == StepStatus::Changed));
    assert!(!report.already_provisioned);
    assert_eq!(host.close_calls(), 1);

    assert!(position(&host, "groupadd deploy") < position(&host, "useradd"));
    assert!(position(&host, "useradd") < position(&host, "chpasswd"));
    assert!(position(&host, "chmod 600") < position(&host, "sshd_config.backup"));
    assert!(position(&host, "sshd_config.backup") < position(&host, "install -o root -g root -m 644"));
    assert!(position(&host, "sshd -t") < position(&host, "systemctl reload ssh"));
    assert!(position(&host, "systemctl reload ssh") < position(&host, "passwd -d pi"));
}

#[rstest]
fn second_run_changes_nothing(request: HardeningRequest) {
    let host = factory_pi();
    let hardening = orchestrator(&host);
    hardening
        .execute(&request, &mut RecordingReporter::default())
        .expect("first run should succeed");
    host.clear_history();

    let mut reporter = RecordingReporter::default();
    let report = hardening
        .execute(&request, &mut reporter)
        .expect("second run should succeed");

    assert!(!report.changed());
    assert!(report.steps.iter().all(|step| step.status == StepStatus::Unchanged));
    for mutation in ["groupadd", "useradd", "chpasswd", "NOPASSWD", "sshd_config.rpi-provisioner", "passwd -d", "usermod"] {
        assert_eq!(host.count(mutation), 0, "{mutation} ran again");
    }
}

#[rstest]
fn refused_password_login_means_already_provisioned(request: HardeningRequest) {
    let host = factory_pi();
    let connector = ScriptedConnector::new(host.clone()).failing_with(|target, _| {
        Some(SessionError::AuthMethodUnsupported {
            user: target.user.clone(),
            offered: String::from("publickey"),
        })
    });
    let mut reporter = RecordingReporter::default();

    let report = HardeningOrchestrator::new(connector, keys())
        .execute(&request, &mut reporter)
        .expect("a hardened host is not an error");

    assert!(report.already_provisioned);
    assert!(report.steps.is_empty());
    assert!(host.invocations().is_empty());
}

#[rstest]
fn rejected_password_is_a_connection_error(request: HardeningRequest) {
    let host = factory_pi();
    let connector = ScriptedConnector::new(host.clone()).failing_with(|target, _| {
        Some(SessionError::AuthRejected {
            user: target.user.clone(),
            message: String::from("Authentication failed"),
        })
    });

    let err = HardeningOrchestrator::new(connector, keys())
        .execute(&request, &mut RecordingReporter::default())
        .expect_err("a wrong password must abort");

    assert!(matches!(err, LayerError::Connect { .. }));
    assert!(host.invocations().is_empty());
}

#[rstest]
fn secrets_stay_out_of_rendered_commands(request: HardeningRequest) {
    let host = factory_pi();

    orchestrator(&host)
        .execute(&request, &mut RecordingReporter::default())
        .expect("hardening should succeed");

    let invocations = host.invocations();
    assert!(
        invocations
            .iter()
            .all(|inv| !inv.redacted.contains(DEPLOYER_PASSWORD))
    );
    assert!(invocations.iter().all(|inv| !inv.script.contains(LOGIN_PASSWORD)));
    assert!(
        invocations
            .iter()
            .filter(|inv| inv.script.starts_with("sudo -S"))
            .all(|inv| inv.stdin.as_deref().is_some_and(|input| input.contains(LOGIN_PASSWORD)))
    );
}

#[rstest]
fn failing_sshd_check_restores_backup_and_keeps_earlier_steps(request: HardeningRequest) {
    let host = factory_pi();
    host.on("sshd -t", fail(255, "/etc/ssh/sshd_config line 3: Bad configuration option"));

    let err = orchestrator(&host)
        .execute(&request, &mut RecordingReporter::default())
        .expect_err("an invalid sshd config must stop the run");

    let report = err.report().expect("step failures carry the partial report");
    assert_eq!(
        report.status_of("Creating user deployer"),
        Some(&StepStatus::Changed)
    );
    assert!(matches!(
        report.status_of("Hardening sshd configuration"),
        Some(StepStatus::Failed(_))
    ));
    assert!(position(&host, "sshd -t") < position(&host, "cp -p /etc/ssh/sshd_config.backup /etc/ssh/sshd_config"));
    assert_eq!(host.count("systemctl reload ssh"), 0);
    assert_eq!(host.count("passwd -d pi"), 0);
    assert_eq!(host.close_calls(), 1);
}

#[rstest]
fn login_user_cannot_be_the_deployer(mut request: HardeningRequest) {
    request.deployer.user = String::from("pi");
    let host = factory_pi();

    let err = orchestrator(&host)
        .execute(&request, &mut RecordingReporter::default())
        .expect_err("reusing the login account is rejected");

    assert!(matches!(err, LayerError::Invalid(_)));
    assert!(host.invocations().is_empty());
}
