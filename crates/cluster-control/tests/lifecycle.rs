//! End-to-end lifecycle tests against the in-memory provider.

mod common;

use std::time::Duration;

use cluster_control::template::TlsSpec;
use cluster_control::{
    Bootstrapper, ClusterDir, ClusterState, ClusterTemplate, Deprovisioner, Error, Phase,
    Provisioner, ServiceController, ServiceStatus, SourceUpdater, TemplateError,
};
use cluster_control::state::DeployKeyState;
use common::{created, FakeConnector, FakeEc2, FakeRegistry};
use tempfile::TempDir;

async fn up(ec2: &FakeEc2, dir: &ClusterDir, template: &ClusterTemplate) -> ClusterState {
    let mut state = Provisioner::new(ec2, dir, template).up().await.unwrap();
    let connector = FakeConnector::new();
    let report = Bootstrapper::new(dir, template, &connector)
        .run(&mut state)
        .await
        .unwrap();
    assert!(report.is_success());
    state
}

async fn down(ec2: &FakeEc2, dir: &ClusterDir, template: &ClusterTemplate) -> cluster_control::Result<()> {
    Deprovisioner::new(ec2, dir)
        .with_timeouts(template.timeouts)
        .down()
        .await
}

#[tokio::test]
async fn test_create_up_down_leaves_no_resources() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 2);
    let ec2 = FakeEc2::new();

    let state = up(&ec2, &dir, &template).await;
    assert_eq!(state.phase, Phase::Active);
    assert_eq!(state.instances.len(), 2);
    assert!(state.instances.iter().all(|i| i.ready && i.public_ip.is_some()));
    assert!(state.instances.iter().all(|i| i.bootstrap.is_complete()));
    assert!(state.instances.iter().all(|i| i.service == ServiceStatus::Stopped));
    assert_eq!(state.service_address(), Some("198.51.100.10"));
    assert!(dir.key_file("shop-key").exists());

    let persisted = ClusterState::load(&dir).unwrap().unwrap();
    assert_eq!(persisted, state);
    // vpc, subnet, igw, sg, key pair, eip, association, 2 instances
    assert_eq!(ec2.live_count(), 9);

    down(&ec2, &dir, &template).await.unwrap();

    assert_eq!(ec2.live(), Vec::new());
    assert!(ClusterState::load(&dir).unwrap().is_none());
    assert!(!dir.key_file("shop-key").exists());
    assert!(dir.template_file().exists());
}

#[tokio::test]
async fn test_allocation_order() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 1);
    let ec2 = FakeEc2::new();

    Provisioner::new(&ec2, &dir, &template).up().await.unwrap();

    let creates: Vec<String> = ec2
        .calls()
        .into_iter()
        .filter(|c| c.starts_with("create") || c.starts_with("allocate") || c == "run_instance" || c.starts_with("associate"))
        .collect();
    assert_eq!(
        creates,
        vec![
            "create_vpc",
            "create_subnet",
            "create_internet_gateway",
            "create_default_route",
            "create_security_group",
            "create_key_pair",
            "allocate_address",
            "run_instance",
            "associate_address",
        ]
    );
}

#[tokio::test]
async fn test_down_twice_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 1);
    let ec2 = FakeEc2::new();

    up(&ec2, &dir, &template).await;
    down(&ec2, &dir, &template).await.unwrap();
    let calls_after_first = ec2.calls().len();

    down(&ec2, &dir, &template).await.unwrap();

    assert_eq!(ec2.calls().len(), calls_after_first);
    assert!(ClusterState::load(&dir).unwrap().is_none());
    assert_eq!(ec2.live_count(), 0);
}

#[tokio::test]
async fn test_partial_instance_failure_keeps_created_instances() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 5);
    let ec2 = FakeEc2::new();
    ec2.fail_run_instance_at(3);

    let err = Provisioner::new(&ec2, &dir, &template).up().await.unwrap_err();
    match &err {
        Error::Provisioning { resource, message } => {
            assert_eq!(resource, "instance shop-2");
            assert!(message.contains("InsufficientInstanceCapacity"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(err.to_string().contains("run `down`"));

    let state = ClusterState::load(&dir).unwrap().unwrap();
    assert_eq!(state.phase, Phase::Provisioning);
    assert_eq!(state.instances.len(), 2);

    down(&ec2, &dir, &template).await.unwrap();

    assert_eq!(ec2.count_calls("terminate_instance"), 2);
    assert_eq!(ec2.live_count(), 0);
    assert!(ClusterState::load(&dir).unwrap().is_none());
}

#[tokio::test]
async fn test_up_resumes_from_partial_state() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 3);
    let ec2 = FakeEc2::new();
    ec2.fail_run_instance_at(2);

    assert!(Provisioner::new(&ec2, &dir, &template).up().await.is_err());
    let state = Provisioner::new(&ec2, &dir, &template).up().await.unwrap();

    assert_eq!(state.phase, Phase::Active);
    assert_eq!(state.instances.len(), 3);
    let indexes: Vec<usize> = state.instances.iter().map(|i| i.index).collect();
    assert_eq!(indexes, vec![0, 1, 2]);
    assert_eq!(ec2.count_calls("create_vpc"), 1);
    assert_eq!(ec2.count_calls("create_key_pair"), 1);
    assert_eq!(ec2.count_calls("authorize_ingress"), 1);
}

#[tokio::test]
async fn test_teardown_failure_keeps_state_for_retry() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 1);
    let ec2 = FakeEc2::new();

    let state = up(&ec2, &dir, &template).await;
    let group_id = state.security_group_id.clone().unwrap();
    ec2.fail_delete(&group_id);

    let err = down(&ec2, &dir, &template).await.unwrap_err();
    match &err {
        Error::Teardown(failures) => {
            assert_eq!(failures.len(), 1);
            assert_eq!(failures[0].resource, "security group");
            assert_eq!(failures[0].id, group_id);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Everything else was released and cleared; only the group remains.
    let remaining = ClusterState::load(&dir).unwrap().unwrap();
    assert_eq!(remaining.phase, Phase::Deprovisioning);
    assert_eq!(remaining.security_group_id.as_deref(), Some(group_id.as_str()));
    assert!(remaining.instances.is_empty());
    assert!(remaining.key_pair.is_none());
    assert!(remaining.elastic_ip.is_none());
    assert!(remaining.network.vpc_id.is_none());

    // `up` must not build on a half torn down cluster.
    let refused = Provisioner::new(&ec2, &dir, &template).up().await.unwrap_err();
    assert!(matches!(
        refused,
        Error::InvalidPhase {
            operation: "up",
            phase: Phase::Deprovisioning
        }
    ));

    ec2.heal(&group_id);
    let calls_before_retry = ec2.calls().len();
    down(&ec2, &dir, &template).await.unwrap();

    assert_eq!(ec2.calls()[calls_before_retry..], ["delete_security_group".to_string()]);
    assert_eq!(ec2.live_count(), 0);
    assert!(ClusterState::load(&dir).unwrap().is_none());
}

#[tokio::test]
async fn test_resource_already_gone_counts_as_released() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 1);
    let ec2 = FakeEc2::new();

    let mut state = up(&ec2, &dir, &template).await;
    // Recorded, but deleted behind our back.
    state.network.subnet_id = Some("subnet-gone".to_string());
    state.save(&dir).unwrap();

    down(&ec2, &dir, &template).await.unwrap();
    assert!(ClusterState::load(&dir).unwrap().is_none());
}

#[tokio::test]
async fn test_stop_continues_after_instance_failure() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 3);
    let ec2 = FakeEc2::new();
    up(&ec2, &dir, &template).await;

    let connector = FakeConnector::new().failing_on(1);
    let report = ServiceController::new(&dir, &template, &connector)
        .stop()
        .await
        .unwrap();

    assert_eq!(connector.instances_running("systemctl stop api.service"), vec![0, 1, 2]);
    assert_eq!(report.outcomes.len(), 3);
    let failed: Vec<usize> = report.failures().map(|o| o.index).collect();
    assert_eq!(failed, vec![1]);
    assert!(report.outcomes[0].is_success());
    assert!(report.outcomes[2].is_success());
    assert_eq!(
        report.ensure_success().unwrap_err().to_string(),
        "stop failed on 1 of 3 instance(s)"
    );

    let state = ClusterState::load(&dir).unwrap().unwrap();
    let statuses: Vec<ServiceStatus> = state.instances.iter().map(|i| i.service).collect();
    assert_eq!(
        statuses,
        vec![ServiceStatus::Stopped, ServiceStatus::Unknown, ServiceStatus::Stopped]
    );
}

#[tokio::test]
async fn test_start_marks_instances_running() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 2);
    let ec2 = FakeEc2::new();
    up(&ec2, &dir, &template).await;

    let connector = FakeConnector::new();
    let report = ServiceController::new(&dir, &template, &connector)
        .start()
        .await
        .unwrap();
    assert!(report.ensure_success().is_ok());

    let state = ClusterState::load(&dir).unwrap().unwrap();
    assert!(state
        .instances
        .iter()
        .all(|i| i.service == ServiceStatus::Running));
}

#[tokio::test]
async fn test_start_without_state_fails_before_any_command() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 2);

    let connector = FakeConnector::new();
    let err = ServiceController::new(&dir, &template, &connector)
        .start()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::NotProvisioned(_)));
    assert!(err.to_string().contains("run `up` first"));
    assert!(connector.commands().is_empty());
}

#[tokio::test]
async fn test_pull_and_build_run_in_checkout() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 2);
    let ec2 = FakeEc2::new();
    up(&ec2, &dir, &template).await;

    let connector = FakeConnector::new();
    let updater = SourceUpdater::new(&dir, &template, &connector);
    assert!(updater.pull().await.unwrap().is_success());
    assert!(updater.build().await.unwrap().is_success());

    assert_eq!(connector.instances_running("cd shop && git fetch origin main"), vec![0, 1]);
    assert_eq!(connector.instances_running("cd shop && npm ci"), vec![0, 1]);
}

#[tokio::test]
async fn test_bootstrap_retries_only_unfinished_instances() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 2);
    let ec2 = FakeEc2::new();
    let mut state = Provisioner::new(&ec2, &dir, &template).up().await.unwrap();

    let flaky = FakeConnector::new().failing_on(1);
    let report = Bootstrapper::new(&dir, &template, &flaky)
        .run(&mut state)
        .await
        .unwrap();
    assert_eq!(report.failures().map(|o| o.index).collect::<Vec<_>>(), vec![1]);
    assert!(state.instances[0].bootstrap.is_complete());
    assert!(!state.instances[1].bootstrap.packages);

    let healthy = FakeConnector::new();
    let mut state = ClusterState::load(&dir).unwrap().unwrap();
    let report = Bootstrapper::new(&dir, &template, &healthy)
        .run(&mut state)
        .await
        .unwrap();
    assert!(report.is_success());
    assert!(healthy.commands().iter().all(|(index, _)| *index == 1));
    assert_eq!(healthy.instances_running("sudo yum install -y nodejs git"), vec![1]);
    assert_eq!(healthy.instances_running("sudo systemctl enable api.service"), vec![1]);
}

const TEMPLATE: &str = "name: shop
region: us-east-1
instances:
  count: 2
  instance_type: t3.micro
  image: ami-1
service:
  name: api
  start: npm start
  repository: { url: 'https://github.com/acme/shop.git' }
";

#[test]
fn test_create_stores_materialized_template() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("cluster.yaml");
    std::fs::write(&file, TEMPLATE).unwrap();
    let dir = ClusterDir::new(tmp.path().join("cluster"));

    let template = dir.create(&file).unwrap();

    assert_eq!(dir.load_template().unwrap(), template);
    assert_eq!(template.service.repository.directory.as_deref(), Some("shop"));
    assert!(!dir.state_file().exists());
}

#[test]
fn test_create_missing_count_writes_nothing() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("cluster.yaml");
    std::fs::write(&file, TEMPLATE.replace("  count: 2\n", "")).unwrap();
    let dir = ClusterDir::new(tmp.path().join("cluster"));

    let err = dir.create(&file).unwrap_err();
    assert!(matches!(err, Error::Template(TemplateError::Parse { .. })), "{err}");
    assert!(err.to_string().contains("count"));

    assert!(!dir.template_file().exists());
    assert!(!dir.state_file().exists());
    assert!(ClusterState::load(&dir).unwrap().is_none());
}

#[test]
fn test_create_refuses_live_cluster() {
    let tmp = TempDir::new().unwrap();
    let file = tmp.path().join("cluster.yaml");
    std::fs::write(&file, TEMPLATE).unwrap();
    let dir = ClusterDir::new(tmp.path().join("cluster"));
    let template = dir.create(&file).unwrap();
    ClusterState::new(&template).save(&dir).unwrap();
    let stored = std::fs::read_to_string(dir.template_file()).unwrap();

    std::fs::write(&file, TEMPLATE.replace("count: 2", "count: 5")).unwrap();
    let err = dir.create(&file).unwrap_err();

    assert!(matches!(err, Error::ClusterExists(_)), "{err}");
    assert!(err.to_string().contains("run `down`"));
    assert_eq!(std::fs::read_to_string(dir.template_file()).unwrap(), stored);
    assert_eq!(dir.load_template().unwrap().instances.count, 2);
}

#[tokio::test]
async fn test_up_waits_for_new_instance_to_become_visible() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 1);
    let ec2 = FakeEc2::new();
    ec2.lag_describes(2);

    let state = Provisioner::new(&ec2, &dir, &template).up().await.unwrap();

    assert_eq!(state.phase, Phase::Active);
    assert!(state.instances[0].ready);
    assert_eq!(ec2.count_calls("describe_instance"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_up_times_out_on_instance_stuck_pending() {
    let tmp = TempDir::new().unwrap();
    let (dir, mut template) = created(tmp.path(), 1);
    template.timeouts.instance_ready_secs = 60;
    template.timeouts.poll_interval_secs = 5;
    let ec2 = FakeEc2::new();
    ec2.launch_pending();

    let started = tokio::time::Instant::now();
    let err = Provisioner::new(&ec2, &dir, &template).up().await.unwrap_err();

    assert!(started.elapsed() >= Duration::from_secs(60));
    match &err {
        Error::Provisioning { resource, message } => {
            assert_eq!(resource, "instance shop-0");
            assert!(message.contains("Timed out after 60 seconds"), "{message}");
        }
        other => panic!("unexpected error: {other}"),
    }
    let state = ClusterState::load(&dir).unwrap().unwrap();
    assert_eq!(state.phase, Phase::Provisioning);
    assert_eq!(state.instances.len(), 1);
    assert!(!state.instances[0].ready);
}

#[tokio::test]
async fn test_up_accepts_changes_made_by_interrupted_run() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 1);
    let ec2 = FakeEc2::new();
    ec2.already_applied();

    let state = Provisioner::new(&ec2, &dir, &template).up().await.unwrap();

    assert_eq!(state.phase, Phase::Active);
    assert!(state.network.gateway_attached);
    assert!(state.network.default_route);
    assert!(state.ingress_authorized);

    down(&ec2, &dir, &template).await.unwrap();
    assert_eq!(ec2.live_count(), 0);
}

#[tokio::test]
async fn test_bootstrap_uploads_tls_files() {
    let tmp = TempDir::new().unwrap();
    let (dir, mut template) = created(tmp.path(), 2);
    let cert = tmp.path().join("ssl.cert");
    let key = tmp.path().join("ssl.key");
    std::fs::write(&cert, "CERTIFICATE").unwrap();
    std::fs::write(&key, "PRIVATE KEY").unwrap();
    template.service.working_dir = Some("express-api".to_string());
    template.service.tls = Some(TlsSpec {
        cert,
        key,
        remote_dir: None,
    });
    let ec2 = FakeEc2::new();
    let mut state = Provisioner::new(&ec2, &dir, &template).up().await.unwrap();

    let connector = FakeConnector::new();
    let report = Bootstrapper::new(&dir, &template, &connector)
        .run(&mut state)
        .await
        .unwrap();
    assert!(report.is_success());
    assert!(state.instances.iter().all(|i| i.bootstrap.tls));

    let uploads: Vec<(usize, Vec<u8>)> = connector
        .uploads()
        .into_iter()
        .filter(|(_, script, _)| script.contains("shop/express-api/server."))
        .map(|(index, _, bytes)| (index, bytes))
        .collect();
    assert_eq!(
        uploads,
        vec![
            (0, b"CERTIFICATE".to_vec()),
            (0, b"PRIVATE KEY".to_vec()),
            (1, b"CERTIFICATE".to_vec()),
            (1, b"PRIVATE KEY".to_vec()),
        ]
    );
    assert_eq!(connector.instances_running("chmod 600 shop/express-api/server.key"), vec![0, 1]);

    // Uploaded before the unit is installed.
    let commands = connector.commands();
    let upload = commands.iter().position(|(_, c)| c.contains("server.cert")).unwrap();
    let install = commands.iter().position(|(_, c)| c.contains("systemctl enable")).unwrap();
    assert!(upload < install);

    let rerun = FakeConnector::new();
    let mut state = ClusterState::load(&dir).unwrap().unwrap();
    Bootstrapper::new(&dir, &template, &rerun)
        .run(&mut state)
        .await
        .unwrap();
    assert!(rerun.uploads().is_empty());
}

#[tokio::test]
async fn test_bootstrap_missing_tls_file_fails_before_any_command() {
    let tmp = TempDir::new().unwrap();
    let (dir, mut template) = created(tmp.path(), 1);
    template.service.tls = Some(TlsSpec {
        cert: tmp.path().join("missing.cert"),
        key: tmp.path().join("missing.key"),
        remote_dir: Some("certs".to_string()),
    });
    let ec2 = FakeEc2::new();
    let mut state = Provisioner::new(&ec2, &dir, &template).up().await.unwrap();

    let connector = FakeConnector::new();
    let err = Bootstrapper::new(&dir, &template, &connector)
        .run(&mut state)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Io { .. }), "{err}");
    assert!(connector.commands().is_empty());
}

#[tokio::test]
async fn test_deploy_key_is_revoked_on_down() {
    let tmp = TempDir::new().unwrap();
    let (dir, template) = created(tmp.path(), 1);
    let ec2 = FakeEc2::new();
    let mut state = ClusterState::new(&template);
    state.deploy_key = Some(DeployKeyState {
        owner: "acme".into(),
        repo: "shop".into(),
        key_id: 12,
    });
    state.save(&dir).unwrap();
    std::fs::write(dir.deploy_key_file(), "private").unwrap();

    // Without a GitHub client the key cannot be confirmed deleted.
    let err = down(&ec2, &dir, &template).await.unwrap_err();
    assert!(matches!(&err, Error::Teardown(f) if f[0].resource == "deploy key"));
    assert!(ClusterState::load(&dir).unwrap().unwrap().deploy_key.is_some());

    let registry = FakeRegistry::with_key(12);
    Deprovisioner::new(&ec2, &dir)
        .with_deploy_keys(&registry)
        .down()
        .await
        .unwrap();
    assert_eq!(registry.key_count(), 0);
    assert!(!dir.deploy_key_file().exists());

    // Already revoked keys count as released.
    let mut state = ClusterState::new(&template);
    state.deploy_key = Some(DeployKeyState {
        owner: "acme".into(),
        repo: "shop".into(),
        key_id: 99,
    });
    state.save(&dir).unwrap();
    Deprovisioner::new(&ec2, &dir)
        .with_deploy_keys(&registry)
        .down()
        .await
        .unwrap();
    assert!(ClusterState::load(&dir).unwrap().is_none());
    assert!(ec2.calls().is_empty());
}
