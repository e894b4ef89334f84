//! Lifecycle integration tests.
//!
//! Full actions run against the in-memory provider and the scripted
//! shell, with paused time so retries and polling sleeps are virtual.

use std::future::pending;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;

use stratus_core::{
    ClusterConfig, ClusterName, Error, Instance, InstanceState, Virtualization,
};
use stratus_lifecycle::deploy::DeployFuture;
use stratus_lifecycle::{
    Action, ActionOutcome, Deployer, DeploymentPlan, LifecycleController, Prompt, ShellDeployer,
    cancelled,
};
use stratus_provider::{MemoryProvider, ProviderCall};
use stratus_remote::{RemoteExecutor, ScriptedShell, ShellCall};

// ── Fixtures ──────────────────────────────────────────────────────

/// Records each plan along with how many probes had run when it arrived.
struct RecordingDeployer {
    shell: Arc<ScriptedShell>,
    plans: Mutex<Vec<(DeploymentPlan, usize)>>,
}

impl RecordingDeployer {
    fn plans(&self) -> Vec<(DeploymentPlan, usize)> {
        self.plans.lock().unwrap().clone()
    }
}

impl Deployer for RecordingDeployer {
    fn deploy<'a>(&'a self, plan: &'a DeploymentPlan) -> DeployFuture<'a> {
        let probes = self
            .shell
            .calls()
            .iter()
            .filter(|c| matches!(c, ShellCall::Probe { .. }))
            .count();
        self.plans.lock().unwrap().push((plan.clone(), probes));
        Box::pin(async { Ok(()) })
    }
}

struct Answer {
    yes: bool,
    asked: Mutex<Vec<String>>,
}

impl Prompt for Answer {
    fn confirm(&self, message: &str) -> bool {
        self.asked.lock().unwrap().push(message.to_string());
        self.yes
    }
}

struct Harness {
    provider: Arc<MemoryProvider>,
    shell: Arc<ScriptedShell>,
    deployer: Arc<RecordingDeployer>,
}

fn harness(zones: &[&str]) -> Harness {
    let provider =
        Arc::new(MemoryProvider::new(zones).with_image("ami-test", Some(Virtualization::Paravirtual)));
    let shell = Arc::new(ScriptedShell::new());
    let deployer = Arc::new(RecordingDeployer {
        shell: shell.clone(),
        plans: Mutex::new(Vec::new()),
    });
    Harness {
        provider,
        shell,
        deployer,
    }
}

impl Harness {
    fn controller(&self, config: ClusterConfig, answer: bool) -> (LifecycleController, Arc<Answer>) {
        let prompt = Arc::new(Answer {
            yes: answer,
            asked: Mutex::new(Vec::new()),
        });
        let controller = LifecycleController::new(
            config,
            ClusterName::new("demo"),
            self.provider.clone(),
            RemoteExecutor::new(self.shell.clone()),
            self.deployer.clone(),
            prompt.clone(),
        );
        (controller, prompt)
    }

    fn seed(&self, id: &str, state: InstanceState, group: &str, spot: bool) {
        self.provider.insert_instance(Instance {
            id: id.to_string(),
            state,
            instance_type: "m1.large".into(),
            public_address: format!("{id}.compute.example"),
            private_address: String::new(),
            zone: "a".into(),
            groups: vec![group.to_string()],
            spot_request_id: spot.then(|| format!("sir-{id}")),
        });
    }

    fn runs(&self) -> Vec<(String, u32)> {
        self.provider
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                ProviderCall::RunInstances { zone, count, .. } => Some((zone, count)),
                _ => None,
            })
            .collect()
    }
}

fn config(workers: u32) -> ClusterConfig {
    let mut config = ClusterConfig::default();
    config.cluster.workers = workers;
    config.cluster.zone = "all".into();
    config.cluster.image = Some("ami-test".into());
    config.access.key_pair = Some("ops".into());
    config.access.identity_file = Some(PathBuf::from("/keys/ops.pem"));
    config
}

// ── Launch ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn launch_spreads_workers_and_deploys_after_readiness() {
    let h = harness(&["a", "b"]);
    let (controller, _) = h.controller(config(4), true);

    let outcome = controller.run(Action::Launch, pending()).await.unwrap();
    assert_eq!(outcome, ActionOutcome::Completed);

    let runs = h.runs();
    assert_eq!(runs.len(), 3);
    assert_eq!(runs[0], ("a".to_string(), 2));
    assert_eq!(runs[1], ("b".to_string(), 2));
    assert_eq!(runs[2].1, 1);

    let instances = h.provider.instances();
    assert_eq!(instances.len(), 5);
    for instance in &instances {
        let tags = h.provider.tags_for(&instance.id);
        let role = if instance.in_group("demo-coordinator") {
            "coordinator"
        } else {
            assert!(instance.in_group("demo-workers"));
            "worker"
        };
        assert_eq!(
            tags,
            vec![("Name".to_string(), format!("demo-{role}-{}", instance.id))]
        );
    }

    let plans = h.deployer.plans();
    assert_eq!(plans.len(), 1);
    let (plan, probes_before_deploy) = &plans[0];
    assert_eq!(*probes_before_deploy, 5);
    assert_eq!(plan.workers.len(), 4);
    assert_eq!(plan.coordinators.len(), 1);
    assert!(plan.generate_ssh_key);
    assert_eq!(plan.cluster_url, format!("{}:7077", plan.coordinators[0]));
}

#[tokio::test(start_paused = true)]
async fn launch_creates_groups_with_default_rules() {
    let h = harness(&["a"]);
    let (controller, _) = h.controller(config(1), true);

    controller.run(Action::Launch, pending()).await.unwrap();

    let groups = h.provider.groups();
    let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
    assert_eq!(names, vec!["demo-coordinator", "demo-workers"]);
    assert!(groups.iter().all(|g| !g.rules.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn launch_into_occupied_namespace_fails() {
    let h = harness(&["a"]);
    h.seed("i-old", InstanceState::Running, "demo-workers", false);
    let (controller, _) = h.controller(config(2), true);

    let err = controller.run(Action::Launch, pending()).await.unwrap_err();

    assert!(matches!(err, Error::ClusterOccupied { .. }));
    assert!(h.provider.groups().is_empty());
    assert!(h.runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn launch_ignores_terminated_leftovers() {
    let h = harness(&["a"]);
    h.seed("i-old", InstanceState::Terminated, "demo-workers", false);
    let (controller, _) = h.controller(config(1), true);

    controller.run(Action::Launch, pending()).await.unwrap();
    assert_eq!(h.runs().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn launch_reuses_existing_coordinator_when_allowed() {
    let h = harness(&["a"]);
    h.seed("i-coord", InstanceState::Stopped, "demo-coordinator", false);

    let (refusing, _) = h.controller(config(2), true);
    let err = refusing.run(Action::Launch, pending()).await.unwrap_err();
    assert!(matches!(err, Error::ClusterOccupied { .. }));

    let mut reuse = config(2);
    reuse.cluster.reuse_coordinator = true;
    let (controller, _) = h.controller(reuse, true);
    controller.run(Action::Launch, pending()).await.unwrap();

    assert_eq!(h.runs(), vec![("a".to_string(), 2)]);
    assert!(h.provider.calls().contains(&ProviderCall::StartInstances {
        ids: vec!["i-coord".to_string()]
    }));
    let (plan, _) = &h.deployer.plans()[0];
    assert_eq!(plan.coordinators, vec!["i-coord.compute.example".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn launch_requires_credentials_and_workers() {
    let h = harness(&["a"]);

    let mut no_identity = config(1);
    no_identity.access.identity_file = None;
    let (controller, _) = h.controller(no_identity, true);
    assert!(matches!(
        controller.run(Action::Launch, pending()).await,
        Err(Error::Configuration(_))
    ));

    let mut no_key = config(1);
    no_key.access.key_pair = None;
    let (controller, _) = h.controller(no_key, true);
    assert!(matches!(
        controller.run(Action::Launch, pending()).await,
        Err(Error::Configuration(_))
    ));

    let (controller, _) = h.controller(config(0), true);
    assert!(matches!(
        controller.run(Action::Launch, pending()).await,
        Err(Error::Configuration(_))
    ));
    assert!(h.provider.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn launch_with_unknown_image_fails_before_acquiring() {
    let h = harness(&["a"]);
    let mut cfg = config(1);
    cfg.cluster.image = Some("ami-missing".into());
    let (controller, _) = h.controller(cfg, true);

    let err = controller.run(Action::Launch, pending()).await.unwrap_err();
    assert!(matches!(err, Error::Configuration(ref m) if m.contains("ami-missing")));
    assert!(h.runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn launch_joins_additional_group() {
    let h = harness(&["a"]);
    let shared = {
        use stratus_provider::CloudProvider;
        h.provider.create_group("shared", "").await.unwrap()
    };
    let mut cfg = config(1);
    cfg.cluster.additional_group = Some("shared".into());
    let (controller, _) = h.controller(cfg, true);

    controller.run(Action::Launch, pending()).await.unwrap();

    assert!(h.provider.instances().iter().all(|i| i.in_group("shared")));
    assert!(h.provider.calls().iter().any(|c| matches!(
        c,
        ProviderCall::RunInstances { group_ids, .. } if group_ids.contains(&shared.id)
    )));
}

#[tokio::test(start_paused = true)]
async fn spot_launch_interrupted_with_nothing_running_is_clean() {
    let h = harness(&["a"]);
    let mut cfg = config(2);
    cfg.cluster.spot_price = Some(0.05);
    let (controller, _) = h.controller(cfg, true);

    let err = controller
        .run(Action::Launch, tokio::time::sleep(Duration::from_secs(25)))
        .await
        .unwrap_err();

    assert!(err.is_clean_abort());
    let cancels = h
        .provider
        .calls()
        .into_iter()
        .filter(|c| matches!(c, ProviderCall::CancelSpotRequests { .. }))
        .count();
    assert_eq!(cancels, 1);
    assert!(h.runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn spot_launch_waits_for_grants_then_launches_coordinator() {
    let h = harness(&["a", "b"]);
    h.provider.set_spot_grants([1, 3]);
    let mut cfg = config(3);
    cfg.cluster.spot_price = Some(0.05);
    let (controller, _) = h.controller(cfg, true);

    controller.run(Action::Launch, pending()).await.unwrap();

    let instances = h.provider.instances();
    assert_eq!(instances.iter().filter(|i| i.is_spot()).count(), 3);
    assert_eq!(h.runs().len(), 1, "only the coordinator is on-demand");
}

#[tokio::test(start_paused = true)]
async fn failed_coordinator_launch_leaves_workers_running() {
    let h = harness(&["a"]);
    h.provider.reject_instance_type("m3.2xlarge");
    let mut cfg = config(2);
    cfg.cluster.coordinator_instance_type = Some("m3.2xlarge".into());
    let (controller, _) = h.controller(cfg, true);

    let err = controller.run(Action::Launch, pending()).await.unwrap_err();
    assert!(matches!(err, Error::ProviderRequest { .. }), "{err:?}");

    let instances = h.provider.instances();
    assert_eq!(instances.len(), 2);
    assert!(instances.iter().all(|i| i.in_group("demo-workers")));
    assert!(instances.iter().all(|i| !i.state.is_gone()));
    assert!(
        !h.provider
            .calls()
            .iter()
            .any(|c| matches!(c, ProviderCall::TerminateInstances { .. }))
    );
    assert!(h.deployer.plans().is_empty());
}

#[tokio::test(start_paused = true)]
async fn cancel_during_readiness_stops_launch_before_deploy() {
    let h = harness(&["a"]);
    h.provider.freeze_lifecycle(true);
    let (tx, rx) = watch::channel(false);
    let (controller, _) = h.controller(config(2), true);
    let controller = controller.with_cancel(rx);

    let operator = async {
        tokio::time::sleep(Duration::from_secs(60)).await;
        tx.send_replace(true);
    };
    let (result, ()) = tokio::join!(controller.run(Action::Launch, pending()), operator);

    assert!(matches!(result, Err(Error::Cancelled)));
    assert!(!Error::Cancelled.is_clean_abort());
    assert_eq!(h.runs().len(), 2, "workers and coordinator were launched");
    assert!(h.deployer.plans().is_empty());
}

#[tokio::test(start_paused = true)]
async fn one_cancel_signal_interrupts_spot_acquisition() {
    let h = harness(&["a"]);
    let mut cfg = config(2);
    cfg.cluster.spot_price = Some(0.05);
    let (tx, rx) = watch::channel(false);
    let (controller, _) = h.controller(cfg, true);
    let controller = controller.with_cancel(rx.clone());

    let mut interrupt = rx;
    let operator = async {
        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send_replace(true);
    };
    let (result, ()) = tokio::join!(
        controller.run(Action::Launch, async move { cancelled(&mut interrupt).await }),
        operator
    );

    let err = result.unwrap_err();
    assert!(err.is_clean_abort(), "{err:?}");
    assert!(h.runs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn launch_with_shell_deployer_distributes_key() {
    let h = harness(&["a"]);
    let mut cfg = config(2);
    cfg.software.setup_command = Some("./setup.sh".into());
    let deployer = Arc::new(ShellDeployer::new(
        RemoteExecutor::new(h.shell.clone()),
        cfg.software.setup_command.clone(),
    ));
    let controller = LifecycleController::new(
        cfg,
        ClusterName::new("demo"),
        h.provider.clone(),
        RemoteExecutor::new(h.shell.clone()),
        deployer,
        Arc::new(Answer {
            yes: true,
            asked: Mutex::new(Vec::new()),
        }),
    );

    controller.run(Action::Launch, pending()).await.unwrap();

    let calls = h.shell.calls();
    let first_exec = calls
        .iter()
        .position(|c| !matches!(c, ShellCall::Probe { .. }))
        .unwrap();
    assert!(
        calls[..first_exec]
            .iter()
            .all(|c| matches!(c, ShellCall::Probe { .. }))
    );
    let key_copies = calls
        .iter()
        .filter(|c| matches!(c, ShellCall::ExecWithInput { command, .. } if command == "tar x"))
        .count();
    assert_eq!(key_copies, 2);
    assert!(matches!(
        calls.last(),
        Some(ShellCall::Exec { command, .. }) if command == "./setup.sh"
    ));
}

// ── Resume ────────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn resume_redeploys_without_acquiring() {
    let h = harness(&["a"]);
    h.seed("i-c", InstanceState::Running, "demo-coordinator", false);
    h.seed("i-w", InstanceState::Running, "demo-workers", false);
    let (controller, _) = h.controller(config(1), true);

    controller.run(Action::Resume, pending()).await.unwrap();

    assert!(h.runs().is_empty());
    let (plan, _) = &h.deployer.plans()[0];
    assert!(plan.generate_ssh_key);
    assert_eq!(plan.workers, vec!["i-w.compute.example".to_string()]);
}

// ── Destroy ───────────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn destroy_terminates_and_deletes_groups() {
    let h = harness(&["a", "b"]);
    let (launcher, _) = h.controller(config(2), true);
    launcher.run(Action::Launch, pending()).await.unwrap();

    let mut cfg = config(2);
    cfg.cluster.delete_groups = true;
    let (controller, prompt) = h.controller(cfg, true);
    let outcome = controller.run(Action::Destroy, pending()).await.unwrap();

    assert_eq!(outcome, ActionOutcome::Completed);
    assert!(
        h.provider
            .instances()
            .iter()
            .all(|i| i.state == InstanceState::Terminated)
    );
    assert!(h.provider.groups().is_empty());
    let asked = prompt.asked.lock().unwrap();
    assert_eq!(asked.len(), 1);
    for instance in h.provider.instances() {
        assert!(asked[0].contains(&instance.public_address));
    }
}

#[tokio::test(start_paused = true)]
async fn destroy_keeps_groups_by_default() {
    let h = harness(&["a"]);
    let (launcher, _) = h.controller(config(1), true);
    launcher.run(Action::Launch, pending()).await.unwrap();

    let (controller, _) = h.controller(config(1), true);
    controller.run(Action::Destroy, pending()).await.unwrap();

    assert_eq!(h.provider.groups().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn declined_destroy_changes_nothing() {
    let h = harness(&["a"]);
    h.seed("i-c", InstanceState::Running, "demo-coordinator", false);
    let (controller, _) = h.controller(config(1), false);

    let outcome = controller.run(Action::Destroy, pending()).await.unwrap();

    assert_eq!(outcome, ActionOutcome::Declined);
    assert!(
        !h.provider
            .calls()
            .iter()
            .any(|c| matches!(c, ProviderCall::TerminateInstances { .. }))
    );
}

// ── Stop / start / reboot ─────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn stop_terminates_spot_workers_and_stops_the_rest() {
    let h = harness(&["a"]);
    h.seed("i-c", InstanceState::Running, "demo-coordinator", false);
    h.seed("i-w1", InstanceState::Running, "demo-workers", false);
    h.seed("i-w2", InstanceState::Running, "demo-workers", true);
    let (controller, _) = h.controller(config(2), true);

    controller.run(Action::Stop, pending()).await.unwrap();

    let calls = h.provider.calls();
    assert!(calls.contains(&ProviderCall::StopInstances {
        ids: vec!["i-c".to_string()]
    }));
    assert!(calls.contains(&ProviderCall::TerminateInstances {
        ids: vec!["i-w2".to_string()]
    }));
    assert!(calls.contains(&ProviderCall::StopInstances {
        ids: vec!["i-w1".to_string()]
    }));
}

#[tokio::test(start_paused = true)]
async fn declined_stop_does_not_look_up_the_cluster() {
    let h = harness(&["a"]);
    h.seed("i-c", InstanceState::Running, "demo-coordinator", false);
    let (controller, _) = h.controller(config(1), false);

    let outcome = controller.run(Action::Stop, pending()).await.unwrap();

    assert_eq!(outcome, ActionOutcome::Declined);
    assert!(h.provider.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn start_brings_back_workers_then_coordinator() {
    let h = harness(&["a"]);
    h.seed("i-c", InstanceState::Stopped, "demo-coordinator", false);
    h.seed("i-w", InstanceState::Stopped, "demo-workers", false);
    let (controller, _) = h.controller(config(1), true);

    controller.run(Action::Start, pending()).await.unwrap();

    let starts: Vec<Vec<String>> = h
        .provider
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            ProviderCall::StartInstances { ids } => Some(ids),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![vec!["i-w".to_string()], vec!["i-c".to_string()]]);
    let (plan, probes) = &h.deployer.plans()[0];
    assert!(!plan.generate_ssh_key);
    assert_eq!(*probes, 2);
}

#[tokio::test(start_paused = true)]
async fn start_requires_existing_coordinator() {
    let h = harness(&["a"]);
    h.seed("i-w", InstanceState::Stopped, "demo-workers", false);
    let (controller, _) = h.controller(config(1), true);

    let err = controller.run(Action::Start, pending()).await.unwrap_err();
    assert!(matches!(err, Error::ClusterNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn reboot_touches_only_workers() {
    let h = harness(&["a"]);
    h.seed("i-c", InstanceState::Running, "demo-coordinator", false);
    h.seed("i-w1", InstanceState::Running, "demo-workers", false);
    h.seed("i-w2", InstanceState::Running, "demo-workers", false);
    let (controller, _) = h.controller(config(2), true);

    controller.run(Action::RebootWorkers, pending()).await.unwrap();

    assert!(h.provider.calls().contains(&ProviderCall::RebootInstances {
        ids: vec!["i-w1".to_string(), "i-w2".to_string()]
    }));
}

// ── Login / get-coordinator ───────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn get_coordinator_returns_first_coordinator_address() {
    let h = harness(&["a"]);
    h.seed("i-c", InstanceState::Running, "demo-coordinator", false);
    let (controller, _) = h.controller(config(1), true);

    let outcome = controller.run(Action::GetCoordinator, pending()).await.unwrap();
    assert_eq!(
        outcome,
        ActionOutcome::Coordinator("i-c.compute.example".to_string())
    );
}

#[tokio::test(start_paused = true)]
async fn get_coordinator_of_missing_cluster_fails() {
    let h = harness(&["a"]);
    let (controller, _) = h.controller(config(1), true);
    let err = controller
        .run(Action::GetCoordinator, pending())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "ClusterNotFoundError");
}

#[tokio::test(start_paused = true)]
async fn login_opens_session_with_proxy() {
    let h = harness(&["a"]);
    h.seed("i-c", InstanceState::Running, "demo-coordinator", false);
    let mut cfg = config(1);
    cfg.access.proxy_port = Some("8157".into());
    let (controller, _) = h.controller(cfg, true);

    controller.run(Action::Login, pending()).await.unwrap();

    assert_eq!(
        h.shell.calls(),
        vec![ShellCall::Interactive {
            host: "i-c.compute.example".into(),
            forward: Some("8157".into())
        }]
    );
}
