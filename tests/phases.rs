// End-to-end phase runs against fake tools, a scripted CA and a fixed clock

mod common;

use std::fs;

use edge_provisioner::acme::{CertStatus, Certificate};
use edge_provisioner::error::Component;
use edge_provisioner::resilience::{BreakerState, CheckpointState};
use edge_provisioner::{Phase, RunOptions};

use common::{t0, Harness, SINGLE_APP, TWO_APPS};

fn run() -> RunOptions {
    RunOptions::default()
}

fn forced() -> RunOptions {
    RunOptions {
        dry_run: false,
        force: true,
    }
}

fn read_checkpoint(h: &Harness) -> CheckpointState {
    serde_json::from_str(&fs::read_to_string(h.path("state/checkpoint.json")).unwrap()).unwrap()
}

fn read_cert(h: &Harness, domain: &str) -> Certificate {
    serde_json::from_str(&fs::read_to_string(h.path(&format!("certs/{}.json", domain))).unwrap()).unwrap()
}

#[tokio::test]
async fn test_single_domain_on_port_4000() {
    let h = Harness::new(SINGLE_APP);

    let infra = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(infra.exit_code(), 0, "{:?}", infra.failed);
    assert_eq!(infra.succeeded, vec!["example.test".to_string()]);

    let zone = fs::read_to_string(h.path("zones/example.test.zone")).unwrap();
    assert!(zone.contains("www.example.test."));
    assert!(zone.contains("api.example.test."));
    assert!(zone.contains("RRSIG"));
    assert!(h.path("zones/example.test.ds").exists());
    assert_eq!(h.runner.calls_to("nsd-control"), 1);
    assert_eq!(h.runner.calls_to("pfctl"), 2);

    let cert = read_cert(&h, "example.test");
    assert_eq!(cert.status, CertStatus::Valid);
    assert_eq!(
        cert.alt_names,
        vec!["example.test", "www.example.test", "api.example.test"]
    );

    h.advance(60);
    let deploy = h.orchestrator().run(Phase::Deploy, run()).await.unwrap();
    assert_eq!(deploy.exit_code(), 0, "{:?}", deploy.failed);

    let proxy = fs::read_to_string(h.path("haproxy.cfg")).unwrap();
    assert!(proxy.contains("server social 127.0.0.1:4000 check"));
    assert!(proxy.contains("http-request redirect scheme https code 301 if !acme_challenge"));
    assert!(proxy.contains("Strict-Transport-Security"));
    for host in ["example.test", "www.example.test", "api.example.test"] {
        assert!(proxy.contains(host), "{} not routed", host);
    }
    assert!(proxy.contains(&format!("crt {}", h.path("certs/example.test.pem").display())));

    let pf = fs::read_to_string(h.path("pf.conf")).unwrap();
    assert!(pf.contains("block in all"));

    // Clean runs leave no checkpoint behind
    assert!(!h.path("state/checkpoint.json").exists());
}

#[tokio::test]
async fn test_acme_failure_is_isolated_to_one_domain() {
    let h = Harness::new(TWO_APPS);
    h.authority.fail("beta.test");

    let infra = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(infra.exit_code(), 1);
    assert_eq!(infra.succeeded, vec!["alpha.test".to_string()]);
    assert_eq!(infra.failed.len(), 1);
    assert_eq!(infra.failed[0].domain, "beta.test");
    assert_eq!(infra.failed[0].component, Component::Certificate);
    assert!(infra.failed[0].reason.contains("3 attempts"));

    assert_eq!(h.authority.orders("beta.test"), 3);
    assert_eq!(h.authority.orders("alpha.test"), 1);
    assert_eq!(read_cert(&h, "alpha.test").status, CertStatus::Valid);

    let failed = read_cert(&h, "beta.test");
    assert_eq!(failed.status, CertStatus::Failed);
    assert!(failed.failure_reason.is_some());

    // Both zones still went live
    assert!(h.path("zones/beta.test.zone").exists());

    // Progress for the partial run is checkpointed
    let checkpoint = read_checkpoint(&h);
    assert_eq!(checkpoint.phase, "infra");
    assert!(checkpoint.completed.contains("alpha.test"));
    assert!(!checkpoint.completed.contains("beta.test"));

    h.advance(60);
    let deploy = h.orchestrator().run(Phase::Deploy, run()).await.unwrap();
    assert_eq!(deploy.exit_code(), 1);
    assert_eq!(deploy.succeeded, vec!["alpha.test".to_string()]);
    assert!(deploy
        .failed
        .iter()
        .any(|f| f.domain == "beta.test" && f.component == Component::Routing));

    let proxy = fs::read_to_string(h.path("haproxy.cfg")).unwrap();
    assert!(proxy.contains("www.alpha.test"));
    assert!(!proxy.contains("beta.test"));
}

#[tokio::test]
async fn test_resumed_infra_skips_completed_domains() {
    let h = Harness::new(TWO_APPS);
    h.authority.fail("beta.test");
    h.orchestrator().run(Phase::Infra, run()).await.unwrap();

    h.advance(60);
    let retry = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(retry.skipped, vec!["alpha.test".to_string()]);
    assert_eq!(h.authority.orders("alpha.test"), 1);
    assert_eq!(h.authority.orders("beta.test"), 6);
}

#[tokio::test]
async fn test_cpu_pressure_opens_breaker_and_blocks_next_phase() {
    // Default resilience settings: threshold 3, cooldown 60 s, cpu limit 80%
    let h = Harness::new(SINGLE_APP);
    h.sampler.set_cpu(85.0);

    let infra = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(infra.exit_code(), 1);
    assert!(infra.blocked.as_deref().unwrap().contains("cpu 85.0% > 80.0%"));
    assert!(h.runner.calls().is_empty());
    assert!(!h.path("zones/example.test.zone").exists());

    let checkpoint = read_checkpoint(&h);
    assert_eq!(
        checkpoint.breaker_state,
        BreakerState::Open {
            failures: 1,
            opened_at: t0()
        }
    );
    assert_eq!(checkpoint.resource_snapshot.unwrap().cpu_percent, 85.0);

    // Load is gone but the breaker still holds
    h.sampler.set_cpu(40.0);
    h.advance(30);
    let deploy = h.orchestrator().run(Phase::Deploy, run()).await.unwrap();
    assert_eq!(deploy.exit_code(), 1);
    assert!(deploy.blocked.as_deref().unwrap().contains("Circuit open"));
    assert!(h.runner.calls().is_empty());

    // After the cooldown the half-open trial admits the phase
    h.advance(31);
    let infra = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(infra.exit_code(), 0, "{:?}", infra.failed);
    assert!(infra.blocked.is_none());
    assert!(h.path("zones/example.test.zone").exists());
}

#[tokio::test]
async fn test_failed_dns_reload_holds_certificates_until_a_reload_succeeds() {
    let h = Harness::new(SINGLE_APP);
    h.runner.fail_on("nsd-control");

    let first = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(first.exit_code(), 1);
    assert_eq!(first.failed.len(), 1);
    assert_eq!(first.failed[0].domain, "example.test");
    assert_eq!(first.failed[0].component, Component::Zone);
    assert!(first.failed[0].reason.contains("DNS reload failed"));
    assert_eq!(h.authority.orders("example.test"), 0);
    assert_eq!(h.runner.calls_to("nsd-control"), 1);

    // Zone file and state are on disk, but the server never loaded them
    h.runner.clear_failures();
    h.advance(60);
    let second = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(second.exit_code(), 0, "{:?}", second.failed);
    assert_eq!(h.runner.calls_to("nsd-control"), 2);
    assert!(second.actions.contains(&"dns: server reloaded".to_string()));
    assert_eq!(h.authority.orders("example.test"), 1);
    assert_eq!(second.succeeded, vec!["example.test".to_string()]);

    // Reloaded and certified: nothing left to do
    h.advance(60);
    let third = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert!(third.up_to_date);
    assert_eq!(h.runner.calls_to("nsd-control"), 2);
}

#[tokio::test]
async fn test_breaker_opened_mid_phase_defers_remaining_domains() {
    let h = Harness::with_settings(TWO_APPS, "[resilience]\nfailure_threshold = 1\nconcurrency = 1\n");
    h.authority.fail("alpha.test");

    let infra = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(infra.exit_code(), 1);
    assert!(infra.blocked.is_none());
    assert!(infra.succeeded.is_empty());

    assert_eq!(infra.failed.len(), 1);
    assert_eq!(infra.failed[0].domain, "alpha.test");
    assert_eq!(infra.deferred.len(), 1);
    assert_eq!(infra.deferred[0].domain, "beta.test");
    assert_eq!(infra.deferred[0].component, Component::Certificate);
    assert!(infra.deferred[0].reason.contains("Circuit open"));
    assert_eq!(h.authority.orders("beta.test"), 0);

    let checkpoint = read_checkpoint(&h);
    assert!(checkpoint.breaker_state.is_open());
    assert!(checkpoint.completed.is_empty());

    // After the cooldown the deferred domain is picked up
    h.authority.recover("alpha.test");
    h.advance(61);
    let rerun = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(rerun.exit_code(), 0, "{:?} {:?}", rerun.failed, rerun.deferred);
    assert!(rerun.deferred.is_empty());
    assert_eq!(h.authority.orders("beta.test"), 1);
}

#[tokio::test]
async fn test_rerun_without_changes_is_noop() {
    let h = Harness::new(SINGLE_APP);
    h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    h.advance(60);
    h.orchestrator().run(Phase::Deploy, run()).await.unwrap();

    let zone = fs::read_to_string(h.path("zones/example.test.zone")).unwrap();
    let keys = fs::read_to_string(h.path("state/keys/example_test.keys.json")).unwrap();
    let proxy = fs::read_to_string(h.path("haproxy.cfg")).unwrap();
    let calls = h.runner.calls().len();

    h.advance(60);
    let skipped = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert!(skipped.up_to_date);
    assert_eq!(skipped.exit_code(), 0);

    let skipped = h.orchestrator().run(Phase::Deploy, run()).await.unwrap();
    assert!(skipped.up_to_date);

    // Forced rerun does the checks but changes nothing
    h.advance(60);
    let forced_run = h.orchestrator().run(Phase::Infra, forced()).await.unwrap();
    assert_eq!(forced_run.exit_code(), 0);
    assert!(forced_run.actions.is_empty(), "{:?}", forced_run.actions);
    assert_eq!(forced_run.succeeded, vec!["example.test".to_string()]);

    assert_eq!(fs::read_to_string(h.path("zones/example.test.zone")).unwrap(), zone);
    assert_eq!(
        fs::read_to_string(h.path("state/keys/example_test.keys.json")).unwrap(),
        keys
    );
    assert_eq!(h.authority.orders("example.test"), 1);
    assert_eq!(h.runner.calls().len(), calls);

    h.advance(60);
    let redeploy = h.orchestrator().run(Phase::Deploy, forced()).await.unwrap();
    assert!(redeploy.actions.is_empty());
    assert_eq!(fs::read_to_string(h.path("haproxy.cfg")).unwrap(), proxy);
    assert_eq!(h.runner.calls().len(), calls);
}

#[tokio::test]
async fn test_rejected_proxy_config_is_never_installed() {
    let h = Harness::new(SINGLE_APP);
    h.orchestrator().run(Phase::Infra, run()).await.unwrap();

    fs::write(h.path("haproxy.cfg"), "# previous configuration\n").unwrap();
    h.runner.fail_on("haproxy");

    h.advance(60);
    let deploy = h.orchestrator().run(Phase::Deploy, run()).await.unwrap();
    assert_eq!(deploy.exit_code(), 1);
    assert!(deploy
        .failed
        .iter()
        .any(|f| f.domain == "proxy" && f.component == Component::Routing));

    assert_eq!(
        fs::read_to_string(h.path("haproxy.cfg")).unwrap(),
        "# previous configuration\n"
    );
    assert_eq!(h.runner.calls_to("systemctl"), 0);
}

#[tokio::test]
async fn test_dry_run_has_no_side_effects() {
    let h = Harness::new(SINGLE_APP);

    let plan = h
        .orchestrator()
        .run(
            Phase::Infra,
            RunOptions {
                dry_run: true,
                force: false,
            },
        )
        .await
        .unwrap();

    assert!(plan.dry_run);
    assert!(plan.actions.iter().any(|a| a == "example.test: sign zone (new zone)"));
    assert!(plan.actions.iter().any(|a| a.starts_with("example.test: issue certificate")));
    assert!(plan.actions.iter().any(|a| a == "dns: reload server"));

    assert!(h.runner.calls().is_empty());
    assert_eq!(h.authority.orders("example.test"), 0);
    assert!(!h.path("zones").exists());
    assert!(!h.path("state/phases.log").exists());
}

#[tokio::test]
async fn test_interrupt_before_start_checkpoints_and_exits_130() {
    let h = Harness::new(TWO_APPS);
    let orchestrator = h.orchestrator();
    orchestrator
        .interrupt_handle()
        .store(true, std::sync::atomic::Ordering::SeqCst);

    let report = orchestrator.run(Phase::Infra, run()).await.unwrap();
    assert!(report.interrupted);
    assert_eq!(report.exit_code(), 130);
    assert!(report.succeeded.is_empty());
    assert!(report.skipped.contains(&"alpha.test".to_string()));
    assert!(h.path("state/checkpoint.json").exists());
    assert!(h.runner.calls().is_empty());
}

#[tokio::test]
async fn test_cleanup_removes_domains_no_longer_configured() {
    let mut h = Harness::new(TWO_APPS);
    h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    fs::write(h.path("webroot/.well-known/acme-challenge/stale"), "x").unwrap();

    h.set_applications(
        r#"
[[applications]]
name = "alpha"
port = 4000

[[applications.domains]]
name = "alpha.test"
subdomains = ["www"]
"#,
    );
    let reloads = h.runner.calls_to("nsd-control");

    let report = h.orchestrator().run(Phase::Cleanup, run()).await.unwrap();
    assert_eq!(report.exit_code(), 0, "{:?}", report.failed);
    assert_eq!(report.succeeded, vec!["beta.test".to_string()]);

    assert!(!h.path("zones/beta.test.zone").exists());
    assert!(!h.path("certs/beta.test.json").exists());
    assert!(!h.path("certs/beta.test.pem").exists());
    assert!(!h.path("webroot/.well-known/acme-challenge/stale").exists());
    assert!(h.path("zones/alpha.test.zone").exists());
    assert_eq!(h.runner.calls_to("nsd-control"), reloads + 1);
}

#[tokio::test]
async fn test_verify_reports_missing_artifacts() {
    let h = Harness::new(SINGLE_APP);

    let before = h.orchestrator().run(Phase::Verify, run()).await.unwrap();
    assert_eq!(before.exit_code(), 1);
    assert!(before
        .failed
        .iter()
        .any(|f| f.domain == "example.test" && f.component == Component::Zone));

    h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    h.advance(60);
    h.orchestrator().run(Phase::Deploy, run()).await.unwrap();

    let after = h.orchestrator().run(Phase::Verify, run()).await.unwrap();
    assert_eq!(after.exit_code(), 0, "{:?}", after.failed);
    assert_eq!(after.succeeded, vec!["example.test".to_string()]);
    // Verify never writes the phase log
    let log = fs::read_to_string(h.path("state/phases.log")).unwrap();
    assert!(!log.contains("\"verify\""));
}

#[tokio::test]
async fn test_invalid_entries_are_rejected_without_blocking_others() {
    let h = Harness::new(
        r#"
[[applications]]
name = "social"
port = 4000

[[applications.domains]]
name = "example.test"

[[applications]]
name = "broken"
port = 70000

[[applications.domains]]
name = "broken.test"
"#,
    );

    let report = h.orchestrator().run(Phase::Infra, run()).await.unwrap();
    assert_eq!(report.succeeded, vec!["example.test".to_string()]);
    assert!(!report.rejected.is_empty());
    assert_eq!(report.exit_code(), 1);
    assert!(!h.path("zones/broken.test.zone").exists());
}
