use crate::common::{
    application, argv, launcher, SimJob, TestHook, APP_EXECUTABLE, APP_NSPACE,
};
use crate::{assert_calls_in_order, run, sim, NON_PROXY_ARGV, PROXY_ARGV};
use mpir_shim::mpir;
use mpir_shim::mpir::{MPIR_DEBUG_ABORTING, MPIR_DEBUG_SPAWNED};
use mpir_shim::shim::mode::Mode;
use mpir_shim::shim::pmix::{DataArray, EventCode, Info, Key, Value};
use mpir_shim::shim::{Shim, ShimConfig};
use serial_test::serial;
use std::sync::Arc;

fn proxy_config() -> ShimConfig {
    ShimConfig {
        mode: Mode::Proxy,
        argv: argv(PROXY_ARGV),
        ..ShimConfig::default()
    }
}

#[test]
#[serial]
fn test_proxy_run_publishes_rank_ordered_table() {
    let (sim, hook) = sim(SimJob::two_ranks());

    let code = run(proxy_config(), &sim, &hook).unwrap();
    assert_eq!(code, 0);

    let snapshot = hook.snapshot();
    assert_eq!(snapshot.proctable_size, 2);
    assert_eq!(snapshot.debug_state, MPIR_DEBUG_SPAWNED);
    assert_eq!(snapshot.abort_string, None);
    let pids = snapshot.proctable.iter().map(|e| e.pid).collect::<Vec<_>>();
    assert_eq!(pids, vec![100, 101]);
    for entry in &snapshot.proctable {
        assert_eq!(entry.host_name, "node1");
        assert_eq!(entry.executable_name, APP_EXECUTABLE);
    }
    assert_eq!(
        snapshot.proctable[0].host_name_ptr,
        snapshot.proctable[1].host_name_ptr
    );
    assert_eq!(
        snapshot.proctable[0].executable_name_ptr,
        snapshot.proctable[1].executable_name_ptr
    );

    assert_calls_in_order!(
        sim.calls(),
        [
            "tool_init",
            "register []",
            "spawn",
            "connect",
            "register [LauncherReady]",
            "register [LaunchComplete]",
            "register [JobTerminated]",
            "notify LaunchDirective",
            "query pmix.qry.ptable",
            "register [JobTerminated]",
            "notify DebuggerRelease",
            "notify DebuggerRelease",
            "tool_finalize",
        ]
    );

    let state = sim.state();
    assert_eq!(state.released, vec![launcher(), application()]);
    assert_eq!(state.finalize_calls, 1);
    assert!(state.acked > 0);
}

#[test]
#[serial]
fn test_proxy_run_cleans_up() {
    let (sim, hook) = sim(SimJob::two_ranks());
    mpir::reset();

    let mut shim = Shim::new(proxy_config(), sim.clone(), hook.clone()).unwrap();
    shim.run().unwrap();
    let session = shim.session().unwrap().dir().to_path_buf();
    assert!(session.exists());

    drop(shim);
    assert!(!session.exists());
    assert_eq!(sim.state().finalize_calls, 1);

    let snapshot = mpir::snapshot();
    assert_eq!(snapshot.proctable_size, 0);
    assert!(snapshot.proctable.is_empty());
}

#[test]
#[serial]
fn test_proxy_spawn_payload() {
    let (sim, hook) = sim(SimJob::two_ranks());
    run(proxy_config(), &sim, &hook).unwrap();

    let state = sim.state();
    let tool_nspace = format!("mpir.{}", std::process::id());
    assert!(state
        .tool_attrs
        .contains(&Info::string(Key::ToolNspace, tool_nspace.clone())));
    assert!(state.tool_attrs.contains(&Info::flag(Key::Launcher)));

    let app = &state.apps[0];
    assert_eq!(app.cmd, "prterun");
    assert_eq!(app.argv, argv(PROXY_ARGV));
    assert_eq!(app.maxprocs, 1);
    let pause = format!("PMIX_LAUNCHER_PAUSE_FOR_TOOL={tool_nspace}:0");
    assert!(app.env.contains(&pause));
    assert!(app
        .env
        .iter()
        .any(|e| e.starts_with("PMIX_SERVER_TMPDIR=")));
    assert!(app
        .env
        .iter()
        .any(|e| e.starts_with("PMIX_LAUNCHER_RENDEZVOUS_FILE=")));
    assert!(state
        .connect_attrs
        .iter()
        .any(|i| i.key == Key::ToolAttachmentFile));

    let (_, directives) = state
        .notified
        .iter()
        .find(|(code, _)| *code == EventCode::LaunchDirective)
        .unwrap();
    assert_eq!(
        directives[0],
        Info::new(Key::EventCustomRange, Value::Proc(launcher()))
    );
    assert_eq!(
        directives[2].value,
        Value::DataArray(DataArray::Info(vec![
            Info::flag(Key::DebugStopInInit),
            Info::flag(Key::NotifyLaunch),
        ]))
    );
}

#[test]
#[serial]
fn test_prun_selects_non_proxy_run() {
    let mut job = SimJob::two_ranks();
    job.launcher_exit_code = Some(5);
    let (sim, hook) = sim(job);
    mpir::reset();

    let config = ShimConfig {
        argv: argv(NON_PROXY_ARGV),
        ..ShimConfig::default()
    };
    let mut shim = Shim::new(config, sim.clone(), hook.clone()).unwrap();
    assert_eq!(shim.mode(), Mode::NonProxy);

    assert_eq!(shim.run().unwrap(), 5);
    drop(shim);

    let calls = sim.calls();
    assert!(!calls.contains(&"connect".to_string()));
    assert_eq!(
        calls
            .iter()
            .filter(|c| c.as_str() == "register [JobTerminated]")
            .count(),
        1
    );

    let state = sim.state();
    assert!(state.apps[0].env.is_empty());
    assert!(state.job_attrs.iter().any(|i| i.key == Key::SetEnvar));
    assert_eq!(state.released, vec![launcher(), application()]);

    let snapshot = mpir::snapshot();
    assert_eq!(snapshot.debug_state, MPIR_DEBUG_ABORTING);
    assert_eq!(
        snapshot.abort_string.as_deref(),
        Some("The launcher exited with return code 5")
    );
}

#[test]
#[serial]
fn test_application_exit_code_marks_aborting() {
    let mut job = SimJob::two_ranks();
    job.app_exit_code = Some(137);
    job.launcher_exit_code = None;
    let (sim, hook) = sim(job);

    assert_eq!(run(proxy_config(), &sim, &hook).unwrap(), 0);

    let snapshot = mpir::snapshot();
    assert_eq!(snapshot.debug_state, MPIR_DEBUG_ABORTING);
    let abort = snapshot.abort_string.unwrap();
    assert!(abort.contains("137"), "{abort}");
    assert!(abort.starts_with("The application"));
}

#[test]
#[serial]
fn test_application_released_by_hook() {
    let (sim, _) = sim(SimJob::two_ranks());
    let hook = Arc::new(TestHook {
        release_on_breakpoint: true,
        ..TestHook::default()
    });

    let config = ShimConfig {
        release_application: false,
        ..proxy_config()
    };
    assert_eq!(run(config, &sim, &hook).unwrap(), 0);

    // application first, from the breakpoint, then the launcher
    assert_eq!(sim.state().released, vec![application(), launcher()]);
    assert_eq!(hook.snapshots.lock().unwrap().len(), 1);
}

#[test]
#[serial]
fn test_launch_complete_namespace_targets_release() {
    let (sim, hook) = sim(SimJob::two_ranks());
    let mut shim = Shim::new(proxy_config(), sim.clone(), hook.clone()).unwrap();
    mpir::reset();
    shim.run().unwrap();

    assert_eq!(shim.context().application().nspace, APP_NSPACE);
    assert_eq!(shim.context().launcher(), launcher());
}
