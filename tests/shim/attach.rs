use crate::common::{SimJob, TestHook};
use crate::{run, sim};
use mpir_shim::mpir;
use mpir_shim::shim::error::Error;
use mpir_shim::shim::mode::Mode;
use mpir_shim::shim::pmix::{EventCode, Info, Key, Value};
use mpir_shim::shim::{Shim, ShimConfig};
use serial_test::serial;
use std::sync::Arc;

fn attach_config(pid: i32) -> ShimConfig {
    ShimConfig {
        mode: Mode::Attach,
        pid,
        ..ShimConfig::default()
    }
}

#[test]
#[serial]
fn test_attach_invalid_pid() {
    struct TestCase {
        config: ShimConfig,
        pid: i32,
    }
    let test_cases = [
        TestCase {
            config: attach_config(-1),
            pid: -1,
        },
        TestCase {
            config: attach_config(0),
            pid: 0,
        },
        TestCase {
            config: ShimConfig {
                pid: -7,
                ..ShimConfig::default()
            },
            pid: -7,
        },
    ];

    for tc in test_cases {
        let (sim, hook) = sim(SimJob::two_ranks());
        let err = Shim::new(tc.config, sim.clone(), hook).err().unwrap();

        assert!(matches!(err, Error::InvalidPid(pid) if pid == tc.pid));
        assert_eq!(err.to_string(), format!("Invalid connect pid {}", tc.pid));
        assert!(sim.calls().is_empty());
    }
}

#[test]
#[serial]
fn test_attach_returns_application_exit_code() {
    let mut job = SimJob::two_ranks();
    job.app_exits_when_watched = true;
    job.app_exit_code = Some(3);
    job.launcher_exit_code = Some(9);
    let (sim, hook) = sim(job);

    assert_eq!(run(attach_config(4242), &sim, &hook).unwrap(), 3);

    let snapshot = hook.snapshot();
    assert_eq!(snapshot.proctable_size, 2);
    assert_eq!(snapshot.proctable[0].pid, 100);
    assert_eq!(snapshot.proctable[1].pid, 101);

    let state = sim.state();
    assert_eq!(
        state.tool_attrs,
        vec![Info::new(Key::ServerPidinfo, Value::Pid(4242))]
    );
    assert!(state.apps.is_empty());
    assert!(state
        .notified
        .iter()
        .all(|(code, _)| *code != EventCode::DebuggerRelease));
    assert!(state.calls.contains(&"query pmix.qry.ns".to_string()));
    assert_eq!(state.finalize_calls, 1);

    assert_eq!(
        mpir::snapshot().abort_string.as_deref(),
        Some("The application exited with return code 3")
    );
}

#[test]
#[serial]
fn test_attach_creates_no_session_directory() {
    let mut job = SimJob::two_ranks();
    job.app_exits_when_watched = true;
    let (sim, _) = sim(job);
    mpir::reset();

    let mut shim = Shim::new(attach_config(4242), sim, Arc::new(TestHook::default())).unwrap();
    assert_eq!(shim.run().unwrap(), 0);
    assert!(shim.session().is_none());
}
