use lanes_core::adaptor::{AdaptorRegistry, ChannelAdaptor};
use lanes_core::lanes::ShardAssigner;
use lanes_core::config::{default_config, AssignmentPolicy, RuntimeConfig, ShutdownPolicy};
use lanes_core::{
    Buffer, ChannelSession, DispatchError, Dispatcher, PoolError, SessionId, StartError, Task,
};

use std::cell::RefCell;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};

#[derive(Default)]
struct TestSession {
    id: u64,
    closes: AtomicUsize,
    panic_on_close: bool,
}

impl TestSession {
    fn new(id: u64) -> Arc<Self> {
        Arc::new(TestSession {
            id,
            ..TestSession::default()
        })
    }
}

impl ChannelSession for TestSession {
    fn id(&self) -> SessionId {
        SessionId(self.id)
    }

    fn close(&self) -> io::Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_close {
            panic!("session torn down twice");
        }
        Ok(())
    }
}

fn config(lanes: usize) -> RuntimeConfig {
    let mut config = default_config();
    config.lanes.count = lanes;
    config.lanes.name_prefix = "test-lane".to_string();
    config.buffer_pool.core_size = 8;
    config.buffer_pool.buffer_size = 256;
    config
}

fn started(config: RuntimeConfig) -> Dispatcher {
    let dispatcher = Dispatcher::new(config, AdaptorRegistry::new());
    dispatcher.start().unwrap();
    dispatcher
}

#[test]
fn test_explicit_shard_runs_on_its_lane() {
    let dispatcher = started(config(4));
    let seen = Arc::new(Mutex::new(Vec::new()));

    for lane in 0..4 {
        for n in 0..10 {
            let seen = Arc::clone(&seen);
            let task = Task::new(TestSession::new(n), move |ctx| {
                let name = thread::current().name().unwrap_or_default().to_string();
                seen.lock().unwrap().push((lane, ctx.lane(), name));
                Ok(())
            })
            .on_shard(lane);
            assert_eq!(dispatcher.submit(task).unwrap(), lane);
        }
    }
    dispatcher.wait_for_completion();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 40);
    for (requested, ran_on, name) in seen.iter() {
        assert_eq!(requested, ran_on);
        assert_eq!(name, &format!("test-lane-{}", requested));
    }
    dispatcher.stop().unwrap();
}

#[test]
fn test_assign_shard_keeps_explicit_index_and_matches_submit() {
    let dispatcher = started(config(4));

    let pinned = Task::new(TestSession::new(9), |_ctx| Ok(())).on_shard(3);
    assert_eq!(dispatcher.assign_shard(&pinned), 3);
    assert_eq!(dispatcher.submit(pinned).unwrap(), 3);

    for n in 0..20u64 {
        let task = Task::new(TestSession::new(n), |_ctx| Ok(()));
        let expected = dispatcher.assign_shard(&task);
        assert!(expected < 4);
        assert_eq!(dispatcher.assign_shard(&task), expected);
        assert_eq!(dispatcher.submit(task).unwrap(), expected);
    }
    dispatcher.wait_for_completion();
    dispatcher.stop().unwrap();
}

/// Sends every unassigned task to the last lane.
struct LastLane;

impl ShardAssigner for LastLane {
    fn assign(&self, _task: &Task, lanes: usize) -> usize {
        lanes - 1
    }
}

#[test]
fn test_custom_assigner_is_honored() {
    let dispatcher =
        Dispatcher::new(config(3), AdaptorRegistry::new()).with_assigner(Box::new(LastLane));
    dispatcher.start().unwrap();
    let lanes_seen = Arc::new(Mutex::new(Vec::new()));

    for n in 0..10u64 {
        let lanes_seen = Arc::clone(&lanes_seen);
        let task = Task::new(TestSession::new(n), move |ctx| {
            lanes_seen.lock().unwrap().push(ctx.lane());
            Ok(())
        });
        assert_eq!(dispatcher.assign_shard(&task), 2);
        assert_eq!(dispatcher.submit(task).unwrap(), 2);
    }
    let explicit = Task::new(TestSession::new(99), |_ctx| Ok(())).on_shard(0);
    assert_eq!(dispatcher.submit(explicit).unwrap(), 0);
    dispatcher.wait_for_completion();

    assert_eq!(*lanes_seen.lock().unwrap(), vec![2; 10]);
    let stats = dispatcher.stats();
    assert_eq!(stats[2].processed, 10);
    assert_eq!(stats[0].processed, 1);
    assert_eq!(stats[1].submitted, 0);
    dispatcher.stop().unwrap();
}

#[test]
fn test_fifo_within_shard() {
    let dispatcher = started(config(3));
    let order = Arc::new(Mutex::new(Vec::new()));

    for n in 0..200u64 {
        let order = Arc::clone(&order);
        let task = Task::new(TestSession::new(n), move |_ctx| {
            order.lock().unwrap().push(n);
            Ok(())
        })
        .on_shard(1);
        dispatcher.submit(task).unwrap();
    }
    dispatcher.wait_for_completion();

    let order = order.lock().unwrap();
    assert_eq!(*order, (0..200).collect::<Vec<_>>());
    dispatcher.stop().unwrap();
}

#[test]
fn test_channel_hash_keeps_session_order() {
    let dispatcher = started(config(4));
    let order = Arc::new(Mutex::new(Vec::new()));
    let session = TestSession::new(77);

    let mut shards = Vec::new();
    for n in 0..100u64 {
        let order = Arc::clone(&order);
        let task = Task::new(session.clone(), move |_ctx| {
            order.lock().unwrap().push(n);
            Ok(())
        });
        shards.push(dispatcher.submit(task).unwrap());
    }
    dispatcher.wait_for_completion();

    shards.dedup();
    assert_eq!(shards.len(), 1);
    assert_eq!(*order.lock().unwrap(), (0..100).collect::<Vec<_>>());
    dispatcher.stop().unwrap();
}

fn per_lane_counters(policy: AssignmentPolicy) {
    let mut cfg = config(4);
    cfg.lanes.assignment = policy;
    let dispatcher = started(cfg);
    let counters: Arc<Vec<AtomicU64>> = Arc::new((0..4).map(|_| AtomicU64::new(0)).collect());
    let mut expected = [0u64; 4];

    for n in 0..100u64 {
        let counters = Arc::clone(&counters);
        let task = Task::new(TestSession::new(n), move |ctx| {
            counters[ctx.lane()].fetch_add(1, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(1));
            Ok(())
        });
        let shard = dispatcher.submit(task).unwrap();
        expected[shard] += 1;
    }
    dispatcher.wait_for_completion();

    let actual: Vec<u64> = counters.iter().map(|c| c.load(Ordering::SeqCst)).collect();
    assert_eq!(actual, expected.to_vec());
    assert_eq!(actual.iter().sum::<u64>(), 100);

    let report = dispatcher.stop().unwrap();
    assert_eq!(report.processed(), 100);
    assert_eq!(report.abandoned, 0);
    for (lane, snapshot) in report.lanes.iter().enumerate() {
        assert_eq!(snapshot.submitted, expected[lane]);
    }
}

#[test]
fn test_per_lane_counters_channel_hash() {
    per_lane_counters(AssignmentPolicy::ChannelHash);
}

#[test]
fn test_per_lane_counters_random() {
    per_lane_counters(AssignmentPolicy::Random);
}

#[test]
fn test_failure_closes_session_and_lane_resumes_after_pause() {
    let dispatcher = started(config(2));
    let poisoned = TestSession::new(1);
    let healthy = TestSession::new(2);
    let failed_at = Arc::new(Mutex::new(None));
    let resumed_at = Arc::new(Mutex::new(None));

    let failed_ref = Arc::clone(&failed_at);
    dispatcher
        .submit(
            Task::new(poisoned.clone(), move |_ctx| {
                *failed_ref.lock().unwrap() = Some(Instant::now());
                Err(anyhow!("malformed frame"))
            })
            .on_shard(0),
        )
        .unwrap();
    let resumed_ref = Arc::clone(&resumed_at);
    dispatcher
        .submit(
            Task::new(healthy.clone(), move |_ctx| {
                *resumed_ref.lock().unwrap() = Some(Instant::now());
                Ok(())
            })
            .on_shard(0),
        )
        .unwrap();
    dispatcher.wait_for_completion();

    let failed_at = failed_at.lock().unwrap().unwrap();
    let resumed_at = resumed_at.lock().unwrap().unwrap();
    let gap = resumed_at - failed_at;
    assert!(gap >= Duration::from_millis(90), "gap {:?}", gap);
    assert!(gap < Duration::from_secs(1), "gap {:?}", gap);

    assert_eq!(poisoned.closes.load(Ordering::SeqCst), 1);
    assert_eq!(healthy.closes.load(Ordering::SeqCst), 0);

    let report = dispatcher.stop().unwrap();
    assert_eq!(report.lanes[0].failed, 1);
    assert_eq!(report.lanes[0].processed, 1);
}

#[test]
fn test_panicking_task_does_not_stop_other_lanes() {
    let dispatcher = started(config(2));
    let poisoned = TestSession::new(1);
    let ran = Arc::new(AtomicUsize::new(0));

    dispatcher
        .submit(Task::new(poisoned.clone(), |_ctx| panic!("handler bug")).on_shard(0))
        .unwrap();
    for n in 0..20 {
        let ran = Arc::clone(&ran);
        dispatcher
            .submit(
                Task::new(TestSession::new(100 + n), move |_ctx| {
                    ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_shard(1),
            )
            .unwrap();
    }
    dispatcher.wait_for_completion();

    assert_eq!(ran.load(Ordering::SeqCst), 20);
    assert_eq!(poisoned.closes.load(Ordering::SeqCst), 1);
    let stats = dispatcher.stats();
    assert_eq!(stats[0].failed, 1);
    assert_eq!(stats[1].processed, 20);
    dispatcher.stop().unwrap();
}

#[test]
fn test_lane_survives_panicking_session_close() {
    let dispatcher = started(config(1));
    let poisoned = Arc::new(TestSession {
        id: 1,
        panic_on_close: true,
        ..TestSession::default()
    });
    let ran = Arc::new(AtomicUsize::new(0));

    dispatcher
        .submit(Task::new(poisoned.clone(), |_ctx| Err(anyhow!("bad handshake"))))
        .unwrap();
    for n in 0..5 {
        let ran = Arc::clone(&ran);
        dispatcher
            .submit(Task::new(TestSession::new(10 + n), move |_ctx| {
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
    }
    dispatcher.wait_for_completion();

    assert_eq!(poisoned.closes.load(Ordering::SeqCst), 1);
    assert_eq!(ran.load(Ordering::SeqCst), 5);
    let stats = dispatcher.stats();
    assert_eq!(stats[0].failed, 1);
    assert_eq!(stats[0].processed, 5);
    dispatcher.stop().unwrap();
}

#[test]
fn test_failed_task_holding_buffer_keeps_pool_accounting() {
    let mut cfg = config(1);
    cfg.buffer_pool.core_size = 1;
    cfg.buffer_pool.max_size = 2;
    let dispatcher = started(cfg);

    for n in 0..3u64 {
        dispatcher
            .submit(Task::new(TestSession::new(n), |ctx| {
                let mut buf = ctx.borrow_buffer()?;
                buf.extend_from_slice(b"half a frame")?;
                Err(anyhow!("connection reset"))
            }))
            .unwrap();
    }
    dispatcher
        .submit(Task::new(TestSession::new(7), |ctx| {
            let _buf = ctx.borrow_buffer()?;
            panic!("decoder bug");
        }))
        .unwrap();
    dispatcher.wait_for_completion();

    let stats = dispatcher.pool_stats().unwrap();
    assert_eq!(stats.lent, 0);
    assert!(dispatcher.borrow_buffer().is_ok());
    let a = dispatcher.borrow_buffer().unwrap();
    let b = dispatcher.borrow_buffer().unwrap();
    assert_eq!(
        dispatcher.borrow_buffer().unwrap_err(),
        PoolError::Exhausted { max: 2 }
    );
    drop((a, b));

    let report = dispatcher.stop().unwrap();
    assert_eq!(report.failed(), 4);
}

#[test]
fn test_idle_surplus_is_reclaimed_without_traffic() {
    let mut cfg = config(1);
    cfg.buffer_pool.core_size = 1;
    cfg.buffer_pool.keep_alive_ms = 20;
    let dispatcher = started(cfg);

    let burst: Vec<Buffer> = (0..5).map(|_| dispatcher.borrow_buffer().unwrap()).collect();
    for buffer in burst {
        dispatcher.release_buffer(buffer);
    }
    assert_eq!(dispatcher.pool_stats().unwrap().created, 5);

    thread::sleep(Duration::from_millis(300));
    let stats = dispatcher.pool_stats().unwrap();
    assert_eq!(stats.idle, 1);
    assert_eq!(stats.reclaimed, 4);
    assert_eq!(stats.lent, 0);
    dispatcher.stop().unwrap();
}

thread_local! {
    static EXIT_FLAG: RefCell<Option<ExitGuard>> = RefCell::new(None);
}

/// Flips its flag when the owning thread exits.
struct ExitGuard(Arc<AtomicBool>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_stop_waits_for_in_flight_task_and_joins_lanes() {
    let dispatcher = started(config(2));
    let started_flag = Arc::new(AtomicBool::new(false));
    let finished_flag = Arc::new(AtomicBool::new(false));
    let lane_exited = Arc::new(AtomicBool::new(false));
    let queued_ran = Arc::new(AtomicUsize::new(0));

    let (s, f, e) = (
        Arc::clone(&started_flag),
        Arc::clone(&finished_flag),
        Arc::clone(&lane_exited),
    );
    dispatcher
        .submit(
            Task::new(TestSession::new(1), move |_ctx| {
                EXIT_FLAG.with(|slot| *slot.borrow_mut() = Some(ExitGuard(e)));
                s.store(true, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
                f.store(true, Ordering::SeqCst);
                Ok(())
            })
            .on_shard(0),
        )
        .unwrap();
    for n in 0..3 {
        let queued_ran = Arc::clone(&queued_ran);
        dispatcher
            .submit(
                Task::new(TestSession::new(10 + n), move |_ctx| {
                    queued_ran.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .on_shard(0),
            )
            .unwrap();
    }

    while !started_flag.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(1));
    }
    assert!(!lane_exited.load(Ordering::SeqCst));

    let report = dispatcher.stop().unwrap();
    assert!(finished_flag.load(Ordering::SeqCst));
    assert!(lane_exited.load(Ordering::SeqCst));
    assert!(!dispatcher.is_running());

    // Default policy abandons what was still queued.
    assert_eq!(queued_ran.load(Ordering::SeqCst), 0);
    assert_eq!(report.abandoned, 3);
    assert_eq!(report.lanes[0].abandoned, 3);
    assert_eq!(report.lanes[0].processed, 1);
}

#[test]
fn test_drain_policy_runs_queued_tasks() {
    let mut cfg = config(2);
    cfg.lanes.shutdown = ShutdownPolicy::Drain;
    let dispatcher = started(cfg);
    let ran = Arc::new(AtomicUsize::new(0));

    for n in 0..50u64 {
        let ran = Arc::clone(&ran);
        dispatcher
            .submit(Task::new(TestSession::new(n), move |_ctx| {
                thread::sleep(Duration::from_millis(1));
                ran.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }))
            .unwrap();
    }
    let report = dispatcher.stop().unwrap();

    assert_eq!(ran.load(Ordering::SeqCst), 50);
    assert_eq!(report.processed(), 50);
    assert_eq!(report.abandoned, 0);
}

#[test]
fn test_submit_lifecycle_errors() {
    let dispatcher = Dispatcher::new(config(2), AdaptorRegistry::new());
    let task = || Task::new(TestSession::new(1), |_ctx| Ok(()));

    assert_eq!(dispatcher.submit(task()), Err(DispatchError::NotStarted));
    assert!(matches!(dispatcher.stop(), Err(DispatchError::NotStarted)));

    dispatcher.start().unwrap();
    assert!(matches!(dispatcher.start(), Err(StartError::AlreadyStarted)));
    assert_eq!(
        dispatcher.submit(task().on_shard(2)),
        Err(DispatchError::ShardOutOfRange { index: 2, lanes: 2 })
    );

    dispatcher.stop().unwrap();
    assert_eq!(dispatcher.submit(task()), Err(DispatchError::Closed));
    assert!(matches!(dispatcher.stop(), Err(DispatchError::Closed)));
    assert!(matches!(dispatcher.start(), Err(StartError::AlreadyStarted)));
}

#[test]
fn test_concurrent_submitters() {
    let dispatcher = Arc::new(started(config(4)));
    let ran = Arc::new(AtomicUsize::new(0));

    let submitters: Vec<_> = (0..4u64)
        .map(|t| {
            let dispatcher = Arc::clone(&dispatcher);
            let ran = Arc::clone(&ran);
            thread::spawn(move || {
                for n in 0..250u64 {
                    let ran = Arc::clone(&ran);
                    dispatcher
                        .submit(Task::new(TestSession::new(t * 1000 + n), move |_ctx| {
                            ran.fetch_add(1, Ordering::SeqCst);
                            Ok(())
                        }))
                        .unwrap();
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }
    dispatcher.wait_for_completion();

    assert_eq!(ran.load(Ordering::SeqCst), 1000);
    dispatcher.stop().unwrap();
}

#[test]
fn test_buffers_through_dispatcher() {
    let dispatcher = started(config(2));
    assert_eq!(dispatcher.pool_stats().unwrap().created, 8);

    let borrowed: Vec<Buffer> = (0..8).map(|_| dispatcher.borrow_buffer().unwrap()).collect();
    assert_eq!(dispatcher.pool_stats().unwrap().created, 8);
    let extra = dispatcher.borrow_buffer().unwrap();
    assert_eq!(dispatcher.pool_stats().unwrap().created, 9);
    assert_eq!(extra.capacity(), 256);

    for buffer in borrowed {
        dispatcher.release_buffer(buffer);
    }
    dispatcher.release_buffer(extra);
    assert_eq!(dispatcher.pool_stats().unwrap().lent, 0);

    let lent = Arc::new(AtomicUsize::new(usize::MAX));
    let lent_ref = Arc::clone(&lent);
    dispatcher
        .submit(Task::new(TestSession::new(5), move |ctx| {
            let mut buf = ctx.borrow_buffer()?;
            buf.extend_from_slice(b"payload")?;
            lent_ref.store(ctx.pool().stats().lent, Ordering::SeqCst);
            ctx.release_buffer(buf);
            Ok(())
        }))
        .unwrap();
    dispatcher.wait_for_completion();
    assert_eq!(lent.load(Ordering::SeqCst), 1);

    dispatcher.stop().unwrap();
    assert_eq!(dispatcher.borrow_buffer().unwrap_err(), PoolError::Closed);
}

struct CountingAdaptor {
    reads: AtomicUsize,
    closes: AtomicUsize,
}

impl ChannelAdaptor for CountingAdaptor {
    fn name(&self) -> &str {
        "counting"
    }

    fn on_read(&self, _session: &dyn ChannelSession, input: &Buffer) -> Result<()> {
        if input.data() == b"bad" {
            return Err(anyhow!("undecodable input"));
        }
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn on_close(&self, _session: &dyn ChannelSession) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_adaptor_is_built_once_and_shared() {
    let adaptor = Arc::new(CountingAdaptor {
        reads: AtomicUsize::new(0),
        closes: AtomicUsize::new(0),
    });
    let builds = Arc::new(AtomicUsize::new(0));

    let mut registry = AdaptorRegistry::new();
    let (adaptor_ref, builds_ref) = (Arc::clone(&adaptor), Arc::clone(&builds));
    registry.register("counting", move |_cfg| {
        builds_ref.fetch_add(1, Ordering::SeqCst);
        Ok(adaptor_ref.clone() as Arc<dyn ChannelAdaptor>)
    });

    let mut cfg = config(3);
    cfg.adaptor = "counting".to_string();
    let dispatcher = Dispatcher::new(cfg, registry);
    dispatcher.start().unwrap();

    for n in 0..30u64 {
        let payload: &'static [u8] = if n == 0 { b"bad" } else { b"ok" };
        let session = TestSession::new(n);
        let session_ref = Arc::clone(&session);
        dispatcher
            .submit(Task::new(session, move |ctx| {
                let mut buf = ctx.borrow_buffer()?;
                buf.extend_from_slice(payload)?;
                let result = ctx.adaptor().on_read(session_ref.as_ref(), &buf);
                ctx.release_buffer(buf);
                result
            }))
            .unwrap();
    }
    dispatcher.wait_for_completion();

    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert_eq!(adaptor.reads.load(Ordering::SeqCst), 29);
    assert_eq!(adaptor.closes.load(Ordering::SeqCst), 1);
    assert_eq!(dispatcher.adaptor().unwrap().name(), "counting");
    dispatcher.stop().unwrap();
}

#[test]
fn test_adaptor_failures_abort_start() {
    let mut cfg = config(2);
    cfg.adaptor = "missing".to_string();
    let dispatcher = Dispatcher::new(cfg, AdaptorRegistry::new());
    assert!(matches!(
        dispatcher.start(),
        Err(StartError::UnknownAdaptor(name)) if name == "missing"
    ));
    assert!(!dispatcher.is_running());
    assert_eq!(
        dispatcher.submit(Task::new(TestSession::new(1), |_ctx| Ok(()))),
        Err(DispatchError::NotStarted)
    );

    let mut registry = AdaptorRegistry::new();
    registry.register("broken", |_cfg| Err(anyhow!("bad key file")));
    let mut cfg = config(2);
    cfg.adaptor = "broken".to_string();
    let dispatcher = Dispatcher::new(cfg, registry);
    assert!(matches!(dispatcher.start(), Err(StartError::Adaptor { .. })));
    assert!(dispatcher.stats().is_empty());
}

#[test]
fn test_invalid_config_aborts_start() {
    let mut cfg = config(2);
    cfg.lanes.count = 0;
    let dispatcher = Dispatcher::new(cfg, AdaptorRegistry::new());
    assert!(matches!(dispatcher.start(), Err(StartError::InvalidConfig(_))));
}

#[test]
fn test_drop_stops_running_dispatcher() {
    let lane_exited = Arc::new(AtomicBool::new(false));
    {
        let dispatcher = started(config(1));
        let e = Arc::clone(&lane_exited);
        dispatcher
            .submit(Task::new(TestSession::new(1), move |_ctx| {
                EXIT_FLAG.with(|slot| *slot.borrow_mut() = Some(ExitGuard(e)));
                Ok(())
            }))
            .unwrap();
        dispatcher.wait_for_completion();
    }
    assert!(lane_exited.load(Ordering::SeqCst));
}
