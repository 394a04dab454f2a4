use lanes_core::adaptor::{AdaptorRegistry, ChannelAdaptor};
use lanes_core::config::{default_config, load_config};
use lanes_core::{Buffer, ChannelSession, Dispatcher, SessionId, Task};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};
use clap::Parser;

#[derive(Parser, Debug)]
struct Args {
    #[clap(short, long, parse(from_os_str), value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of tasks to submit.
    #[clap(short, long, default_value = "10000")]
    tasks: u64,

    /// Number of distinct sessions the tasks are spread over.
    #[clap(short, long, default_value = "64")]
    sessions: u64,

    /// Make every n-th task fail. 0 disables failures.
    #[clap(short, long, default_value = "0")]
    fail_every: u64,
}

/// Counts bytes and rejects payloads starting with `!`.
#[derive(Default)]
struct EchoAdaptor {
    bytes: AtomicU64,
}

impl ChannelAdaptor for EchoAdaptor {
    fn name(&self) -> &str {
        "echo"
    }

    fn on_read(&self, session: &dyn ChannelSession, input: &Buffer) -> Result<()> {
        if input.data().first() == Some(&b'!') {
            bail!("session {} sent a poisoned frame", session.id());
        }
        self.bytes
            .fetch_add(input.data_len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

struct Session {
    id: SessionId,
    closed: AtomicBool,
}

impl ChannelSession for Session {
    fn id(&self) -> SessionId {
        self.id
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            log::debug!("Session {} already closed", self.id);
        }
        Ok(())
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => load_config(path)?,
        None => default_config(),
    };

    let mut registry = AdaptorRegistry::new();
    registry.register("echo", |_cfg| Ok(Arc::new(EchoAdaptor::default())));

    let dispatcher = Dispatcher::new(config, registry);
    dispatcher.start()?;

    let sessions: Vec<Arc<Session>> = (0..args.sessions.max(1))
        .map(|id| {
            Arc::new(Session {
                id: SessionId(id),
                closed: AtomicBool::new(false),
            })
        })
        .collect();

    let start = Instant::now();
    for n in 0..args.tasks {
        let session = Arc::clone(&sessions[(n % sessions.len() as u64) as usize]);
        let poisoned = args.fail_every > 0 && n % args.fail_every == args.fail_every - 1;
        let task = Task::new(session.clone(), move |ctx| {
            let mut buf = ctx.borrow_buffer()?;
            let payload: &[u8] = if poisoned { b"!bad" } else { b"frame" };
            buf.extend_from_slice(payload)?;
            let result = ctx.adaptor().on_read(session.as_ref(), &buf);
            ctx.release_buffer(buf);
            result
        });
        dispatcher.submit(task)?;
    }
    dispatcher.wait_for_completion();
    let elapsed = start.elapsed();

    let report = dispatcher.stop()?;
    for (lane, stats) in report.lanes.iter().enumerate() {
        println!("lane {}: {}", lane, stats);
    }
    println!(
        "{} tasks in {:?}: {} processed, {} failed, {} abandoned",
        args.tasks,
        elapsed,
        report.processed(),
        report.failed(),
        report.abandoned
    );
    println!(
        "buffers: {} created, {} reclaimed",
        report.pool.created, report.pool.reclaimed
    );
    Ok(())
}
