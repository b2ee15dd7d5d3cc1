//! Per-test log capture.
//!
//! Every test gets its own `tracing` dispatcher and its own Tokio runtime whose threads all log
//! through that dispatcher, so the log output printed for a test contains only its own events.
use crate::Result;
use std::{
    cell::RefCell,
    future::Future,
    io::Write,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex},
    time::Duration,
};
use tracing_subscriber::fmt::MakeWriter;

/// Filter used when `RUST_LOG` isn't set.  The HTTP and SDK crates are far too chatty at debug.
const DEFAULT_FILTER: &str = "h2=warn,hyper=info,reqwest=info,rustls=info,aws=info,debug";

/// Collects formatted log output in memory until the test is done
#[derive(Clone, Default)]
struct CapturedLog {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedLog {
    /// Take everything logged so far.  Invalid UTF-8 is replaced rather than panicking, since a
    /// panic here would hide the test's own failure.
    fn drain(&self) -> String {
        let buffer = std::mem::take(&mut *self.buffer.lock().unwrap());

        String::from_utf8_lossy(&buffer).into_owned()
    }
}

impl<'a> Write for &'a CapturedLog {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for CapturedLog {
    type Writer = &'a Self;

    fn make_writer(&'a self) -> Self::Writer {
        self
    }
}

fn make_dispatch(log: CapturedLog) -> tracing::Dispatch {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::{fmt, EnvFilter};

    let format = fmt::layer()
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(false)
        .with_writer(log);

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(DEFAULT_FILTER))
        .unwrap();

    tracing::Dispatch::new(tracing_subscriber::registry().with(filter).with(format))
}

/// Run an async test on a multi-threaded runtime with logging captured for this test only.
///
/// This takes the place of `tokio::test`.  The captured log is printed once the test finishes,
/// including when it panics.
pub fn test_with_logging(test: impl Future<Output = Result<()>>) -> Result<()> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();

    run_with_logging(builder, test)
}

/// Like [`test_with_logging`], but on a single-threaded runtime whose clock starts out paused.
///
/// The clock advances automatically whenever every task is waiting on a timer, so tests of
/// timer-driven behavior finish instantly and deterministically.
pub fn test_with_paused_time(test: impl Future<Output = Result<()>>) -> Result<()> {
    let mut builder = tokio::runtime::Builder::new_current_thread();
    builder.enable_all().start_paused(true);

    run_with_logging(builder, test)
}

fn run_with_logging(
    mut builder: tokio::runtime::Builder,
    test: impl Future<Output = Result<()>>,
) -> Result<()> {
    let log = CapturedLog::default();
    let dispatch = Arc::new(make_dispatch(log.clone()));

    tracing::dispatcher::with_default(&dispatch, || {
        std::thread_local! {
            static THREAD_DISPATCHER_GUARD: RefCell<Option<tracing::subscriber::DefaultGuard>> = RefCell::new(None);
        }

        // Worker threads don't inherit this thread's default dispatcher, so install it on each
        {
            let dispatch = dispatch.clone();
            builder.on_thread_start(move || {
                let guard = tracing::dispatcher::set_default(&dispatch);
                THREAD_DISPATCHER_GUARD.with(|cell| cell.replace(Some(guard)));
            });
        }
        builder.on_thread_stop(|| {
            THREAD_DISPATCHER_GUARD.with(|cell| cell.replace(None));
        });

        let runtime = builder.build()?;

        let result = std::panic::catch_unwind(AssertUnwindSafe(move || {
            let result = runtime.block_on(test);
            runtime.shutdown_timeout(Duration::from_secs(10));

            result
        }));

        println!("Log events from this test: \n{}", log.drain());

        match result {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    })
}
