use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks `mutex`, recovering the guard if a panicking thread poisoned it.
///
/// Task panics are caught before they unwind through any engine lock.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut acc = String::with_capacity(bytes.len() * 2);

    for byte in bytes {
        // Writing into a `String` cannot fail.
        let _ = write!(&mut acc, "{byte:02x}");
    }

    acc
}

/// Installs a global `tracing` subscriber that prints to stderr.
///
/// The filter is read from `RUST_LOG` and defaults to `info` for this crate.
/// Calling this more than once is harmless, later calls keep the subscriber
/// that was installed first.
#[cfg(feature = "logging")]
pub fn init_logging() -> anyhow::Result<()> {
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nagare=info"));

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false).with_thread_names(true))
        .try_init();

    if let Err(err) = result {
        tracing::debug!("logging already initialized: {err}");
    }

    Ok(())
}
