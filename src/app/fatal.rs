static ROOT_CANCEL: OnceLock<CancellationToken> = OnceLock::new();

const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

// Must be called as soon as the root token is created.
fn install_root_cancel(cancel: CancellationToken) {
    let _ = ROOT_CANCEL.set(cancel);
}

// A fatal assertion: cancel every worker, leave them the grace period to
// abort in-flight requests, then exit with a failure code. The crawler never
// exits 0 in normal operation.
fn fatal(msg: &str) -> ! {
    error!("FATAL: {msg}");
    if let Some(cancel) = ROOT_CANCEL.get() {
        cancel.cancel();
    }
    std::thread::sleep(SHUTDOWN_GRACE);
    std::process::exit(1);
}

fn unwrap_or_fatal<T, E: std::fmt::Display>(result: Result<T, E>, msg: &str) -> T {
    match result {
        Ok(value) => value,
        Err(err) => fatal(&format!("{msg}: {err}")),
    }
}
