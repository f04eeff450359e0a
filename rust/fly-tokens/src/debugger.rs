/// A sink for diagnostic text produced while discharging third party caveats.
/// Command line tools typically forward this to their own verbose output.
pub trait Debugger: Send + Sync {
    fn debug(&self, message: &str);
}

/// A [Debugger] that discards everything
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopDebugger;

impl Debugger for NoopDebugger {
    fn debug(&self, _message: &str) {}
}

/// A [Debugger] that emits every message as a `tracing` debug event
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingDebugger;

impl Debugger for TracingDebugger {
    fn debug(&self, message: &str) {
        debug!("{}", message);
    }
}
