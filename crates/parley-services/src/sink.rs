//! Display sink — where accepted inbound chat lines are shown.
//!
//! Called synchronously from the connection task that accepted the message,
//! so implementations must return quickly.

pub trait DisplaySink: Send + Sync {
    fn display(&self, line: &str);
}

impl<F> DisplaySink for F
where
    F: Fn(&str) + Send + Sync,
{
    fn display(&self, line: &str) {
        self(line)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DisplaySink for NullSink {
    fn display(&self, _line: &str) {}
}
