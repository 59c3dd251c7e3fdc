use crate::handle::TaskHandle;

/// Error type handlers may return; any `std::error::Error` converts via `?`.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerResult = Result<(), HandlerError>;

/// Business logic for one subscription.
///
/// Handlers are ordinary blocking functions. A well-behaved handler calls
/// exactly one terminal method on the [`TaskHandle`] before returning.
/// Returning `Err` (or panicking) without having reported makes the
/// poller report a technical failure on the handler's behalf.
pub trait TaskHandler: Send + Sync + 'static {
    fn handle(&self, task: &TaskHandle) -> HandlerResult;
}

impl<F> TaskHandler for F
where
    F: Fn(&TaskHandle) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, task: &TaskHandle) -> HandlerResult {
        self(task)
    }
}
