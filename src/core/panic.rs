//! Panic recovery at the request boundary.
//!
//! Handlers run inside [`Recover`], which turns a panic during any poll into a
//! [`PanicReport`] instead of unwinding into the runtime. A process-wide panic
//! hook records the call-stack at the panic site for panics raised inside a
//! recovery scope; panics elsewhere go to the previously installed hook.
use std::{
    any::Any,
    cell::{Cell, RefCell},
    future::Future,
    panic::{self, AssertUnwindSafe},
    path::Path,
    pin::Pin,
    sync::Once,
    task::{Context, Poll},
};

use pin_project_lite::pin_project;

use crate::core::error::{CallStack, Frame, ReportableError, RequestError, shorten_path};

static INSTALL_HOOK: Once = Once::new();

thread_local! {
    static RECOVERY_DEPTH: Cell<usize> = const { Cell::new(0) };
    static CAPTURED: RefCell<Option<CallStack>> = const { RefCell::new(None) };
}

/// Install the capturing panic hook (idempotent).
pub fn install_panic_hook() {
    INSTALL_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if RECOVERY_DEPTH.with(Cell::get) == 0 {
                previous(info);
                return;
            }
            let mut stack = CallStack::from_backtrace(&backtrace::Backtrace::new());
            if let Some(location) = info.location() {
                stack.push_innermost(Frame {
                    file: shorten_path(Path::new(location.file())),
                    line: location.line(),
                    function: None,
                });
            }
            CAPTURED.with(|slot| *slot.borrow_mut() = Some(stack));
        }));
    });
}

/// A panic recovered inside a recovery scope.
#[derive(Debug, Clone)]
pub struct PanicReport {
    pub message: String,
    pub call_stack: CallStack,
}

impl PanicReport {
    fn from_payload(payload: Box<dyn Any + Send>) -> Self {
        let call_stack = CAPTURED
            .with(|slot| slot.borrow_mut().take())
            .unwrap_or_else(CallStack::capture);
        Self {
            message: panic_message(payload.as_ref()),
            call_stack,
        }
    }
}

impl From<PanicReport> for ReportableError {
    fn from(report: PanicReport) -> Self {
        ReportableError::from(RequestError::Panic(report.message)).with_call_stack(report.call_stack)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(err) = payload.downcast_ref::<Box<dyn std::error::Error + Send + Sync>>() {
        err.to_string()
    } else {
        "unknown panic".to_string()
    }
}

/// Marks the current thread as inside a recovery scope while alive.
struct ScopeGuard;

impl ScopeGuard {
    fn enter() -> Self {
        RECOVERY_DEPTH.with(|depth| depth.set(depth.get() + 1));
        ScopeGuard
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        RECOVERY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Run `f`, converting a panic into a [`PanicReport`].
pub fn recover<F, T>(f: F) -> Result<T, PanicReport>
where
    F: FnOnce() -> T,
{
    install_panic_hook();
    let _scope = ScopeGuard::enter();
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(PanicReport::from_payload)
}

pin_project! {
    /// Future adapter that catches panics raised while polling the inner future.
    pub struct Recover<F> {
        #[pin]
        inner: F,
    }
}

impl<F> Recover<F> {
    pub fn new(inner: F) -> Self {
        install_panic_hook();
        Self { inner }
    }
}

impl<F: Future> Future for Recover<F> {
    type Output = Result<F::Output, PanicReport>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let _scope = ScopeGuard::enter();
        match panic::catch_unwind(AssertUnwindSafe(|| this.inner.poll(cx))) {
            Ok(Poll::Pending) => Poll::Pending,
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Err(payload) => Poll::Ready(Err(PanicReport::from_payload(payload))),
        }
    }
}
