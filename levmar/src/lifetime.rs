//! Install/release discipline for the active callback binding.
//!
//! The trampolines are plain functions, so only the binding needs a stable
//! address. It is boxed on install, published in a thread-local slot for the
//! duration of the native call, and reclaimed exactly once on release or drop.

use std::cell::Cell;
use std::marker::PhantomData;
use std::ptr::NonNull;

use crate::binding::{BindingOutcome, CallbackBinding};
use crate::error::{LevmarError, LevmarResult};

#[derive(Clone, Copy, Default)]
enum Slot {
    #[default]
    Empty,
    Ready(NonNull<CallbackBinding<'static>>),
    /// A trampoline currently holds the binding.
    Busy,
}

thread_local! {
    static ACTIVE: Cell<Slot> = const { Cell::new(Slot::Empty) };
}

/// True while a binding is installed on this thread.
pub(crate) fn is_active() -> bool {
    !matches!(ACTIVE.with(Cell::get), Slot::Empty)
}

/// Publishes `binding` for the trampolines of this thread.
pub(crate) fn install(binding: CallbackBinding<'_>) -> LevmarResult<InstalledBinding<'_>> {
    if is_active() {
        return Err(LevmarError::ReentrancyNotSupported);
    }

    let binding = NonNull::from(Box::leak(Box::new(binding)));
    ACTIVE.with(|slot| slot.set(Slot::Ready(binding.cast())));

    Ok(InstalledBinding {
        binding: Some(binding),
        _marker: PhantomData,
    })
}

/// Runs `f` against the installed binding.
///
/// Returns `None` when nothing is installed, or when the binding is already in
/// use further up this thread's stack.
pub(crate) fn with_active_binding<R>(f: impl FnOnce(&mut CallbackBinding<'_>) -> R) -> Option<R> {
    let Slot::Ready(ptr) = ACTIVE.with(Cell::get) else {
        return None;
    };

    ACTIVE.with(|slot| slot.set(Slot::Busy));
    let _restore = RestoreSlot(ptr);

    // SAFETY: the pointer came from `install` and stays valid until the
    // `InstalledBinding` clears the slot; `Busy` rules out a second `&mut`.
    let binding = unsafe { &mut *ptr.as_ptr().cast::<CallbackBinding<'_>>() };
    Some(f(binding))
}

struct RestoreSlot(NonNull<CallbackBinding<'static>>);

impl Drop for RestoreSlot {
    fn drop(&mut self) {
        ACTIVE.with(|slot| slot.set(Slot::Ready(self.0)));
    }
}

/// Scoped ownership of an installed binding.
#[must_use = "dropping the guard releases the binding"]
pub(crate) struct InstalledBinding<'a> {
    binding: Option<NonNull<CallbackBinding<'a>>>,
    _marker: PhantomData<CallbackBinding<'a>>,
}

impl<'a> InstalledBinding<'a> {
    /// Unpublishes and frees the binding, returning what it recorded.
    pub(crate) fn release(mut self) -> BindingOutcome {
        self.take()
            .expect("installed binding is released exactly once")
            .into_outcome()
    }

    fn take(&mut self) -> Option<CallbackBinding<'a>> {
        let binding = self.binding.take()?;
        ACTIVE.with(|slot| slot.set(Slot::Empty));
        // SAFETY: produced by `Box::leak` in `install` and unpublished above.
        Some(*unsafe { Box::from_raw(binding.as_ptr()) })
    }
}

impl Drop for InstalledBinding<'_> {
    fn drop(&mut self) {
        drop(self.take());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binding::{CallbackKind, Dims};
    use crate::context::ContextHandle;
    use crate::marshal::MarshalBuffers;
    use std::ffi::c_int;
    use std::ptr::null_mut;

    fn invoke_residual(p: &mut [f64], out: &mut [f64]) -> Option<()> {
        with_active_binding(|binding| unsafe {
            binding.invoke(
                CallbackKind::Residual,
                p.as_mut_ptr(),
                out.as_mut_ptr(),
                p.len() as c_int,
                out.len() as c_int,
                null_mut(),
            )
        })
    }

    #[test]
    fn binding_is_reachable_only_while_installed() {
        let mut calls = 0;
        let mut residual = |p: &[f64], hx: &mut [f64], _m: usize, _n: usize, _ctx: Option<ContextHandle>| {
            calls += 1;
            hx.copy_from_slice(p);
        };
        let mut buffers = MarshalBuffers::default();
        let mut p = [1.0, 2.0];
        let mut out = [0.0; 2];

        assert!(invoke_residual(&mut p, &mut out).is_none());

        let binding = CallbackBinding::new(Dims { m: 2, n: 2 }, &mut residual, None, &mut buffers);
        let installed = install(binding).unwrap();
        assert!(is_active());
        assert!(invoke_residual(&mut p, &mut out).is_some());
        let outcome = installed.release();

        assert!(!is_active());
        assert!(invoke_residual(&mut p, &mut out).is_none());
        assert_eq!(outcome.residual_calls, 1);
        assert_eq!(out, [1.0, 2.0]);
        assert_eq!(calls, 1);
    }

    #[test]
    fn second_install_is_rejected() {
        let mut first = |_: &[f64], _: &mut [f64], _: usize, _: usize, _: Option<ContextHandle>| {};
        let mut second = |_: &[f64], _: &mut [f64], _: usize, _: usize, _: Option<ContextHandle>| {};
        let mut first_buffers = MarshalBuffers::default();
        let mut second_buffers = MarshalBuffers::default();
        let dims = Dims { m: 1, n: 1 };

        let installed = install(CallbackBinding::new(dims, &mut first, None, &mut first_buffers)).unwrap();
        let err = install(CallbackBinding::new(dims, &mut second, None, &mut second_buffers))
            .err()
            .unwrap();

        assert_eq!(err, LevmarError::ReentrancyNotSupported);
        drop(installed);
        assert!(!is_active(), "dropping the guard releases the slot");
    }

    #[test]
    fn nested_lookup_is_refused() {
        let mut residual = |_: &[f64], _: &mut [f64], _: usize, _: usize, _: Option<ContextHandle>| {};
        let mut buffers = MarshalBuffers::default();
        let _installed = install(CallbackBinding::new(
            Dims { m: 1, n: 1 },
            &mut residual,
            None,
            &mut buffers,
        ))
        .unwrap();

        let nested = with_active_binding(|_| with_active_binding(|_| ()));
        assert_eq!(nested, Some(None));
        assert!(with_active_binding(|_| ()).is_some(), "slot restored after use");
    }
}
