// SPDX-License-Identifier: MIT
// Copyright (c) 2023 Nick Van Dyck
// Copyright (C) 2024 Akira Moroo

//! A serial Grand Central Dispatch queue. A `VZVirtualMachine` may only be
//! touched on the queue it was created with. Share it through an `Arc`.

use std::{
    ffi::CString,
    os::raw::{c_char, c_void},
};

use objc2::{Encode, Encoding, RefEncode};

#[allow(non_camel_case_types)]
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct dispatch_object_s {
    _private: [u8; 0],
}

unsafe impl Encode for dispatch_object_s {
    const ENCODING: Encoding = Encoding::Object;
}

unsafe impl RefEncode for dispatch_object_s {
    const ENCODING_REF: Encoding = Encoding::Object;
}

#[allow(non_camel_case_types)]
pub type dispatch_function_t = extern "C" fn(*mut c_void);
#[allow(non_camel_case_types)]
pub type dispatch_object_t = *mut dispatch_object_s;
#[allow(non_camel_case_types)]
pub type dispatch_queue_t = *mut dispatch_object_s;
#[allow(non_camel_case_types)]
pub type dispatch_queue_attr_t = *const dispatch_object_s;

const DISPATCH_QUEUE_SERIAL: dispatch_queue_attr_t = std::ptr::null();

extern "C" {
    fn dispatch_queue_create(label: *const c_char, attr: dispatch_queue_attr_t)
        -> dispatch_queue_t;
    fn dispatch_async_f(queue: dispatch_queue_t, context: *mut c_void, work: dispatch_function_t);
    fn dispatch_sync_f(queue: dispatch_queue_t, context: *mut c_void, work: dispatch_function_t);
    fn dispatch_release(object: dispatch_object_t);
}

/// Entry point for work handed over with `Box::into_raw`.
extern "C" fn run_owned<F: FnOnce()>(context: *mut c_void) {
    // SAFETY: `exec_async` passes a leaked `Box<F>` and GCD calls this once.
    let work = unsafe { Box::from_raw(context.cast::<F>()) };
    work();
}

/// Entry point for work that stays on the caller's stack.
extern "C" fn run_borrowed<F: FnOnce()>(context: *mut c_void) {
    // SAFETY: `exec_sync` passes its own `Option<F>` and blocks until this returns.
    let slot = unsafe { &mut *context.cast::<Option<F>>() };
    if let Some(work) = slot.take() {
        work();
    }
}

#[derive(Debug)]
pub struct Queue {
    pub ptr: dispatch_queue_t,
}

impl Queue {
    pub fn serial(label: &str) -> Self {
        // Labels are compile-time constants in this crate, none contain NUL.
        let label = CString::new(label).unwrap_or_default();
        let ptr = unsafe { dispatch_queue_create(label.as_ptr(), DISPATCH_QUEUE_SERIAL) };
        Queue { ptr }
    }

    /// Runs `work` on the queue and waits for its result.
    pub fn exec_sync<T, F>(&self, work: F) -> T
    where
        F: Send + FnOnce() -> T,
        T: Send,
    {
        let mut result = None;
        {
            let result = &mut result;
            let mut slot = Some(move || *result = Some(work()));
            unsafe {
                dispatch_sync_f(
                    self.ptr,
                    (&mut slot as *mut Option<_>).cast(),
                    run_borrowed_for(&slot),
                );
            }
        }
        match result {
            Some(result) => result,
            None => unreachable!("dispatch_sync_f returned without running the block"),
        }
    }

    /// Queues `work` and returns immediately.
    pub fn exec_async<F>(&self, work: F)
    where
        F: 'static + Send + FnOnce(),
    {
        let context = Box::into_raw(Box::new(work)).cast::<c_void>();
        unsafe {
            dispatch_async_f(self.ptr, context, run_owned::<F>);
        }
    }
}

/// Picks the `run_borrowed` instance matching a closure type that cannot be
/// named.
fn run_borrowed_for<F: FnOnce()>(_slot: &Option<F>) -> dispatch_function_t {
    run_borrowed::<F>
}

// SAFETY: GCD queues are thread-safe reference-counted objects.
unsafe impl Sync for Queue {}
unsafe impl Send for Queue {}

impl Drop for Queue {
    fn drop(&mut self) {
        unsafe { dispatch_release(self.ptr) };
    }
}
