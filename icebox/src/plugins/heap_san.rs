//! Heap sanitizer: pads every tracked allocation with guard slack.
//!
//! Each allocation in the target process is grown by [`ADD_SIZE`] bytes and
//! the pointer handed back to the program is shifted by half of it, so both
//! underflows and overflows land in slack the program never legitimately
//! touches. The shift is undone on every API taking the user pointer back.

use std::cell::RefCell;
use std::rc::Rc;

use hashbrown::HashMap;

use ibc::{Channel, IceResult, Process};

use crate::os::OsVm;
use crate::state::Breakpoint;
use crate::tracer::{heaps, Tracer};

const ADD_SIZE: u64 = 0x20;
const HALF_ADD_SIZE: u64 = ADD_SIZE / 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HeapKey {
    heap: u64,
    addr: u64,
    thread: u64,
}

#[derive(Default)]
struct Data {
    /// Shifted allocations we own, with their original requested size.
    allocs: HashMap<HeapKey, u64>,
}

/// The heap sanitizer plugin, bound to one target process.
pub struct HeapSan<C: Channel, O: OsVm<C>> {
    tracer: Tracer<C, O>,
    hooks: Vec<Breakpoint>,
    data: Rc<RefCell<Data>>,
}

impl<C: Channel + 'static, O: OsVm<C>> HeapSan<C, O> {
    pub fn attach(os: Rc<O>, target: Process) -> IceResult<Self> {
        let tracer = Tracer::new(os);
        let data = Rc::new(RefCell::new(Data::default()));
        let mut hooks = Vec::new();

        let tracked = data.clone();
        hooks.push(tracer.hook_function::<heaps::RtlpAllocateHeapInternal>(
            target,
            move |cx, (heap, size)| {
                let (Some(heap), Some(size)) = (heap, size) else {
                    return Ok(());
                };

                cx.set_arg(1, size + ADD_SIZE)?;

                let tracked = tracked.clone();
                cx.hook_return(move |ret| {
                    let alloc = ret.ret_value()?;
                    if alloc != 0 {
                        let shifted = alloc + HALF_ADD_SIZE;
                        ret.set_ret_value(shifted)?;
                        tracked.borrow_mut().allocs.insert(
                            HeapKey {
                                heap,
                                addr: shifted,
                                thread: ret.thread.id,
                            },
                            size,
                        );
                    }
                    Ok(())
                })?;
                Ok(())
            },
        )?);

        let tracked = data.clone();
        hooks.push(tracer.hook_function::<heaps::RtlpReAllocateHeapInternal>(
            target,
            move |cx, (heap, _flags, base, size)| {
                let (Some(heap), Some(base), Some(size)) = (heap, base, size) else {
                    return Ok(());
                };

                let key = HeapKey {
                    heap,
                    addr: base,
                    thread: cx.thread.id,
                };
                if tracked.borrow_mut().allocs.remove(&key).is_some() {
                    cx.set_arg(2, base - HALF_ADD_SIZE)?;
                }
                cx.set_arg(3, size + ADD_SIZE)?;

                let tracked = tracked.clone();
                cx.hook_return(move |ret| {
                    let alloc = ret.ret_value()?;
                    if alloc != 0 {
                        let shifted = alloc + HALF_ADD_SIZE;
                        ret.set_ret_value(shifted)?;
                        tracked.borrow_mut().allocs.insert(
                            HeapKey {
                                heap,
                                addr: shifted,
                                thread: ret.thread.id,
                            },
                            size,
                        );
                    }
                    Ok(())
                })?;
                Ok(())
            },
        )?);

        let tracked = data.clone();
        hooks.push(tracer.hook_function::<heaps::RtlFreeHeap>(
            target,
            move |cx, (heap, _flags, base)| {
                let (Some(heap), Some(base)) = (heap, base) else {
                    return Ok(());
                };

                let key = HeapKey {
                    heap,
                    addr: base,
                    thread: cx.thread.id,
                };
                if tracked.borrow_mut().allocs.remove(&key).is_some() {
                    cx.set_arg(2, base - HALF_ADD_SIZE)?;
                }
                Ok(())
            },
        )?);

        let tracked = data.clone();
        hooks.push(tracer.hook_function::<heaps::RtlSizeHeap>(
            target,
            move |cx, (heap, _flags, base)| {
                let (Some(heap), Some(base)) = (heap, base) else {
                    return Ok(());
                };

                let key = HeapKey {
                    heap,
                    addr: base,
                    thread: cx.thread.id,
                };
                if !tracked.borrow().allocs.contains_key(&key) {
                    return Ok(());
                }

                cx.set_arg(2, base - HALF_ADD_SIZE)?;

                // Hide the slack from the reported size
                cx.hook_return(move |ret| {
                    let size = ret.ret_value()?;
                    if size >= ADD_SIZE {
                        ret.set_ret_value(size - ADD_SIZE)?;
                    }
                    Ok(())
                })?;
                Ok(())
            },
        )?);

        let tracked = data.clone();
        hooks.push(tracer.hook_function::<heaps::RtlSetUserValueHeap>(
            target,
            move |cx, (heap, _flags, base, _value)| {
                let (Some(heap), Some(base)) = (heap, base) else {
                    return Ok(());
                };

                let key = HeapKey {
                    heap,
                    addr: base,
                    thread: cx.thread.id,
                };
                if tracked.borrow().allocs.contains_key(&key) {
                    cx.set_arg(2, base - HALF_ADD_SIZE)?;
                }
                Ok(())
            },
        )?);

        let tracked = data.clone();
        hooks.push(tracer.hook_function::<heaps::RtlGetUserInfoHeap>(
            target,
            move |cx, (heap, _flags, base, _value, _user_flags)| {
                let (Some(heap), Some(base)) = (heap, base) else {
                    return Ok(());
                };

                let key = HeapKey {
                    heap,
                    addr: base,
                    thread: cx.thread.id,
                };
                if tracked.borrow().allocs.contains_key(&key) {
                    cx.set_arg(2, base - HALF_ADD_SIZE)?;
                }
                Ok(())
            },
        )?);

        // Threads may die between an entry hook and its return; reclaim
        // their pending return hooks
        hooks.push(tracer.watch_thread_exits()?);

        Ok(HeapSan {
            tracer,
            hooks,
            data,
        })
    }

    #[inline]
    pub fn tracer(&self) -> &Tracer<C, O> {
        &self.tracer
    }

    /// How many shifted allocations are currently live.
    pub fn tracked_count(&self) -> usize {
        self.data.borrow().allocs.len()
    }

    /// Uninstalls every hook.
    pub fn detach(mut self) {
        self.hooks.clear();
    }
}

impl<C: Channel + 'static, O: OsVm<C>> std::fmt::Debug for HeapSan<C, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("HeapSan")
            .field("hooks", &self.hooks.len())
            .field("tracked", &self.tracked_count())
            .finish()
    }
}
