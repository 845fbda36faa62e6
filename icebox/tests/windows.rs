mod common;

use std::ops::ControlFlow;
use std::rc::Rc;

use ibc::arch::x86_64::Register;
use ibc::{Event, Os, PhysicalAddress, VcpuId};
use icebox::os::OsVm;
use icebox::plugins::HeapSan;
use icebox::state::{BreakpointOpts, RunState};

use common::nt;

#[test]
fn enumerate_processes() {
    let os = nt::build();

    let mut procs = Vec::new();
    os.for_each_process(&mut |proc| {
        procs.push((os.process_id(proc)?, os.process_name(proc)?));
        Ok(ControlFlow::Continue(()))
    })
    .unwrap();

    assert!(procs.contains(&(0, "Idle".into())));
    assert!(procs.contains(&(4, "System".into())));
    assert!(procs.contains(&(0x30, "notepad.exe".into())));

    let system = os.init_process().unwrap();
    assert_eq!(os.process_id(system).unwrap(), 4);

    let notepad = os.find_process_by_name("notepad.exe").unwrap().unwrap();
    assert_eq!(os.process_parent(notepad).unwrap(), system);
    assert!(!os.process_is_kernel(notepad).unwrap());
    assert!(os.process_is_kernel(system).unwrap());
}

#[test]
fn current_thread_and_threads() {
    let os = nt::build();

    let thread = os.current_thread(VcpuId(0)).unwrap();
    assert_eq!(os.thread_id(thread).unwrap(), nt::NOTEPAD_TID);

    let proc = os.current_process(VcpuId(0)).unwrap();
    assert_eq!(os.process_name(proc).unwrap(), "notepad.exe");

    let mut tids = Vec::new();
    os.process_for_each_thread(proc, &mut |thread| {
        tids.push(os.thread_id(thread)?);
        Ok(ControlFlow::Continue(()))
    })
    .unwrap();
    assert_eq!(tids, [nt::NOTEPAD_TID]);
}

#[test]
fn enumerate_modules() {
    let os = nt::build();
    let notepad = os.find_process_by_name("notepad.exe").unwrap().unwrap();

    let mut modules = Vec::new();
    os.process_for_each_module(notepad, &mut |module| {
        let name = os.module_name(module, notepad)?;
        let span = os.module_span(module, notepad)?;
        modules.push((name, span.0 .0, span.1 .0));
        Ok(ControlFlow::Continue(()))
    })
    .unwrap();

    assert_eq!(
        modules,
        [(
            "ntdll.dll".into(),
            nt::NTDLL_BASE,
            nt::NTDLL_BASE + nt::NTDLL_SIZE
        )]
    );
}

#[test]
fn resolve_symbol_in_module() {
    let os = nt::build();
    let notepad = os.find_process_by_name("notepad.exe").unwrap().unwrap();

    let addr = os
        .resolve_symbol(notepad, "ntdll", "RtlpAllocateHeapInternal")
        .unwrap();
    assert_eq!(addr.0, nt::ALLOC_FN);

    // Unknown symbols surface with their name, not a crash
    let err = os.resolve_symbol(notepad, "ntdll", "RtlNotARealFunction");
    assert!(err.is_err());
}

#[test]
fn breakpoint_byte_round_trip() {
    let os = nt::build();
    let vm = os.vm();

    let original = vm.channel().byte_at(nt::ALLOC_FN);
    assert_ne!(original, 0xcc);

    let bp = vm
        .set_breakpoint(
            PhysicalAddress(nt::ALLOC_FN),
            BreakpointOpts::default(),
            |_| Ok(ControlFlow::Continue(())),
        )
        .unwrap();

    assert_eq!(vm.channel().byte_at(nt::ALLOC_FN), 0xcc);

    // A second logical breakpoint shares the slot
    let bp2 = vm
        .set_breakpoint(
            PhysicalAddress(nt::ALLOC_FN),
            BreakpointOpts::default(),
            |_| Ok(ControlFlow::Continue(())),
        )
        .unwrap();
    assert_eq!(vm.channel().breakpoint_count(), 1);

    vm.remove_breakpoint(bp.id()).unwrap();
    assert_eq!(vm.channel().byte_at(nt::ALLOC_FN), 0xcc);

    vm.remove_breakpoint(bp2.id()).unwrap();
    assert_eq!(vm.channel().byte_at(nt::ALLOC_FN), original);
    assert_eq!(vm.channel().breakpoint_count(), 0);

    // Removing twice reports the unknown id
    assert!(vm.remove_breakpoint(bp.id()).is_err());
}

#[test]
fn heap_hook_rewrites_and_pairs_return() {
    let os = nt::build();
    let notepad = os.find_process_by_name("notepad.exe").unwrap().unwrap();
    let san = HeapSan::attach(os.clone(), notepad).unwrap();

    // The entry breakpoint is armed on the function's physical page
    assert_eq!(os.vm().channel().byte_at(nt::ALLOC_FN), 0xcc);

    // The guest calls RtlpAllocateHeapInternal(HEAP_HANDLE, 0x40)
    os.vm().channel().set_regs(0, |regs| {
        regs.rcx = nt::HEAP_HANDLE;
        regs.rdx = 0x40;
        regs.rsp = nt::STACK_TOP;
        regs.rip = nt::ALLOC_FN;
    });
    os.vm().channel().hit(nt::ALLOC_FN, vec![]);
    // ... and returns 0x5000 at the recorded return site
    os.vm()
        .channel()
        .hit(nt::RET_SITE, vec![(0, Register::Rax, 0x5000)]);

    let event = os.run_until(|_| false).unwrap();
    assert_eq!(event, Event::Timeout);

    let regs = os.vm().registers(VcpuId(0)).unwrap();
    // The size argument was grown by the guard slack before the call
    assert_eq!(regs.rdx, 0x40 + 0x20);
    // The returned pointer was shifted by half the slack
    assert_eq!(regs.rax, 0x5000 + 0x10);

    assert_eq!(san.tracked_count(), 1);
    let stats = san.tracer().stats();
    assert_eq!(stats.reentrant_skips, 0);
    assert_eq!(stats.failed_hooks, 0);
}

#[test]
fn reentrant_allocation_is_skipped() {
    let os = nt::build();
    let notepad = os.find_process_by_name("notepad.exe").unwrap().unwrap();
    let san = HeapSan::attach(os.clone(), notepad).unwrap();

    os.vm().channel().set_regs(0, |regs| {
        regs.rcx = nt::HEAP_HANDLE;
        regs.rdx = 0x40;
        regs.rsp = nt::STACK_TOP;
    });

    // Outer allocation enters, then a nested one on the same thread before
    // the outer returned
    os.vm().channel().hit(nt::ALLOC_FN, vec![]);
    os.vm()
        .channel()
        .hit(nt::ALLOC_FN, vec![(0, Register::Rdx, 0x80)]);
    os.vm()
        .channel()
        .hit(nt::RET_SITE, vec![(0, Register::Rax, 0x7000)]);

    let event = os.run_until(|_| false).unwrap();
    assert_eq!(event, Event::Timeout);

    // The nested entry was filtered: its size argument was left alone
    let regs = os.vm().registers(VcpuId(0)).unwrap();
    assert_eq!(regs.rdx, 0x80);

    assert_eq!(san.tracer().stats().reentrant_skips, 1);
    assert_eq!(san.tracked_count(), 1);
}

#[test]
fn thread_exit_cancels_return_hooks() {
    let os = nt::build();
    let notepad = os.find_process_by_name("notepad.exe").unwrap().unwrap();
    let san = HeapSan::attach(os.clone(), notepad).unwrap();

    os.vm().channel().set_regs(0, |regs| {
        regs.rcx = nt::HEAP_HANDLE;
        regs.rdx = 0x40;
        regs.rsp = nt::STACK_TOP;
    });

    // The allocation enters, then the thread dies before returning; when
    // the stale return site is reached later, the cancelled hook must not
    // fire
    os.vm().channel().hit(nt::ALLOC_FN, vec![]);
    os.vm().channel().hit(nt::PSP_EXIT, vec![]);
    os.vm()
        .channel()
        .hit(nt::RET_SITE, vec![(0, Register::Rax, 0x5000)]);

    let event = os.run_until(|_| false).unwrap();
    assert_eq!(event, Event::Timeout);

    // No return callback ran: the value was not shifted and nothing is
    // tracked
    let regs = os.vm().registers(VcpuId(0)).unwrap();
    assert_eq!(regs.rax, 0x5000);
    assert_eq!(san.tracked_count(), 0);
}

#[test]
fn one_shot_fires_once() {
    let os = nt::build();
    let vm = os.vm();

    let hits = Rc::new(std::cell::Cell::new(0));
    let seen = hits.clone();
    let _bp = vm
        .set_breakpoint(
            PhysicalAddress(nt::RET_SITE),
            BreakpointOpts {
                one_shot: true,
                ..Default::default()
            },
            move |_| {
                seen.set(seen.get() + 1);
                Ok(ControlFlow::Continue(()))
            },
        )
        .unwrap();

    vm.channel().hit(nt::RET_SITE, vec![]);
    vm.channel().hit(nt::RET_SITE, vec![]);

    let event = os.run_until(|_| false).unwrap();
    assert_eq!(event, Event::Timeout);
    assert_eq!(hits.get(), 1);
}

#[test]
fn callbacks_fire_in_insertion_order_and_stop() {
    let os = nt::build();
    let vm = os.vm();

    let order = Rc::new(std::cell::RefCell::new(Vec::new()));

    let seen = order.clone();
    let _first = vm
        .set_breakpoint(
            PhysicalAddress(nt::RET_SITE),
            BreakpointOpts::default(),
            move |_| {
                seen.borrow_mut().push(1);
                Ok(ControlFlow::Continue(()))
            },
        )
        .unwrap();

    let seen = order.clone();
    let _second = vm
        .set_breakpoint(
            PhysicalAddress(nt::RET_SITE),
            BreakpointOpts::default(),
            move |_| {
                seen.borrow_mut().push(2);
                Ok(ControlFlow::Break(()))
            },
        )
        .unwrap();

    vm.channel().hit(nt::RET_SITE, vec![]);
    // A second scripted event must not be consumed: the callback stopped
    // the run
    vm.channel().hit(nt::RET_SITE, vec![]);

    let event = os.run_until(|_| false).unwrap();
    assert!(matches!(event, Event::Breakpoint(_)));
    assert_eq!(&*order.borrow(), &[1, 2]);

    // The pending event is still scripted for the next run
    let event = os.run_until(|_| false).unwrap();
    assert!(matches!(event, Event::Breakpoint(_)));
    assert_eq!(&*order.borrow(), &[1, 2, 1, 2]);
}

#[test]
fn reader_matches_physical_reads() {
    let os = nt::build();
    let vm = os.vm();

    // A pattern crossing a 4K page boundary
    let pattern: Vec<u8> = (0..0x2000u32).map(|i| i as u8).collect();
    vm.channel().poke(0x7000, &pattern);

    let reader = icebox::Reader::new(vm, PhysicalAddress(common::KPGD));

    let mut through_reader = vec![0u8; 0x2000];
    reader
        .read(
            ibc::VirtualAddress(common::KMAP + 0x7000),
            &mut through_reader,
        )
        .unwrap();

    let mut direct = vec![0u8; 0x2000];
    vm.read_physical(PhysicalAddress(0x7000), &mut direct)
        .unwrap();

    assert_eq!(through_reader, direct);

    // Unmapped pages fail with the faulting address
    let unmapped = ibc::VirtualAddress(common::KMAP + 0x4000_0000);
    let err = reader.read_u64(unmapped).unwrap_err();
    assert!(format!("{err}").contains("4000000"));
}

#[test]
fn detach_restores_guest_bytes() {
    let os = nt::build();
    let vm = os.vm();

    let original = vm.channel().byte_at(nt::ALLOC_FN);
    let _bp = vm
        .set_breakpoint(
            PhysicalAddress(nt::ALLOC_FN),
            BreakpointOpts::default(),
            |_| Ok(ControlFlow::Continue(())),
        )
        .unwrap();
    assert_eq!(vm.channel().byte_at(nt::ALLOC_FN), 0xcc);

    vm.detach().unwrap();

    assert_eq!(vm.run_state(), RunState::Detached);
    assert_eq!(vm.channel().byte_at(nt::ALLOC_FN), original);
    assert_eq!(vm.channel().breakpoint_count(), 0);

    // Everything after detach is refused
    assert!(vm.resume().is_err());
    assert!(vm
        .set_breakpoint(
            PhysicalAddress(nt::ALLOC_FN),
            BreakpointOpts::default(),
            |_| Ok(ControlFlow::Continue(()))
        )
        .is_err());
}
