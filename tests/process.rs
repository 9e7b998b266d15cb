mod common;

use common::{images, Sim, DATA};
use kestrel::arch::{HalError, SEGV_ACCERR, SEGV_MAPERR, TRAP_ILLEGAL, TRAP_MATH, TRAP_MEMORY};
use kestrel::config::KILL;
use kestrel::kern::loader::{LoadStatus, LoadTarget};
use kestrel::kern::ProcState;
use kestrel::{ImageLoader, KernelFault, Pid, ProgramLoader, SyscallOp};

const STATUS: usize = DATA + 0x300;

// ============================================================================
// Fork, exit, wait
// ============================================================================

#[test]
fn fork_copies_the_address_space() {
    let mut sim = Sim::boot();
    sim.write(DATA, b"marker");
    let free = sim.kernel.free_frames();

    let child = sim.call(SyscallOp::Fork, &[]);
    assert_eq!(child, 3);
    assert_eq!(sim.pid(), 2);
    // three user pages and a kernel stack
    assert_eq!(sim.kernel.free_frames(), free - 5);
    sim.assert_consistent();

    let parent = sim.kernel.process(Pid(2)).unwrap();
    let forked = sim.kernel.process(Pid(3)).unwrap();
    assert_eq!(forked.parent, Some(Pid(2)));
    assert_eq!(forked.state, ProcState::Ready);
    assert_eq!((forked.data_end, forked.brk, forked.stack_low), (parent.data_end, parent.brk, parent.stack_low));
    for ((slot_a, a), (slot_b, b)) in parent.user_table.valid_entries().zip(forked.user_table.valid_entries()) {
        assert_eq!(slot_a, slot_b);
        assert_eq!(a.prot, b.prot);
        assert_ne!(a.pfn, b.pfn);
    }

    // the child starts with 0 and sees the parent's data
    assert_eq!(sim.call(SyscallOp::Delay, &[1]), 0);
    assert_eq!(sim.pid(), 3);
    assert_eq!(sim.read(DATA, 6), b"marker");
    sim.write(DATA, b"child!");
    sim.call(SyscallOp::Exit, &[0]);
    assert_eq!(sim.kernel.current_pid(), sim.kernel.idle_pid());

    sim.tick();
    assert_eq!(sim.pid(), 2);
    assert_eq!(sim.ctx.retval(), 0);
    assert_eq!(sim.read(DATA, 6), b"marker");
    sim.assert_consistent();
}

#[test]
fn wait_collects_an_exited_child() {
    let mut sim = Sim::boot();
    let free = sim.kernel.free_frames();
    sim.fork_and_yield();
    sim.call(SyscallOp::Exit, &[7]);
    // parent is still delaying
    sim.tick();
    assert_eq!(sim.pid(), 2);

    assert_eq!(sim.call(SyscallOp::Wait, &[STATUS]), 3);
    assert_eq!(sim.word(STATUS), 7);
    assert!(sim.kernel.process(Pid(3)).is_none());
    assert_eq!(sim.kernel.free_frames(), free);
    sim.assert_consistent();

    assert_eq!(sim.call(SyscallOp::Wait, &[STATUS]), -1);
}

#[test]
fn wait_blocks_until_a_child_exits() {
    let mut sim = Sim::boot();
    assert_eq!(sim.call(SyscallOp::Fork, &[]), 3);

    // parent blocks, child runs with 0
    assert_eq!(sim.call(SyscallOp::Wait, &[STATUS]), 0);
    assert_eq!(sim.pid(), 3);
    assert_eq!(sim.kernel.process(Pid(2)).unwrap().state, ProcState::Wait);

    assert_eq!(sim.call(SyscallOp::Exit, &[42]), 3);
    assert_eq!(sim.pid(), 2);
    assert_eq!(sim.word(STATUS), 42);
    assert_eq!(sim.kernel.process(Pid(2)).unwrap().state, ProcState::Ready);
}

#[test]
fn wait_without_children_fails() {
    let mut sim = Sim::boot();
    assert_eq!(sim.call(SyscallOp::Wait, &[STATUS]), -1);
    assert_eq!(sim.pid(), 2);
}

#[test]
fn wait_rejects_a_bad_status_pointer() {
    let mut sim = Sim::boot();
    sim.call(SyscallOp::Fork, &[]);
    // text is not writable
    assert_eq!(sim.call(SyscallOp::Wait, &[0x10_0000]), -1);
    assert_eq!(sim.call(SyscallOp::Wait, &[0]), -1);
    assert_eq!(sim.pid(), 2);
}

#[test]
fn exited_orphans_are_dropped() {
    let mut sim = Sim::boot();
    sim.fork_and_yield();
    // pid 3 forks pid 4 and exits before it
    assert_eq!(sim.call(SyscallOp::Fork, &[]), 4);
    sim.call(SyscallOp::Exit, &[0]);
    assert_eq!(sim.pid(), 4);
    assert_eq!(sim.kernel.process(Pid(4)).unwrap().parent, None);
    assert_eq!(sim.call(SyscallOp::GetPid, &[]), 4);
    sim.call(SyscallOp::Exit, &[5]);
    assert!(sim.kernel.process(Pid(4)).is_none());

    sim.tick();
    assert_eq!(sim.pid(), 2);
    assert_eq!(sim.call(SyscallOp::Wait, &[STATUS]), 3);
    assert_eq!(sim.word(STATUS), 0);
    assert_eq!(sim.call(SyscallOp::Wait, &[STATUS]), -1);
    assert_eq!(sim.kernel.process_count(), 2);
    assert_eq!(sim.kernel.free_frames(), 256 - 17);
    sim.assert_consistent();
}

#[test]
fn zombies_are_freed_with_their_parent() {
    let mut sim = Sim::boot();
    sim.fork_and_yield();
    assert_eq!(sim.call(SyscallOp::Fork, &[]), 4);
    assert_eq!(sim.call(SyscallOp::Delay, &[3]), 0);
    assert_eq!(sim.pid(), 4);
    sim.call(SyscallOp::Exit, &[1]);
    assert!(sim.kernel.process(Pid(4)).unwrap().zombie);

    // init wakes first, then waits for pid 3
    sim.tick();
    assert_eq!(sim.pid(), 2);
    sim.call(SyscallOp::Wait, &[STATUS]);
    sim.tick();
    sim.tick();
    assert_eq!(sim.pid(), 3);
    assert_eq!(sim.call(SyscallOp::Exit, &[0]), 3);
    assert_eq!(sim.pid(), 2);
    assert!(sim.kernel.process(Pid(4)).is_none());
    assert_eq!(sim.kernel.process_count(), 2);
    sim.assert_consistent();
}

#[test]
fn fork_fails_cleanly_without_frames() {
    let mut sim = Sim::boot();
    assert_eq!(sim.call(SyscallOp::Brk, &[0x1f_c000]), 0);
    assert_eq!(sim.kernel.free_frames(), 115);
    let count = sim.kernel.process_count();

    assert_eq!(sim.call(SyscallOp::Fork, &[]), -1);
    assert_eq!(sim.kernel.free_frames(), 115);
    assert_eq!(sim.kernel.process_count(), count);
    assert_eq!(sim.pid(), 2);
    sim.assert_consistent();
}

#[test]
fn getpid_reports_the_caller() {
    let mut sim = Sim::boot();
    assert_eq!(sim.call(SyscallOp::GetPid, &[]), 2);
    sim.fork_and_yield();
    assert_eq!(sim.call(SyscallOp::GetPid, &[]), 3);
}

#[test]
fn init_exit_halts_the_kernel() {
    let mut sim = Sim::boot();
    sim.call(SyscallOp::Exit, &[0]);
    assert!(sim.kernel.is_halted());
    assert!(sim.kernel.machine().is_halted());
    assert_eq!(sim.syscall(SyscallOp::GetPid, &[]), Err(KernelFault::Halted));
}

// ============================================================================
// Heap and stack
// ============================================================================

#[test]
fn brk_grows_and_shrinks_the_heap() {
    let mut sim = Sim::boot();
    let free = sim.kernel.free_frames();
    assert_eq!(sim.call(SyscallOp::Brk, &[0x10_8001]), 0);
    assert_eq!(sim.kernel.process(Pid(2)).unwrap().brk, 0x10_a000);
    assert_eq!(sim.kernel.free_frames(), free - 3);
    sim.write(0x10_9ff0, b"heap");

    assert_eq!(sim.call(SyscallOp::Brk, &[0x10_6000]), 0);
    assert_eq!(sim.kernel.free_frames(), free - 1);
    assert!(sim.kernel.read_user(0x10_8000, 1).is_err());
    sim.assert_consistent();
}

#[test]
fn brk_respects_data_end_and_stack_guard() {
    let mut sim = Sim::boot();
    let free = sim.kernel.free_frames();
    assert_eq!(sim.call(SyscallOp::Brk, &[0x10_3000]), -1);
    assert_eq!(sim.call(SyscallOp::Brk, &[0x1f_e000 - 0x1000]), -1);
    assert_eq!(sim.call(SyscallOp::Brk, &[usize::MAX]), -1);
    assert_eq!(sim.kernel.free_frames(), free);
    assert_eq!(sim.kernel.process(Pid(2)).unwrap().brk, 0x10_4000);
}

#[test]
fn stack_grows_on_a_fault_below_it() {
    let mut sim = Sim::boot();
    let free = sim.kernel.free_frames();
    sim.trap(TRAP_MEMORY, SEGV_MAPERR, 0x1f_bff8).unwrap();
    assert_eq!(sim.pid(), 2);
    assert_eq!(sim.kernel.process(Pid(2)).unwrap().stack_low, 0x1f_a000);
    assert_eq!(sim.kernel.free_frames(), free - 2);
    sim.write(0x1f_a000, b"deep");
    assert_eq!(sim.read(0x1f_a000, 4), b"deep");
    sim.assert_consistent();
}

// ============================================================================
// Kills
// ============================================================================

fn status_of_killed_child(vector: usize, code: usize, addr: usize) -> i32 {
    let mut sim = Sim::boot();
    sim.call(SyscallOp::Fork, &[]);
    sim.call(SyscallOp::Wait, &[STATUS]);
    assert_eq!(sim.pid(), 3);
    sim.trap(vector, code, addr).unwrap();
    assert_eq!(sim.pid(), 2);
    assert_eq!(sim.ctx.retval(), 3);
    assert!(sim.kernel.process(Pid(3)).is_none());
    sim.assert_consistent();
    sim.word(STATUS)
}

#[test]
fn bad_accesses_kill_the_process() {
    assert_eq!(status_of_killed_child(TRAP_MEMORY, SEGV_MAPERR, 0), KILL);
    assert_eq!(status_of_killed_child(TRAP_MEMORY, SEGV_MAPERR, 0x10_4000), KILL);
    assert_eq!(status_of_killed_child(TRAP_MEMORY, SEGV_ACCERR, 0x10_0000), KILL);
    assert_eq!(status_of_killed_child(TRAP_ILLEGAL, 0, 0), KILL);
    assert_eq!(status_of_killed_child(TRAP_MATH, 0, 0), KILL);
}

#[test]
fn illegal_instruction_in_idle_halts() {
    let mut sim = Sim::boot();
    sim.call(SyscallOp::Delay, &[5]);
    assert_eq!(sim.kernel.current_pid(), sim.kernel.idle_pid());
    sim.trap(TRAP_ILLEGAL, 0, 0).unwrap();
    assert!(sim.kernel.is_halted());
}

// ============================================================================
// Exec
// ============================================================================

fn stage_exec(sim: &mut Sim<impl ProgramLoader>, path: &[u8], args: &[&[u8]]) -> (usize, usize) {
    let path_va = DATA + 0x400;
    sim.write(path_va, path);
    sim.write(path_va + path.len(), &[0]);
    let vector = DATA + 0x480;
    let mut at = DATA + 0x500;
    for (i, arg) in args.iter().enumerate() {
        sim.write(at, arg);
        sim.write(at + arg.len(), &[0]);
        sim.write_word(vector + i * 4, at as u32);
        at += arg.len() + 1;
    }
    sim.write_word(vector + args.len() * 4, 0);
    (path_va, vector)
}

#[test]
fn exec_replaces_the_image() {
    let mut sim = Sim::boot();
    let free = sim.kernel.free_frames();
    let (path, argv) = stage_exec(&mut sim, b"prog", &[b"prog", b"x"]);

    assert_eq!(sim.call(SyscallOp::Exec, &[path, argv]), 2);
    assert_eq!(sim.pid(), 2);
    assert_eq!(sim.ctx.pc, 0x10_0000);
    assert_eq!(sim.ctx.sp, 0x1f_ffe8);
    assert_eq!(sim.read(0x10_0000, 4), vec![0xaa; 4]);
    assert_eq!(sim.read(0x10_2000, 9), b"prog-data");

    let argv = sim.ctx.regs[1];
    let second = sim.word(argv + 4) as usize;
    assert_eq!(sim.read(second, 2), b"x\0");
    assert_eq!(sim.word(argv + 8), 0);

    let pcb = sim.kernel.process(Pid(2)).unwrap();
    assert_eq!(pcb.data_end, 0x10_2000 + 9 + 100);
    assert_eq!(pcb.brk, 0x10_4000);
    assert_eq!(sim.kernel.free_frames(), free);
    sim.assert_consistent();
}

#[test]
fn exec_failure_keeps_the_old_image() {
    let mut sim = Sim::boot();
    let (path, argv) = stage_exec(&mut sim, b"nope", &[b"nope"]);
    assert_eq!(sim.call(SyscallOp::Exec, &[path, argv]), -1);
    assert_eq!(sim.read(DATA + 0x400, 5), b"nope\0");
    assert_eq!(sim.call(SyscallOp::Exec, &[0, argv]), -1);
    assert_eq!(sim.call(SyscallOp::Exec, &[path, 0x1f_fffe]), -1);
    assert_eq!(sim.pid(), 2);
    sim.assert_consistent();
}

/// Loader that tears down the old image and then gives up
struct Doomed(ImageLoader);

impl ProgramLoader for Doomed {
    fn load(&mut self, path: &str, argv: &[String], target: &mut LoadTarget<'_>) -> LoadStatus {
        if path == "doomed" {
            target.release_all();
            return LoadStatus::MustTerminate;
        }
        self.0.load(path, argv, target)
    }
}

#[test]
fn exec_that_loses_the_image_kills_the_caller() {
    let mut sim = Sim::boot_with(Doomed(images()));
    let free = sim.kernel.free_frames();
    sim.call(SyscallOp::Fork, &[]);
    sim.call(SyscallOp::Wait, &[STATUS]);
    assert_eq!(sim.pid(), 3);

    let (path, argv) = stage_exec(&mut sim, b"doomed", &[]);
    assert_eq!(sim.call(SyscallOp::Exec, &[path, argv]), 3);
    assert_eq!(sim.pid(), 2);
    assert_eq!(sim.word(STATUS), KILL);
    assert_eq!(sim.kernel.free_frames(), free);
    sim.assert_consistent();
}

// ============================================================================
// Scheduling
// ============================================================================

#[test]
fn delay_sleeps_for_whole_ticks() {
    let mut sim = Sim::boot();
    assert_eq!(sim.call(SyscallOp::Delay, &[usize::MAX]), -1);
    assert_eq!(sim.call(SyscallOp::Delay, &[0]), 0);
    assert_eq!(sim.pid(), 2);

    sim.call(SyscallOp::Delay, &[2]);
    assert_eq!(sim.kernel.current_pid(), sim.kernel.idle_pid());
    sim.tick();
    assert_eq!(sim.kernel.current_pid(), sim.kernel.idle_pid());
    sim.tick();
    assert_eq!(sim.pid(), 2);
    assert_eq!(sim.ctx.retval(), 0);
    assert_eq!(sim.kernel.sched_stats().ticks, 2);
}

#[test]
fn clock_rotates_ready_processes() {
    let mut sim = Sim::boot();
    assert_eq!(sim.call(SyscallOp::Fork, &[]), 3);
    assert_eq!(sim.call(SyscallOp::Fork, &[]), 4);

    let mut order = Vec::new();
    for _ in 0..4 {
        sim.tick();
        order.push(sim.pid());
    }
    assert_eq!(order, vec![3, 4, 2, 3]);
}

#[test]
fn idle_may_not_block() {
    let mut sim = Sim::boot();
    sim.call(SyscallOp::Delay, &[5]);
    let idle = sim.kernel.idle_pid();
    assert_eq!(sim.kernel.current_pid(), idle);

    assert_eq!(sim.call(SyscallOp::Delay, &[3]), -1);
    assert_eq!(sim.call(SyscallOp::TtyRead, &[0, 0x1f_e000, 4]), -1);
    assert_eq!(sim.kernel.current_pid(), idle);
    assert!(!sim.kernel.scheduler().is_queued(idle));
}

#[test]
fn failed_context_switch_halts() {
    let mut sim = Sim::boot();
    sim.kernel.machine_mut().fail_next_transfer();
    assert_eq!(
        sim.syscall(SyscallOp::Delay, &[1]),
        Err(KernelFault::ContextSwitch(HalError::ContextRestore))
    );
    assert!(sim.kernel.is_halted());
    assert_eq!(sim.trap(1, 0, 0), Err(KernelFault::Halted));
}

#[test]
fn unknown_traps_are_ignored() {
    let mut sim = Sim::boot();
    sim.ctx.regs[0] = 0x1234;
    sim.trap(0, 0x99, 0).unwrap();
    assert_eq!(sim.ctx.regs[0], 0x1234);
    assert_eq!(sim.kernel.syscall_stats().unknown, 1);

    sim.trap(42, 0, 0).unwrap();
    assert_eq!(sim.pid(), 2);
    assert!(!sim.kernel.is_halted());
}
