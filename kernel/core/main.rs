//! AetherOS process kernel simulator
//! Boots the kernel on a host-thread machine with a small demo workload.
//!
//! Usage: aetheros-sim [config.toml]

use std::process::ExitCode;
use std::sync::Arc;

use aetheros_proc::{entry_point, Kernel, KernelConfig, ThreadMachine};

fn worker(kernel: &Kernel, arg: &str) -> i32 {
    kernel
        .machine()
        .console(&format!("worker {:?}: running with arg {}", kernel.getpid(), arg));
    arg.parse().unwrap_or(-1)
}

fn start1(kernel: &Kernel, _arg: &str) -> i32 {
    let stack = kernel.config().min_stack;
    let high = kernel.config().max_priority;
    let low = kernel.config().min_priority;
    let mid = high.saturating_add(1).min(low);

    let mut failed = false;
    for (name, arg, priority) in [("low", "3", low), ("high", "1", high), ("mid", "2", mid)] {
        match kernel.fork(name, entry_point(worker), Some(arg), stack, priority) {
            Ok(pid) => log::info!("start1: forked {} as pid {}", name, pid),
            Err(e) => {
                kernel.machine().console(&format!("start1: fork of {} failed: {}", name, e));
                failed = true;
                break;
            }
        }
    }
    kernel.dump_processes();

    // Children forked before a failure still have to be joined
    while let Ok((pid, status)) = kernel.join() {
        kernel
            .machine()
            .console(&format!("start1: joined pid {} with status {}", pid, status));
    }
    i32::from(failed)
}

fn main() -> ExitCode {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match KernelConfig::load(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("aetheros-sim: {}", e);
                return ExitCode::from(2);
            }
        },
        None => KernelConfig::default(),
    };

    let machine = Arc::new(ThreadMachine::new());
    let kernel = match Kernel::new(config, machine.clone()) {
        Ok(kernel) => kernel,
        Err(e) => {
            eprintln!("aetheros-sim: {}", e);
            return ExitCode::from(2);
        }
    };

    let halt = kernel.startup(Arc::new(start1));
    for line in machine.console_output() {
        println!("{}", line);
    }
    ExitCode::from(halt.code.clamp(0, 255) as u8)
}
