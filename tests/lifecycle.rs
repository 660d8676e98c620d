//! fork / join / quit scenarios on a booted kernel

mod common;

use aetheros_proc::{entry_point, Error, HookEvent, KernelConfig, ProcessStatus};
use common::{sim, Sim, Trace, STACK, START_PID};

#[test]
fn start1_returning_completes_the_run() {
    let sim = sim();
    let halt = sim.run(|_, _| 0);
    assert_eq!(halt.code, 0);
    assert_eq!(halt.message.as_deref(), Some("All processes completed."));
}

#[test]
fn boot_creates_sentinel_then_start1_and_dispatches_start1() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        t.push(format!("pid {:?}", k.getpid()));
        0
    });
    assert_eq!(halt.code, 0);
    assert_eq!(trace.lines(), vec![format!("pid {:?}", Some(START_PID))]);

    let events = sim.events.drain();
    assert_eq!(
        &events[..3],
        &[
            HookEvent::Created(1),
            HookEvent::Created(START_PID),
            HookEvent::Switched { from: None, to: START_PID },
        ]
    );
    assert!(events.contains(&HookEvent::Terminated(START_PID)));
}

#[test]
fn higher_priority_child_runs_first_and_zombie_is_joined() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        let (ta, tb) = (t.clone(), t.clone());
        let a = k
            .fork("A", entry_point(move |_, _| { ta.push("A runs"); 2 }), None, STACK, 2)
            .unwrap();
        let b = k
            .fork("B", entry_point(move |_, _| { tb.push("B runs"); 7 }), None, STACK, 1)
            .unwrap();

        let first = k.join().unwrap();
        t.push(format!("joined {} status {}", if first.0 == b { "B" } else { "?" }, first.1));
        let second = k.join().unwrap();
        t.push(format!("joined {} status {}", if second.0 == a { "A" } else { "?" }, second.1));
        0
    });

    assert_eq!(halt.code, 0);
    assert_eq!(
        trace.lines(),
        vec!["B runs", "joined B status 7", "A runs", "joined A status 2"]
    );
}

#[test]
fn join_blocks_until_child_quits_and_receives_its_record() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        let child = k.fork("child", entry_point(|_, _| 5), None, STACK, 3).unwrap();
        let (pid, status) = k.join().unwrap();
        t.push(format!("{} {}", pid == child, status));
        0
    });

    assert_eq!(halt.code, 0);
    assert_eq!(trace.lines(), vec!["true 5"]);

    let child = START_PID + 1;
    let events = sim.events.drain();
    let after_boot: Vec<_> = events
        .into_iter()
        .skip_while(|e| *e != HookEvent::Created(child))
        .take(4)
        .collect();
    assert_eq!(
        after_boot,
        vec![
            HookEvent::Created(child),
            HookEvent::Switched { from: Some(START_PID), to: child },
            HookEvent::Terminated(child),
            HookEvent::Switched { from: Some(child), to: START_PID },
        ]
    );
}

#[test]
fn join_takes_a_waiting_zombie_without_blocking() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        let me = k.getpid().unwrap();
        let child = k
            .fork(
                "child",
                entry_point(move |k, _| {
                    k.unblock_proc(me).unwrap();
                    9
                }),
                None,
                STACK,
                2,
            )
            .unwrap();
        k.block_me(20);

        let (pid, status) = k.join().unwrap();
        t.push(format!("{} {}", pid == child, status));
        0
    });

    assert_eq!(halt.code, 0);
    assert_eq!(trace.lines(), vec!["true 9"]);

    // Before start1 quits, only block_me switched it away; join returned on the spot.
    let switched_away = sim
        .events
        .drain()
        .into_iter()
        .take_while(|e| *e != HookEvent::Terminated(START_PID))
        .filter(|e| matches!(e, HookEvent::Switched { from: Some(START_PID), .. }))
        .count();
    assert_eq!(switched_away, 1);
}

#[test]
fn zombies_are_reaped_in_termination_order() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        let me = k.getpid().unwrap();
        let first_created = k
            .fork(
                "late",
                entry_point(move |k, _| {
                    k.unblock_proc(me).unwrap();
                    1
                }),
                None,
                STACK,
                3,
            )
            .unwrap();
        let second_created = k.fork("early", entry_point(|_, _| 2), None, STACK, 2).unwrap();
        k.block_me(11);

        let a = k.join().unwrap();
        let b = k.join().unwrap();
        t.push(format!("{}", a == (second_created, 2)));
        t.push(format!("{}", b == (first_created, 1)));
        0
    });

    assert_eq!(halt.code, 0);
    assert_eq!(trace.lines(), vec!["true", "true"]);
}

#[test]
fn join_reports_no_children_and_already_reaped() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        t.push(format!("{:?}", k.join()));
        k.fork("child", entry_point(|_, _| 0), None, STACK, 4).unwrap();
        k.join().unwrap();
        t.push(format!("{:?}", k.join()));
        0
    });

    assert_eq!(halt.code, 0);
    assert_eq!(
        trace.lines(),
        vec![
            format!("{:?}", Err::<(u32, i32), _>(Error::NoChildren)),
            format!("{:?}", Err::<(u32, i32), _>(Error::AlreadyReaped)),
        ]
    );
}

#[test]
fn quitting_with_a_live_child_halts_the_machine() {
    let sim = sim();
    let halt = sim.run(|k, _| {
        k.fork("orphan", entry_point(|_, _| 0), None, STACK, 3).unwrap();
        0
    });

    assert_eq!(halt.code, 1);
    assert_eq!(
        halt.message.as_deref(),
        Some("quit(): process 2 still has 1 active children. Halting...")
    );
}

#[test]
fn quitting_with_unjoined_zombies_discards_them() {
    let sim = sim();
    let halt = sim.run(|k, _| {
        let me = k.getpid().unwrap();
        k.fork(
            "child",
            entry_point(move |k, _| {
                k.unblock_proc(me).unwrap();
                3
            }),
            None,
            STACK,
            2,
        )
        .unwrap();
        k.block_me(12);
        0
    });

    assert_eq!(halt.code, 0);
    assert_eq!(sim.machine.live_contexts(), 1, "only the sentinel context remains");
}

#[test]
fn fork_rejects_bad_requests_without_halting() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        let ok = || entry_point(|_, _| 0);
        t.push(format!("{:?}", k.fork("", ok(), None, STACK, 3)));
        t.push(format!("{:?}", k.fork("x", None, None, STACK, 3)));
        t.push(format!("{:?}", k.fork("x", ok(), None, STACK, 0)));
        t.push(format!("{:?}", k.fork("x", ok(), None, STACK, 6)));
        t.push(format!("{:?}", k.fork("x", ok(), None, STACK, 7)));
        t.push(format!("{:?}", k.fork("x", ok(), None, STACK - 1, 3)));
        0
    });

    assert_eq!(halt.code, 0);
    let expected: Vec<String> = [
        Error::NullName,
        Error::NullEntryPoint,
        Error::InvalidPriority(0),
        Error::InvalidPriority(6),
        Error::InvalidPriority(7),
        Error::StackTooSmall { requested: STACK - 1, minimum: STACK },
    ]
    .into_iter()
    .map(|e| format!("{:?}", Err::<u32, _>(e)))
    .collect();
    assert_eq!(trace.lines(), expected);
}

#[test]
fn overlong_name_is_fatal() {
    let sim = sim();
    let halt = sim.run(|k, _| {
        let name = "n".repeat(49);
        let _ = k.fork(&name, entry_point(|_, _| 0), None, STACK, 3);
        0
    });
    assert_eq!(halt.code, 1);
    assert_eq!(halt.message.as_deref(), Some("fork(): process name is too long. Halting..."));
}

#[test]
fn overlong_argument_is_fatal() {
    let sim = sim();
    let halt = sim.run(|k, _| {
        let arg = "a".repeat(99);
        let _ = k.fork("child", entry_point(|_, _| 0), Some(&arg), STACK, 3);
        0
    });
    assert_eq!(halt.code, 1);
    assert_eq!(halt.message.as_deref(), Some("fork(): argument too long. Halting..."));
}

#[test]
fn entry_point_receives_its_argument() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        let tc = t.clone();
        k.fork(
            "echo",
            entry_point(move |_, arg| {
                tc.push(arg);
                arg.len() as i32
            }),
            Some("hello"),
            STACK,
            2,
        )
        .unwrap();
        let (_, status) = k.join().unwrap();
        t.push(status.to_string());
        0
    });
    assert_eq!(halt.code, 0);
    assert_eq!(trace.lines(), vec!["hello", "5"]);
}

#[test]
fn fork_in_user_mode_is_fatal() {
    let sim = sim();
    let halt = sim.run(|k, _| {
        k.status_register().set_kernel_mode(false).unwrap();
        let _ = k.fork("child", entry_point(|_, _| 0), None, STACK, 3);
        0
    });
    assert_eq!(halt.code, 1);
    assert_eq!(halt.message.as_deref(), Some("fork(): called while in user mode. Halting..."));
}

#[test]
fn processes_start_with_interrupts_enabled() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        let regs = k.status_register();
        t.push(format!("{} {}", regs.is_kernel_mode(), regs.interrupts_enabled()));
        0
    });
    assert_eq!(halt.code, 0);
    assert_eq!(trace.lines(), vec!["true true"]);
}

#[test]
fn table_full_is_reported_and_recoverable() {
    let sim = Sim::new(KernelConfig::default().with_max_proc(4));
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        // sentinel and start1 hold two of the four slots
        t.push(format!("{}", k.fork("c1", entry_point(|_, _| 0), None, STACK, 5).is_ok()));
        t.push(format!("{}", k.fork("c2", entry_point(|_, _| 0), None, STACK, 5).is_ok()));
        t.push(format!("{:?}", k.fork("c3", entry_point(|_, _| 0), None, STACK, 5)));
        k.join().unwrap();
        t.push(format!("{}", k.fork("c4", entry_point(|_, _| 0), None, STACK, 5).is_ok()));
        k.join().unwrap();
        k.join().unwrap();
        0
    });

    assert_eq!(halt.code, 0);
    assert_eq!(
        trace.lines(),
        vec![
            "true".to_string(),
            "true".to_string(),
            format!("{:?}", Err::<u32, _>(Error::TableFull)),
            "true".to_string(),
        ]
    );
}

#[test]
fn pids_keep_increasing_as_slots_are_reused() {
    let sim = Sim::new(KernelConfig::default().with_max_proc(4));
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        for _ in 0..3 {
            let pid = k.fork("c", entry_point(|_, _| 0), None, STACK, 3).unwrap();
            k.join().unwrap();
            t.push(pid.to_string());
        }
        0
    });

    assert_eq!(halt.code, 0);
    // pids 5 and 6 map onto the sentinel's and start1's slots
    assert_eq!(trace.lines(), vec!["3", "4", "7"]);
}

#[test]
fn dump_processes_reports_the_table() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        let child = k.fork("child", entry_point(|_, _| 0), None, STACK, 3).unwrap();
        for info in k.dump_processes() {
            t.push(format!("{} {:?} {} {} {}", info.pid, info.parent, info.priority, info.status, info.name));
        }
        k.join().unwrap();
        t.push(format!("{}", child));
        0
    });

    assert_eq!(halt.code, 0);
    assert_eq!(
        trace.lines(),
        vec![
            "1 None 6 READY sentinel",
            "2 None 1 RUNNING start1",
            "3 Some(2) 3 READY child",
            "3",
        ]
    );
    assert!(sim.console().iter().any(|line| line.starts_with("PID")));
}

#[test]
fn dump_reports_quit_zombies() {
    let sim = sim();
    let trace = Trace::default();
    let t = trace.clone();
    let halt = sim.run(move |k, _| {
        let me = k.getpid().unwrap();
        k.fork(
            "child",
            entry_point(move |k, _| {
                k.unblock_proc(me).unwrap();
                0
            }),
            None,
            STACK,
            2,
        )
        .unwrap();
        k.block_me(13);
        let info = k.dump_processes();
        let zombie = info.iter().find(|i| i.name == "child").unwrap();
        let me = info.iter().find(|i| i.name == "start1").unwrap();
        t.push(format!("{} {}", zombie.status == ProcessStatus::Quit, me.zombies));
        k.join().unwrap();
        0
    });
    assert_eq!(halt.code, 0);
    assert_eq!(trace.lines(), vec!["true 1"]);
}

#[test]
fn panicking_process_halts_the_machine() {
    let sim = sim();
    let halt = sim.run(|_, _| panic!("start1 exploded"));
    assert_eq!(halt.code, 1);
    assert!(halt.message.unwrap().contains("start1 exploded"));
}

#[test]
fn second_startup_is_refused() {
    let sim = sim();
    assert_eq!(sim.run(|_, _| 0).code, 0);
    let again = sim.run(|_, _| 0);
    assert_eq!(again.code, 1);
    assert_eq!(again.message.as_deref(), Some("kernel already started"));
}
