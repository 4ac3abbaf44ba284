use std::sync::{Arc, Barrier, Mutex};
use std::time::Duration;

use nagare::{
    Config, FetchOpts, GraphNode, NagareError, Permission, PublicationStatus, PublishOpts,
    Runtime, UsageError, VersionTag, Workers, World, make_key,
};

fn standalone() -> Runtime {
    Runtime::new(Config::default()).unwrap()
}

fn threaded(threads: usize) -> Runtime {
    Runtime::new(Config::default().workers(Workers::Threads(threads))).unwrap()
}

#[test]
fn set_then_read() {
    let mut rt = standalone();
    let h = rt.initial_access::<i32>(make_key!("H")).unwrap();
    let seen = Arc::new(Mutex::new(None));

    rt.task()
        .name("set")
        .modifies(&h)
        .run({
            let h = h.clone();
            move |ctx| {
                ctx.set(&h, 5)?;
                Ok(())
            }
        })
        .unwrap();

    rt.task()
        .name("read")
        .reads(&h)
        .run({
            let h = h.clone();
            let seen = seen.clone();
            move |ctx| {
                *seen.lock().unwrap() = Some(*ctx.get(&h)?);
                Ok(())
            }
        })
        .unwrap();

    // nothing runs before the rank is driven
    assert_eq!(rt.pending(), 2);
    assert!(seen.lock().unwrap().is_none());

    rt.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(5));

    let diagnostics = rt.finalize().unwrap();
    assert_eq!(diagnostics.tasks_run(), 2);
    assert!(diagnostics.render_mermaid().contains("set"));
}

#[test]
fn publish_once_fetch_once() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("H"), 1i32).unwrap();
    rt.publish(&h, PublishOpts::default().version(0u64).n_readers(1))
        .unwrap();

    let fetched = rt
        .read_access::<i32>(make_key!("H"), FetchOpts::default().version(0u64))
        .unwrap();
    assert_eq!(rt.wait(&fetched).unwrap(), 1);

    let err = rt
        .read_access::<i32>(make_key!("H"), FetchOpts::default().version(0u64))
        .unwrap_err();
    assert!(matches!(err, UsageError::OverSubscribed { n_readers: 1, .. }));

    assert_eq!(
        rt.coordinator().status(&make_key!("H"), &VersionTag::Auto(0)),
        PublicationStatus::Exhausted
    );
    assert!(rt.finalize().unwrap().leaked.is_empty());
}

#[test]
fn fetchers_never_see_a_stale_version() {
    let report = World::new(2, Config::default().stall_timeout(Duration::from_secs(10)))
        .run(|rt| {
            if rt.rank() == 0 {
                let value = 0.5 + rt.rank() as f64;
                let h = rt.initial_access_with(make_key!("H"), value)?;
                rt.publish(&h, PublishOpts::default().version(0u64))?;

                rt.task().name("update").modifies(&h).run({
                    let h = h.clone();
                    move |ctx| {
                        *ctx.get_mut(&h)? += 10.0;
                        Ok(())
                    }
                })?;
                rt.publish(&h, PublishOpts::default().version(1u64))?;
            } else {
                let v0 = rt.read_access::<f64>(make_key!("H"), FetchOpts::default().version(0u64))?;
                let v1 = rt.read_access::<f64>(make_key!("H"), FetchOpts::default().version(1u64))?;

                // fetch order does not matter, each sees its own version
                anyhow::ensure!(rt.wait(&v1)? == 10.5);
                anyhow::ensure!(rt.wait(&v0)? == 0.5);
            }
            Ok(())
        })
        .unwrap();

    assert_eq!(report.ranks.len(), 2);
    assert!(report.leaked.is_empty());
}

const K: usize = 4;
const ITERATIONS: usize = 50;

/// Every rank increments K values per iteration, rank 0 sums the local sums
/// of all ranks and broadcasts the total back.
fn reduce_and_broadcast(rt: &mut Runtime) -> anyhow::Result<()> {
    let rank = rt.rank();
    let n = rt.n_ranks();

    let xs = (0..K)
        .map(|k| rt.initial_access_with(make_key!("x", k), (rank * K + k) as f64))
        .collect::<Result<Vec<_>, _>>()?;
    let partial = rt.initial_access::<f64>(make_key!("partial", rank))?;
    let global = rt.initial_access::<f64>(make_key!("global"))?;

    for i in 0..ITERATIONS {
        for x in &xs {
            rt.task().name("increment").modifies(x).run({
                let x = x.clone();
                move |ctx| {
                    *ctx.get_mut(&x)? += 1.0;
                    Ok(())
                }
            })?;
        }

        rt.task().name("local sum").reads(&xs).modifies(&partial).run({
            let xs = xs.clone();
            let partial = partial.clone();
            move |ctx| {
                let mut sum = 0.0;
                for x in &xs {
                    sum += *ctx.get(x)?;
                }
                ctx.set(&partial, sum)?;
                Ok(())
            }
        })?;

        if rank == 0 {
            let mut parts = Vec::new();
            for peer in 1..n {
                let part = rt.read_access::<f64>(
                    make_key!("partial", peer),
                    FetchOpts::default().version(i),
                )?;
                parts.push(part);
            }

            rt.task()
                .name("reduce")
                .reads((&partial, &parts))
                .modifies(&global)
                .run({
                    let partial = partial.clone();
                    let parts = parts.clone();
                    let global = global.clone();
                    move |ctx| {
                        let mut total = *ctx.get(&partial)?;
                        for part in &parts {
                            total += *ctx.get(part)?;
                        }
                        ctx.set(&global, total)?;
                        Ok(())
                    }
                })?;

            rt.publish(&global, PublishOpts::default().version(i).n_readers(n - 1))?;
            for part in &parts {
                rt.release(part)?;
            }
        } else {
            rt.publish(&partial, PublishOpts::default().version(i))?;

            let total = rt.read_access::<f64>(make_key!("global"), FetchOpts::default().version(i))?;
            rt.task().name("broadcast").reads(&total).modifies(&global).run({
                let total = total.clone();
                let global = global.clone();
                move |ctx| {
                    let value = *ctx.get(&total)?;
                    ctx.set(&global, value)?;
                    Ok(())
                }
            })?;
            rt.release(&total)?;
        }
    }

    let nk = (n * K) as f64;
    let expected = nk * (nk - 1.0) / 2.0 + nk * ITERATIONS as f64;
    let result = rt.wait(&global)?;
    anyhow::ensure!(result == expected, "rank {rank} ended with {result}, expected {expected}");

    Ok(())
}

#[test]
fn iterated_reduce_and_broadcast_terminates() {
    let config = Config::default().stall_timeout(Duration::from_secs(10));
    let report = World::new(3, config).run(reduce_and_broadcast).unwrap();

    assert!(report.leaked.is_empty());
    // K increments, one local sum and one reduce or broadcast per iteration
    for diagnostics in &report.ranks {
        assert_eq!(diagnostics.tasks_run(), ITERATIONS * (K + 2));
    }
}

#[test]
fn iterated_reduce_and_broadcast_on_worker_threads() {
    let config = Config::default()
        .workers(Workers::Threads(3))
        .stall_timeout(Duration::from_secs(10));

    World::new(2, config).run(reduce_and_broadcast).unwrap();
}

#[test]
fn read_after_write_with_worker_threads() {
    let mut rt = threaded(4);
    let handles = (0..8)
        .map(|i| rt.initial_access_with(make_key!("cell", i), i as u64))
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

    for round in 1..=20u64 {
        for h in &handles {
            rt.task().name("step").modifies(h).run({
                let h = h.clone();
                move |ctx| {
                    let value = ctx.get_mut(&h)?;
                    *value = *value * 2 + round;
                    Ok(())
                }
            })
            .unwrap();
        }
    }

    for (i, h) in handles.iter().enumerate() {
        let expected = (1..=20u64).fold(i as u64, |acc, round| acc * 2 + round);
        assert_eq!(rt.wait(h).unwrap(), expected);
    }
}

#[test]
fn readers_of_one_version_run_side_by_side() {
    let mut rt = threaded(3);
    let h = rt.initial_access_with(make_key!("shared"), 3i32).unwrap();
    let barrier = Arc::new(Barrier::new(2));

    // each reader waits for the other, so they must overlap
    for _ in 0..2 {
        rt.task().name("reader").reads(&h).run({
            let h = h.clone();
            let barrier = barrier.clone();
            move |ctx| {
                anyhow::ensure!(*ctx.get(&h)? == 3);
                barrier.wait();
                Ok(())
            }
        })
        .unwrap();
    }

    rt.run().unwrap();
}

#[test]
fn modify_waits_for_earlier_readers() {
    let mut rt = threaded(4);
    let h = rt.initial_access_with(make_key!("ordered"), 0i32).unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    for reader in 0..3 {
        rt.task().name("reader").reads(&h).run({
            let h = h.clone();
            let log = log.clone();
            move |ctx| {
                std::thread::sleep(Duration::from_millis(10));
                log.lock().unwrap().push(format!("read {reader}: {}", ctx.get(&h)?));
                Ok(())
            }
        })
        .unwrap();
    }

    rt.task().name("writer").modifies(&h).run({
        let h = h.clone();
        let log = log.clone();
        move |ctx| {
            ctx.set(&h, 1)?;
            log.lock().unwrap().push(String::from("write"));
            Ok(())
        }
    })
    .unwrap();

    assert_eq!(rt.wait(&h).unwrap(), 1);
    rt.run().unwrap();

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 4);
    assert_eq!(log.last().map(String::as_str), Some("write"));
    assert!(log[..3].iter().all(|line| line.ends_with(": 0")));
}

#[test]
fn nested_work_feeds_the_enclosing_task() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("nested"), 1i32).unwrap();

    rt.task().name("outer").schedules_modify(&h).run({
        let h = h.clone();
        move |ctx| {
            assert_eq!(ctx.permissions(&h), Some((Permission::Modify, Permission::None)));
            assert!(matches!(ctx.get(&h), Err(UsageError::PermissionDenied { .. })));

            for _ in 0..3 {
                ctx.task().name("inner").modifies(&h).run({
                    let h = h.clone();
                    move |ctx| {
                        *ctx.get_mut(&h)? *= 10;
                        Ok(())
                    }
                })?;
            }
            Ok(())
        }
    })
    .unwrap();

    rt.task().name("after").modifies(&h).run({
        let h = h.clone();
        move |ctx| {
            *ctx.get_mut(&h)? += 1;
            Ok(())
        }
    })
    .unwrap();

    assert_eq!(rt.wait(&h).unwrap(), 1001);
}

#[test]
fn nested_work_sees_local_changes() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("local"), 2i32).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));

    rt.task().name("outer").modifies(&h).run({
        let h = h.clone();
        let seen = seen.clone();
        move |ctx| {
            ctx.set(&h, 20)?;
            ctx.task().name("inner").reads(&h).run({
                let h = h.clone();
                let seen = seen.clone();
                move |ctx| {
                    seen.lock().unwrap().push(*ctx.get(&h)?);
                    Ok(())
                }
            })?;
            Ok(())
        }
    })
    .unwrap();

    assert_eq!(rt.wait(&h).unwrap(), 20);
    rt.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![20]);
}

#[test]
fn reading_while_scheduling_a_modification() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("rsm"), 4i32).unwrap();

    rt.task().name("outer").reads_schedules_modify(&h).run({
        let h = h.clone();
        move |ctx| {
            let base = *ctx.get(&h)?;
            anyhow::ensure!(ctx.set(&h, 0).is_err());

            ctx.task().name("inner").modifies(&h).run({
                let h = h.clone();
                move |ctx| {
                    ctx.set(&h, base * base)?;
                    Ok(())
                }
            })?;
            Ok(())
        }
    })
    .unwrap();

    assert_eq!(rt.wait(&h).unwrap(), 16);
}

#[test]
fn nested_permissions_cannot_grow() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("narrow"), 0i32).unwrap();

    rt.task().name("reader").schedules_reads(&h).run({
        let h = h.clone();
        move |ctx| {
            ctx.task().name("sneaky").modifies(&h).run(|_| Ok(()))?;
            Ok(())
        }
    })
    .unwrap();

    let Err(NagareError::Task(name, err)) = rt.run() else {
        panic!("expected the task to fail");
    };
    assert_eq!(name, "reader");
    assert!(matches!(
        err.downcast_ref::<UsageError>(),
        Some(UsageError::PermissionDenied {
            requested: Permission::Modify,
            held: Permission::Read,
            ..
        })
    ));
}

#[test]
fn failed_tasks_still_release_their_uses() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("failing"), 0i32).unwrap();
    let seen = Arc::new(Mutex::new(None));

    rt.task().name("fails").modifies(&h).run({
        let h = h.clone();
        move |ctx| {
            ctx.set(&h, 7)?;
            anyhow::bail!("gave up")
        }
    })
    .unwrap();

    rt.task().name("panics").reads(&h).run(|_| panic!("boom")).unwrap();

    rt.task().name("later").reads(&h).run({
        let h = h.clone();
        let seen = seen.clone();
        move |ctx| {
            *seen.lock().unwrap() = Some(*ctx.get(&h)?);
            Ok(())
        }
    })
    .unwrap();

    let err = rt.run().unwrap_err();
    assert!(matches!(&err, NagareError::Task(name, _) if name == "fails"));
    assert_eq!(*seen.lock().unwrap(), Some(7));
    assert_eq!(rt.pending(), 0);
}

#[test]
fn panics_are_reported_as_task_failures() {
    let mut rt = standalone();
    rt.task().name("explodes").run(|_| panic!("boom")).unwrap();

    let err = rt.run().unwrap_err();
    assert!(err.to_string().contains("Task panicked: boom"));
}

#[test]
fn holding_a_read_across_a_modify_stalls() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("held"), 1i32).unwrap();
    let pinned = rt.read_only(&h).unwrap();

    rt.task().name("bump").modifies(&h).run({
        let h = h.clone();
        move |ctx| {
            *ctx.get_mut(&h)? += 1;
            Ok(())
        }
    })
    .unwrap();

    let snapshot = rt.snapshot();
    let blocked = snapshot.blocked_consumers();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].tasks, vec![String::from("bump")]);

    let Err(NagareError::Stalled { pending, report }) = rt.wait(&h) else {
        panic!("expected a stall");
    };
    assert_eq!(pending, 1);
    assert!(report.contains("blocking 'bump'"), "{report}");

    rt.release(&pinned).unwrap();
    assert_eq!(rt.wait(&h).unwrap(), 2);
}

#[test]
fn passing_a_version_through_still_waits_for_its_readers() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("held"), 1i32).unwrap();
    let pinned = rt.read_only(&h).unwrap();

    rt.task().name("pass").schedules_modify(&h).run(|_| Ok(())).unwrap();
    rt.task().name("bump").modifies(&h).run({
        let h = h.clone();
        move |ctx| {
            *ctx.get_mut(&h)? += 1;
            Ok(())
        }
    })
    .unwrap();

    let Err(NagareError::Stalled { pending, report }) = rt.wait(&h) else {
        panic!("expected a stall");
    };
    assert_eq!(pending, 1);
    assert!(report.contains("still hold it, blocking version held@#1"), "{report}");

    let blocked = rt.snapshot().blocked_consumers();
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].version, "#0");
    assert_eq!(blocked[0].flows, vec![String::from("held@#1")]);

    rt.release(&pinned).unwrap();
    assert_eq!(rt.wait(&h).unwrap(), 2);
}

#[test]
fn publishing_what_a_fetch_feeds_is_a_cycle() {
    let mut rt = standalone();
    let fetched = rt
        .read_access::<f64>(make_key!("H"), FetchOpts::default().version("x"))
        .unwrap();
    let h = rt.initial_access_with(make_key!("H"), 1.0f64).unwrap();

    let looped = rt
        .task()
        .name("loop")
        .reads(&fetched)
        .modifies(&h)
        .run({
            let (fetched, h) = (fetched.clone(), h.clone());
            move |ctx| {
                let value = *ctx.get(&fetched)?;
                ctx.set(&h, value + 1.0)?;
                Ok(())
            }
        })
        .unwrap();
    rt.publish(&h, PublishOpts::default().version("x")).unwrap();

    let Err(NagareError::Stalled { report, .. }) = rt.wait(&h) else {
        panic!("expected a stall");
    };
    assert!(report.contains("dependency cycle"), "{report}");

    let snapshot = rt.snapshot();
    let cycle = snapshot.find_cycle().expect("publish and fetch close a cycle");
    assert!(cycle.contains(&GraphNode::Task(looped)));
    assert!(snapshot.flows.iter().any(|flow| !flow.fetches.is_empty()));
    assert!(snapshot.graph().edge_count() >= cycle.len());
    assert!(snapshot.render_mermaid().contains("-->"));
    assert!(snapshot.to_json().unwrap().contains("\"loop\""));
}

#[test]
fn handles_of_one_key_agree_on_the_type() {
    let mut rt = standalone();
    let _h = rt.initial_access_with(make_key!("typed"), 1.0f64).unwrap();

    let err = rt
        .read_access::<i32>(make_key!("typed"), FetchOpts::default())
        .unwrap_err();
    assert!(matches!(err, UsageError::TypeMismatch { expected: "f64", .. }));

    let same = rt.read_access::<f64>(make_key!("typed"), FetchOpts::default());
    assert!(same.is_ok());
    assert_eq!(
        rt.snapshot().flows.iter().filter(|flow| flow.type_name == "f64").count(),
        2
    );
}

#[test]
fn branches_follow_the_condition() {
    let mut rt = standalone();
    let small = rt.initial_access_with(make_key!("small"), 1i32).unwrap();
    let large = rt.initial_access_with(make_key!("large"), 9i32).unwrap();

    for h in [&small, &large] {
        rt.task()
            .name("clamp")
            .modifies(h)
            .run_if_else(
                {
                    let h = h.clone();
                    move |ctx| Ok(*ctx.get(&h)? > 5)
                },
                {
                    let h = h.clone();
                    move |ctx| ctx.set(&h, 5).map_err(Into::into)
                },
                {
                    let h = h.clone();
                    move |ctx| {
                        *ctx.get_mut(&h)? *= 10;
                        Ok(())
                    }
                },
            )
            .unwrap();
    }

    assert_eq!(rt.wait(&small).unwrap(), 10);
    assert_eq!(rt.wait(&large).unwrap(), 5);

    let diagnostics = rt.finalize().unwrap();
    let mut names: Vec<_> = diagnostics.names.values().cloned().collect();
    names.sort();
    assert_eq!(names, vec!["clamp", "clamp", "clamp/else", "clamp/then"]);
}

#[test]
fn skipped_branch_keeps_the_value_and_the_order() {
    let mut rt = threaded(2);
    let h = rt.initial_access_with(make_key!("kept"), 3i32).unwrap();
    let seen = Arc::new(Mutex::new(None));

    rt.task()
        .modifies(&h)
        .run_if(
            {
                let h = h.clone();
                move |ctx| Ok(*ctx.get(&h)? < 0)
            },
            {
                let h = h.clone();
                move |ctx| ctx.set(&h, 0).map_err(Into::into)
            },
        )
        .unwrap();

    rt.task().reads(&h).run({
        let (h, seen) = (h.clone(), seen.clone());
        move |ctx| {
            *seen.lock().unwrap() = Some(*ctx.get(&h)?);
            Ok(())
        }
    })
    .unwrap();

    rt.run().unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(3));
    assert_eq!(rt.current_version(&h).unwrap(), VersionTag::Auto(1));
}

#[test]
fn loops_run_until_the_condition_fails() {
    let mut rt = threaded(2);
    let h = rt.initial_access_with(make_key!("counter"), 0u32).unwrap();
    let trace = rt.initial_access_with(make_key!("trace"), Vec::<u32>::new()).unwrap();

    rt.task()
        .name("count")
        .modifies((&h, &trace))
        .run_while(
            {
                let h = h.clone();
                move |ctx| Ok(*ctx.get(&h)? < 5)
            },
            {
                let (h, trace) = (h.clone(), trace.clone());
                move |ctx| {
                    let value = *ctx.get(&h)?;
                    ctx.get_mut(&trace)?.push(value);
                    ctx.set(&h, value + 1)?;
                    Ok(())
                }
            },
        )
        .unwrap();

    assert_eq!(rt.wait(&h).unwrap(), 5);
    assert_eq!(rt.wait(&trace).unwrap(), vec![0, 1, 2, 3, 4]);

    let diagnostics = rt.finalize().unwrap();
    let bodies = diagnostics.names.values().filter(|name| *name == "count/do").count();
    assert_eq!(bodies, 5);
    assert_eq!(diagnostics.tasks_run(), 11);
}

#[test]
fn loops_that_never_start_leave_the_value_alone() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("idle"), 7i32).unwrap();

    rt.task()
        .modifies(&h)
        .run_while(|_| Ok(false), |_| anyhow::bail!("body must not run"))
        .unwrap();

    assert_eq!(rt.wait(&h).unwrap(), 7);
    assert_eq!(rt.finalize().unwrap().tasks_run(), 1);
}

#[test]
fn conditions_steer_the_enclosing_program() {
    let mut rt = threaded(2);
    let h = rt.initial_access_with(make_key!("steps"), 0i32).unwrap();
    let mut rounds = 0;

    while rt
        .condition(&h, {
            let h = h.clone();
            move |ctx| Ok(*ctx.get(&h)? < 3)
        })
        .unwrap()
    {
        rt.task().modifies(&h).run({
            let h = h.clone();
            move |ctx| {
                *ctx.get_mut(&h)? += 1;
                Ok(())
            }
        })
        .unwrap();
        rounds += 1;
    }

    assert_eq!(rounds, 3);
    assert_eq!(rt.wait(&h).unwrap(), 3);
}

#[test]
fn failing_conditions_are_task_failures() {
    let mut rt = standalone();
    let h = rt.initial_access::<i32>(make_key!("unset")).unwrap();

    let err = rt
        .condition(&h, {
            let h = h.clone();
            move |ctx| Ok(*ctx.get(&h)? > 0)
        })
        .unwrap_err();
    assert!(matches!(err, NagareError::Task(ref name, _) if name == "condition"), "{err}");
}

#[test]
fn handles_released_inside_a_task_still_hand_over_their_value() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("early"), 1i32).unwrap();

    rt.task().modifies(&h).run({
        let h = h.clone();
        move |ctx| {
            ctx.set(&h, 7)?;
            ctx.release(&h)?;
            Ok(())
        }
    })
    .unwrap();

    for i in 0..50u32 {
        let scratch = rt.initial_access_with(make_key!("scratch", i), i).unwrap();
        rt.release(&scratch).unwrap();
    }

    assert_eq!(rt.wait(&h).unwrap(), 7);
}

#[test]
fn fetch_without_publication_stalls() {
    let mut rt = standalone();
    let h = rt.read_access::<i32>(make_key!("missing"), FetchOpts::default()).unwrap();

    let Err(NagareError::Stalled { report, .. }) = rt.wait(&h) else {
        panic!("expected a stall");
    };
    assert!(report.contains("no matching publication"), "{report}");
}

#[test]
fn usage_errors_surface_at_the_call_site() {
    let mut rt = standalone();
    let h = rt.initial_access::<i32>(make_key!("k")).unwrap();

    assert_eq!(
        rt.initial_access::<i32>(make_key!("k")).unwrap_err(),
        UsageError::DuplicateKey(make_key!("k"))
    );
    assert!(matches!(rt.wait(&h), Err(NagareError::Usage(UsageError::Uninitialized(_)))));

    let mut other = standalone();
    let foreign = other.initial_access::<i32>(make_key!("foreign")).unwrap();
    assert!(matches!(
        rt.task().reads((&h, &foreign)).run(|_| Ok(())),
        Err(UsageError::NotCaptured(_))
    ));
    // the failed declaration left nothing behind
    assert_eq!(rt.pending(), 0);

    let fetched = rt.read_access::<i32>(make_key!("remote"), FetchOpts::default()).unwrap();
    assert!(matches!(
        rt.publish(&fetched, PublishOpts::default()),
        Err(UsageError::PermissionDenied { held: Permission::Read, .. })
    ));
    assert!(matches!(
        rt.task().modifies(&fetched).run(|_| Ok(())),
        Err(UsageError::PermissionDenied { .. })
    ));
}

#[test]
fn republishing_a_version_is_rejected() {
    let mut rt = standalone();
    let h = rt.initial_access_with(make_key!("twice"), 1i32).unwrap();

    rt.publish(&h, PublishOpts::default().version("final")).unwrap();
    assert!(matches!(
        rt.publish(&h, PublishOpts::default().version("final")),
        Err(UsageError::DuplicatePublication { .. })
    ));

    let diagnostics = rt.finalize().unwrap();
    assert_eq!(diagnostics.leaked.len(), 1);
    assert_eq!(diagnostics.leaked[0].remaining, 1);
}

#[test]
fn versions_advance_with_each_modify() {
    let mut rt = standalone();
    let h = rt.initial_access::<i32>(make_key!("v")).unwrap();
    assert_eq!(rt.current_version(&h).unwrap(), VersionTag::Auto(0));

    for expected in 1..=3u64 {
        rt.task().modifies(&h).run(|_| Ok(())).unwrap();
        assert_eq!(rt.current_version(&h).unwrap(), VersionTag::Auto(expected));
    }

    rt.task().reads(&h).run(|_| Ok(())).unwrap();
    assert_eq!(rt.current_version(&h).unwrap(), VersionTag::Auto(3));
}

#[test]
fn failing_rank_is_reported() {
    let config = Config::default().stall_timeout(Duration::from_millis(200));
    let err = World::new(2, config)
        .run(|rt| {
            if rt.rank() == 1 {
                anyhow::bail!("rank one gives up");
            }
            let h = rt.read_access::<i32>(make_key!("never"), FetchOpts::default())?;
            rt.wait(&h)?;
            Ok(())
        })
        .unwrap_err();

    assert!(matches!(err, NagareError::Rank(..)));
}
