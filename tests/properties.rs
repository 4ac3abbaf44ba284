use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use nagare::{
    Config, FetchOpts, PublicationStatus, PublishOpts, Runtime, TaskState, UsageError,
    VersionTag, Workers, make_key,
};
use proptest::collection::vec;
use proptest::prelude::*;

#[derive(Debug, Clone)]
enum Op {
    Read,
    Add(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Read), (-100i64..100).prop_map(Op::Add)]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Auto versions count the modify uses of a handle, reads leave them alone.
    #[test]
    fn versions_increase_by_one_per_modify(ops in vec(op(), 0..40)) {
        let mut rt = Runtime::new(Config::default()).unwrap();
        let h = rt.initial_access_with(make_key!("h"), 0i64).unwrap();
        let mut modifies = 0u64;

        prop_assert_eq!(rt.current_version(&h).unwrap(), VersionTag::Auto(0));
        for op in ops {
            match op {
                Op::Read => {
                    rt.task().reads(&h).run(|_| Ok(())).unwrap();
                }
                Op::Add(_) => {
                    rt.task().modifies(&h).run(|_| Ok(())).unwrap();
                    modifies += 1;
                }
            }
            prop_assert_eq!(rt.current_version(&h).unwrap(), VersionTag::Auto(modifies));
        }
    }

    /// Every read observes exactly the writes declared before it.
    #[test]
    fn reads_observe_program_order(ops in vec(op(), 1..40), threads in 1usize..4) {
        let mut rt = Runtime::new(Config::default().workers(Workers::Threads(threads))).unwrap();
        let h = rt.initial_access_with(make_key!("h"), 0i64).unwrap();
        let seen = Arc::new(Mutex::new(BTreeMap::new()));

        let mut expected = BTreeMap::new();
        let mut total = 0i64;

        for (index, op) in ops.into_iter().enumerate() {
            match op {
                Op::Read => {
                    expected.insert(index, total);
                    rt.task().reads(&h).run({
                        let h = h.clone();
                        let seen = seen.clone();
                        move |ctx| {
                            let value = *ctx.get(&h)?;
                            seen.lock().unwrap().insert(index, value);
                            Ok(())
                        }
                    }).unwrap();
                }
                Op::Add(delta) => {
                    total += delta;
                    rt.task().modifies(&h).run({
                        let h = h.clone();
                        move |ctx| {
                            *ctx.get_mut(&h)? += delta;
                            Ok(())
                        }
                    }).unwrap();
                }
            }
        }

        rt.run().unwrap();
        prop_assert_eq!(&*seen.lock().unwrap(), &expected);
        prop_assert_eq!(rt.wait(&h).unwrap(), total);
    }

    /// A task waiting on several inputs stays pending until the last of them
    /// arrives, whatever order they arrive in.
    #[test]
    fn no_task_is_ready_before_all_inputs(
        order in (1usize..8).prop_flat_map(|m| Just((0..m).collect::<Vec<_>>()).prop_shuffle())
    ) {
        let m = order.len();
        let mut rt = Runtime::new(Config::default()).unwrap();

        let inputs = (0..m)
            .map(|j| rt.read_access::<usize>(make_key!("in", j), FetchOpts::default()))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();

        let sum = Arc::new(Mutex::new(None));
        rt.task().name("gather").reads(&inputs).run({
            let inputs = inputs.clone();
            let sum = sum.clone();
            move |ctx| {
                let mut total = 0;
                for input in &inputs {
                    total += *ctx.get(input)?;
                }
                *sum.lock().unwrap() = Some(total);
                Ok(())
            }
        }).unwrap();

        for (published, j) in order.iter().enumerate() {
            let task = rt.snapshot().tasks.remove(0);
            prop_assert_eq!(task.state, TaskState::Pending);
            prop_assert_eq!(task.outstanding, m - published);

            let source = rt.initial_access_with(make_key!("in", *j), *j).unwrap();
            rt.publish(&source, PublishOpts::default()).unwrap();
        }

        let task = rt.snapshot().tasks.remove(0);
        prop_assert_eq!(task.state, TaskState::Ready);

        rt.run().unwrap();
        prop_assert_eq!(*sum.lock().unwrap(), Some(m * (m - 1) / 2));
    }

    /// Readers of one ready version are all ready at once.
    #[test]
    fn readers_never_wait_on_each_other(n in 1usize..16) {
        let mut rt = Runtime::new(Config::default()).unwrap();
        let h = rt.initial_access_with(make_key!("h"), 1u8).unwrap();

        for _ in 0..n {
            rt.task().reads(&h).run(|_| Ok(())).unwrap();
        }

        let snapshot = rt.snapshot();
        prop_assert_eq!(snapshot.tasks.len(), n);
        prop_assert!(snapshot.tasks.iter().all(|task| task.state == TaskState::Ready));
    }

    /// A publication serves exactly the number of fetches it declares.
    #[test]
    fn publications_count_their_readers(n in 1usize..8, early in 0usize..8) {
        let early = early.min(n);
        let mut rt = Runtime::new(Config::default()).unwrap();
        let key = make_key!("p");
        let tag = VersionTag::Auto(7);

        let mut fetched = Vec::new();
        for _ in 0..early {
            fetched.push(rt.read_access::<u32>(key.clone(), FetchOpts::default().version(7u64)).unwrap());
        }

        let h = rt.initial_access_with(key.clone(), 42u32).unwrap();
        rt.publish(&h, PublishOpts::default().version(7u64).n_readers(n)).unwrap();

        for i in early..n {
            prop_assert_eq!(
                rt.coordinator().status(&key, &tag),
                PublicationStatus::Open { remaining: n - i }
            );
            fetched.push(rt.read_access::<u32>(key.clone(), FetchOpts::default().version(7u64)).unwrap());
        }

        prop_assert_eq!(rt.coordinator().status(&key, &tag), PublicationStatus::Exhausted);
        let extra = rt.read_access::<u32>(key.clone(), FetchOpts::default().version(7u64));
        let is_over_subscribed = matches!(extra, Err(UsageError::OverSubscribed { .. }));
        prop_assert!(is_over_subscribed);

        for handle in &fetched {
            prop_assert_eq!(rt.wait(handle).unwrap(), 42);
        }
        prop_assert!(rt.finalize().unwrap().leaked.is_empty());
    }
}
