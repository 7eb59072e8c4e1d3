//! Task pool behavior under concurrent allocation and handle churn.

use std::sync::atomic::{AtomicUsize, Ordering};

use strand_executor::task::{Task, TaskHandle, TaskPool, destroy_task};

static EXECUTED: AtomicUsize = AtomicUsize::new(0);

struct UnitTask;

impl Task for UnitTask {
    fn run(&mut self) {
        EXECUTED.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn concurrent_allocations_get_distinct_live_generations() {
    const WORKERS: usize = 4;
    const PER_WORKER: usize = 8;

    let pool: TaskPool<UnitTask, 64> = TaskPool::new();

    let handles: Vec<TaskHandle> = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..WORKERS)
            .map(|_| {
                scope.spawn(|| {
                    (0..PER_WORKER)
                        .map(|_| pool.try_alloc(UnitTask))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        workers
            .into_iter()
            .flat_map(|worker| worker.join().expect("worker panicked"))
            .collect()
    });

    assert_eq!(handles.len(), WORKERS * PER_WORKER);
    assert!(handles.iter().all(TaskHandle::is_valid));

    // Every live handle resolves to a fully published descriptor, and no
    // two live tasks share payload storage.
    let mut payloads: Vec<usize> = handles
        .iter()
        .map(|handle| {
            let desc = handle.desc();
            assert!(desc.entry.is_some());
            assert!(desc.destroy.is_some());
            desc.user_data as usize
        })
        .collect();
    payloads.sort_unstable();
    payloads.dedup();
    assert_eq!(payloads.len(), handles.len());

    for handle in &handles {
        assert!(destroy_task(handle));
    }
    assert!(handles.iter().all(|handle| !handle.is_valid()));

    // Every slot is free again; a fresh burst succeeds.
    let refill: Vec<_> = (0..64).map(|_| pool.try_alloc(UnitTask)).collect();
    assert!(refill.iter().all(TaskHandle::is_valid));
    for handle in &refill {
        assert!(destroy_task(handle));
    }
}

#[test]
fn entries_run_through_published_descriptors() {
    EXECUTED.store(0, Ordering::SeqCst);

    let pool: TaskPool<UnitTask, 4> = TaskPool::new();
    let handle = pool.alloc(UnitTask);

    let desc = handle.desc();
    let entry = desc.entry.expect("published entry");
    unsafe { entry(desc.user_data) };
    unsafe { entry(desc.user_data) };
    assert_eq!(EXECUTED.load(Ordering::SeqCst), 2);

    assert!(destroy_task(&handle));
    assert!(!handle.is_valid());
}
