use criterion::{Criterion, black_box, criterion_group, criterion_main};
use strand_executor::task::{Task, TaskPool, destroy_task};

struct TickTask {
    value: u64,
}

impl Task for TickTask {
    fn run(&mut self) {
        self.value = self.value.wrapping_add(1);
    }
}

fn bench_alloc_destroy(c: &mut Criterion) {
    let pool: TaskPool<TickTask, 1024> = TaskPool::new();
    c.bench_function("task_pool_alloc_destroy", |b| {
        b.iter(|| {
            let handle = pool.alloc(TickTask { value: 0 });
            black_box(handle.is_valid());
            destroy_task(&handle);
        });
    });
}

fn bench_handle_validation(c: &mut Criterion) {
    let pool: TaskPool<TickTask, 1024> = TaskPool::new();
    let handle = pool.alloc(TickTask { value: 0 });
    c.bench_function("task_handle_is_valid", |b| {
        b.iter(|| black_box(handle.is_valid()));
    });
    destroy_task(&handle);
}

criterion_group!(benches, bench_alloc_destroy, bench_handle_validation);
criterion_main!(benches);
