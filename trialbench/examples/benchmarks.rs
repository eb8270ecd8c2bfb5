//! Example benchmarks
//!
//! Run with: cargo run --release --example benchmarks -- --forks 1
//! List with: cargo run --example benchmarks -- list

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use trialbench::prelude::*;

/// Sum of a vector whose contents are refreshed before every iteration
struct VecSum {
    len: usize,
}

impl BenchmarkTask for VecSum {
    const ID: &'static str = "vec_sum";
    type Shared = ();
    type Group = ();
    type Thread = Vec<u64>;

    fn params() -> Vec<ParamSpec> {
        vec![ParamSpec::new("len", ["64", "4096"])]
    }

    fn create(bindings: &Bindings) -> Result<Self, TaskError> {
        Ok(Self {
            len: bindings.parse("len")?,
        })
    }

    fn shared_state(&self) -> Result<(), TaskError> {
        Ok(())
    }

    fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> {
        Ok(())
    }

    fn thread_state(&self, thread: &ThreadInfo) -> Result<Vec<u64>, TaskError> {
        Ok(vec![thread.index as u64; self.len])
    }

    fn fixtures(&self) -> Fixtures {
        Fixtures::ITERATION_THREAD
    }

    fn setup(&self, _level: Level, state: FixtureState<'_, Self>) -> Result<(), TaskError> {
        if let FixtureState::Thread(values, _) = state {
            for (i, v) in values.iter_mut().enumerate() {
                *v = (i as u64).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            }
        }
        Ok(())
    }

    fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
        let total = state.thread.iter().fold(0u64, |acc, v| acc.wrapping_add(*v));
        state.consume(total);
        Ok(Outcome::Timed)
    }
}

/// Lock-protected queue with asymmetric producer and consumer groups
struct Queue;

struct QueueState {
    items: Mutex<VecDeque<u64>>,
    next: AtomicU64,
}

impl BenchmarkTask for Queue {
    const ID: &'static str = "queue";
    const MODE: Mode = Mode::Throughput;
    type Shared = QueueState;
    type Group = ();
    type Thread = ();

    fn groups() -> Vec<GroupSpec> {
        vec![GroupSpec::new("producer", 1), GroupSpec::new("consumer", 1)]
    }

    fn create(_: &Bindings) -> Result<Self, TaskError> {
        Ok(Queue)
    }

    fn shared_state(&self) -> Result<QueueState, TaskError> {
        Ok(QueueState {
            items: Mutex::new(VecDeque::with_capacity(1024)),
            next: AtomicU64::new(0),
        })
    }

    fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> {
        Ok(())
    }

    fn thread_state(&self, _: &ThreadInfo) -> Result<(), TaskError> {
        Ok(())
    }

    fn fixtures(&self) -> Fixtures {
        Fixtures::ITERATION_BENCHMARK
    }

    fn teardown(&self, _level: Level, state: FixtureState<'_, Self>) -> Result<(), TaskError> {
        if let FixtureState::Benchmark(queue) = state {
            queue
                .items
                .lock()
                .map_err(|_| TaskError::msg("queue lock poisoned"))?
                .clear();
        }
        Ok(())
    }

    fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
        let shared = state.shared;
        let mut items = shared
            .items
            .lock()
            .map_err(|_| TaskError::msg("queue lock poisoned"))?;
        if state.info().group_name == "producer" {
            items.push_back(shared.next.fetch_add(1, Ordering::Relaxed));
        } else {
            let taken = items.pop_front();
            drop(items);
            if taken.is_none() {
                state.record_with("queue.empty", 1.0, "#", AggregationPolicy::Sum);
            }
            state.consume(taken);
        }
        Ok(Outcome::Timed)
    }
}

/// One cold allocation of a large buffer
struct ColdAlloc;

impl BenchmarkTask for ColdAlloc {
    const ID: &'static str = "cold_alloc";
    const MODE: Mode = Mode::SingleShot;
    type Shared = ();
    type Group = ();
    type Thread = ();

    fn create(_: &Bindings) -> Result<Self, TaskError> {
        Ok(ColdAlloc)
    }

    fn shared_state(&self) -> Result<(), TaskError> {
        Ok(())
    }

    fn group_state(&self, _: &GroupInfo) -> Result<(), TaskError> {
        Ok(())
    }

    fn thread_state(&self, _: &ThreadInfo) -> Result<(), TaskError> {
        Ok(())
    }

    fn invoke(&self, state: &mut State<'_, Self>) -> Result<Outcome, TaskError> {
        let buffer = vec![1u8; 16 << 20];
        state.consume(buffer);
        Ok(Outcome::Timed)
    }
}

trialbench::register!(VecSum, Queue, ColdAlloc);

fn main() -> anyhow::Result<()> {
    trialbench::run()
}
