// benches/transport_thread.rs

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rtransport::websocket::SendBuffer;
use rtransport::{SchedulingMode, ThreadPacing, ThreadedWork, TransportThread};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// --- Benchmarking Constants ---
const NUM_ITEMS: usize = 1000;
const PASSES_PER_ITEM: u32 = 3;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Completes after a fixed number of passes.
struct Countdown {
  left: AtomicU32,
}

impl Countdown {
  fn new(passes: u32) -> Arc<Self> {
    Arc::new(Self {
      left: AtomicU32::new(passes),
    })
  }
}

impl ThreadedWork for Countdown {
  fn start_on_thread(&self) -> bool {
    true
  }

  fn tick_on_thread(&self, _elapsed: Duration) {
    let _ = self
      .left
      .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
  }

  fn is_complete_on_thread(&self) -> bool {
    self.left.load(Ordering::Acquire) == 0
  }

  fn finish_on_thread(&self) {}

  fn describe(&self) -> String {
    "countdown".to_string()
  }
}

fn bench_pacing() -> ThreadPacing {
  ThreadPacing {
    active_frame_time: Duration::ZERO,
    active_min_sleep: Duration::from_micros(50),
    idle_frame_time: Duration::from_millis(1),
    idle_min_sleep: Duration::from_micros(50),
  }
}

/// Submits `NUM_ITEMS` items and waits until all of them completed.
fn drain_batch(thread: &TransportThread<Countdown>, mode: SchedulingMode) -> Duration {
  let start = Instant::now();
  for _ in 0..NUM_ITEMS {
    thread.submit(Countdown::new(PASSES_PER_ITEM));
  }
  let mut completed = 0;
  while completed < NUM_ITEMS {
    if mode == SchedulingMode::Cooperative {
      thread.tick();
    } else {
      std::thread::yield_now();
    }
    completed += black_box(thread.take_completed()).len();
    if start.elapsed() > DRAIN_TIMEOUT {
      panic!("Benchmark batch did not drain ({} of {} completed)", completed, NUM_ITEMS);
    }
  }
  start.elapsed()
}

fn submit_to_completion(c: &mut Criterion) {
  let mut group = c.benchmark_group("TransportThread_SubmitToCompletion");
  group.throughput(Throughput::Elements(NUM_ITEMS as u64));

  for mode in [SchedulingMode::Cooperative, SchedulingMode::Threaded] {
    let bench_id = BenchmarkId::from_parameter(format!("{:?}", mode));
    group.bench_with_input(bench_id, &mode, |b, &mode| {
      let thread: TransportThread<Countdown> = TransportThread::new("bench-transport", mode, bench_pacing());
      thread.start().expect("Failed to start transport thread");
      b.iter_custom(|iters| (0..iters).map(|_| drain_batch(&thread, mode)).sum());
      thread.stop();
    });
  }
  group.finish();
}

fn frame_outbound(c: &mut Criterion) {
  let mut group = c.benchmark_group("SendBuffer_Frame");

  for size in [16, 256, 4096, 65536].iter() {
    group.throughput(Throughput::Bytes(*size as u64));
    let payload = vec![0x5au8; *size];
    group.bench_with_input(BenchmarkId::from_parameter(format!("{}B", size)), &payload, |b, payload| {
      b.iter(|| {
        let buffer = SendBuffer::new(black_box(payload), false, [1, 2, 3, 4]);
        black_box(buffer.frame_len())
      });
    });
  }
  group.finish();
}

criterion_group!(benches, submit_to_completion, frame_outbound);
criterion_main!(benches);
