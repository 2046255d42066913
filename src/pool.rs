//!
//! Bounded parallel dispatch with ordered output.
//!
//! Workers pull items through a mutex-serialised source callback,
//! process them into per-item buffers, and hand the buffers to a
//! mutex-serialised sink that emits them strictly in acquisition
//! order through a bounded reordering window. The first processing
//! failure raises the shutdown flag; outstanding items drain and the
//! failure surfaces after the pool stops.
//!
use std::collections::BTreeMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

pub struct WorkerPool {
    num_threads: usize,
    chunk_size: usize,
}

struct Source<G> {
    get: G,
    next_seq: u64,
    done: bool,
}

struct Sink<O, C, R> {
    output: C,
    progress: R,
    next_out: u64,
    /// completed buffers not yet flushable; None marks a failed item
    pending: BTreeMap<u64, Option<O>>,
    items_done: usize,
    last_report: Instant,
}

impl WorkerPool {
    pub fn new(num_threads: usize) -> WorkerPool {
        WorkerPool {
            num_threads: num_threads.max(1),
            chunk_size: 10,
        }
    }
    pub fn chunk_size(mut self, chunk_size: usize) -> WorkerPool {
        self.chunk_size = chunk_size.max(1);
        self
    }

    ///
    /// Drive the pool until `get_item` runs dry or a failure raises the
    /// shutdown flag. `get_item` and `output_chunk` each run on one
    /// thread at a time; `process_item` runs on all workers.
    ///
    pub fn run<I, O, E, G, P, C, R>(
        &self,
        get_item: G,
        process_item: P,
        output_chunk: C,
        progress: R,
    ) -> Result<(), E>
    where
        I: Send,
        O: Default + Send,
        E: Send,
        G: FnMut() -> Option<I> + Send,
        P: Fn(I, &mut O) -> Result<(), E> + Sync,
        C: FnMut(O) + Send,
        R: FnMut(usize, u64) + Send,
    {
        let start = Instant::now();
        let source = Mutex::new(Source {
            get: get_item,
            next_seq: 0,
            done: false,
        });
        let sink = Mutex::new(Sink {
            output: output_chunk,
            progress,
            next_out: 0,
            pending: BTreeMap::new(),
            items_done: 0,
            last_report: Instant::now(),
        });
        let window_free = Condvar::new();
        let first_error: Mutex<Option<E>> = Mutex::new(None);

        std::thread::scope(|scope| {
            for _ in 0..self.num_threads {
                scope.spawn(|| loop {
                    let (seq, item) = {
                        let mut src = source.lock().unwrap();
                        if src.done {
                            break;
                        }
                        match (src.get)() {
                            Some(item) => {
                                let seq = src.next_seq;
                                src.next_seq += 1;
                                (seq, item)
                            }
                            None => {
                                src.done = true;
                                break;
                            }
                        }
                    };

                    let mut buf = O::default();
                    let failed = match process_item(item, &mut buf) {
                        Ok(()) => false,
                        Err(e) => {
                            let mut err = first_error.lock().unwrap();
                            if err.is_none() {
                                *err = Some(e);
                            }
                            source.lock().unwrap().done = true;
                            true
                        }
                    };

                    let mut snk = sink.lock().unwrap();
                    while seq >= snk.next_out + self.chunk_size as u64 {
                        snk = window_free.wait(snk).unwrap();
                    }
                    snk.pending.insert(seq, (!failed).then_some(buf));
                    snk.items_done += 1;
                    while let Some(entry) = {
                        let next_out = snk.next_out;
                        snk.pending.remove(&next_out)
                    } {
                        if let Some(out) = entry {
                            (snk.output)(out);
                        }
                        snk.next_out += 1;
                    }
                    if snk.last_report.elapsed() >= REPORT_INTERVAL {
                        snk.last_report = Instant::now();
                        let items_done = snk.items_done;
                        (snk.progress)(items_done, start.elapsed().as_secs());
                    }
                    drop(snk);
                    window_free.notify_all();
                });
            }
        });

        let mut snk = sink.into_inner().unwrap();
        let items_done = snk.items_done;
        (snk.progress)(items_done, start.elapsed().as_secs());
        match first_error.into_inner().unwrap() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_numbers(num_threads: usize, n: usize) -> Vec<usize> {
        let mut next = 0;
        let mut seen = Vec::new();
        let pool = WorkerPool::new(num_threads);
        let result: Result<(), ()> = pool.run(
            || {
                if next < n {
                    next += 1;
                    Some(next - 1)
                } else {
                    None
                }
            },
            |i: usize, buf: &mut Vec<usize>| {
                // uneven per-item latency to force reordering pressure
                std::thread::sleep(Duration::from_millis((i * 7 % 5) as u64));
                buf.push(i);
                Ok(())
            },
            |buf| seen.extend(buf),
            |_, _| {},
        );
        assert!(result.is_ok());
        seen
    }

    #[test]
    fn output_is_fifo_single_thread() {
        assert_eq!(run_numbers(1, 30), (0..30).collect::<Vec<_>>());
    }

    #[test]
    fn output_is_fifo_multi_thread() {
        assert_eq!(run_numbers(4, 50), (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn tight_window_still_completes() {
        let mut next = 0;
        let mut seen = Vec::new();
        let pool = WorkerPool::new(4).chunk_size(2);
        let result: Result<(), ()> = pool.run(
            || {
                if next < 40 {
                    next += 1;
                    Some(next - 1)
                } else {
                    None
                }
            },
            |i: usize, buf: &mut Vec<usize>| {
                if i == 0 {
                    std::thread::sleep(Duration::from_millis(20));
                }
                buf.push(i);
                Ok(())
            },
            |buf| seen.extend(buf),
            |_, _| {},
        );
        assert!(result.is_ok());
        assert_eq!(seen, (0..40).collect::<Vec<_>>());
    }

    #[test]
    fn first_failure_surfaces_after_drain() {
        let mut next = 0;
        let mut seen: Vec<usize> = Vec::new();
        let pool = WorkerPool::new(4);
        let result = pool.run(
            || {
                if next < 100 {
                    next += 1;
                    Some(next - 1)
                } else {
                    None
                }
            },
            |i: usize, buf: &mut Vec<usize>| {
                if i == 13 {
                    return Err("boom");
                }
                buf.push(i);
                Ok(())
            },
            |buf| seen.extend(buf),
            |_, _| {},
        );
        assert_eq!(result, Err("boom"));
        // emitted outputs stay in order, the failed item is absent, and
        // the shutdown flag stops the source well before the end
        assert!(seen.windows(2).all(|w| w[0] < w[1]));
        assert!(!seen.contains(&13));
        assert!(seen.len() < 100);
    }

    #[test]
    fn progress_reports_final_count() {
        let mut next = 0;
        let mut last = (0, 0);
        let pool = WorkerPool::new(2);
        let result: Result<(), ()> = pool.run(
            || {
                if next < 25 {
                    next += 1;
                    Some(next - 1)
                } else {
                    None
                }
            },
            |_: usize, _: &mut ()| Ok(()),
            |_| {},
            |items, secs| last = (items, secs),
        );
        assert!(result.is_ok());
        assert_eq!(last.0, 25);
    }
}
