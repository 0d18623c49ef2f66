//! Bounded worker pool for extraction and embedding.
//!
//! Scoped threads pull work from a bounded `crossbeam-channel` queue that a
//! feeder thread fills; results come back tagged with their input position.

use super::CancelFlag;
use crossbeam_channel::bounded;

/// Apply `work` to every item on `workers` threads.
///
/// The output has one slot per input, in input order. A slot is `None` when
/// the flag was cancelled before that item was picked up.
pub fn run_parallel<T, R, F>(items: Vec<T>, workers: usize, cancel: &CancelFlag, work: F) -> Vec<Option<R>>
where
    T: Send,
    R: Send,
    F: Fn(T) -> R + Sync,
{
    let total = items.len();
    let mut out: Vec<Option<R>> = (0..total).map(|_| None).collect();
    if total == 0 {
        return out;
    }
    let workers = workers.clamp(1, total);
    let (task_tx, task_rx) = bounded::<(usize, T)>(workers * 2);
    let (result_tx, result_rx) = bounded::<(usize, R)>(workers * 2);

    std::thread::scope(|scope| {
        scope.spawn(move || {
            for task in items.into_iter().enumerate() {
                if task_tx.send(task).is_err() {
                    break;
                }
            }
        });

        for _ in 0..workers {
            let rx = task_rx.clone();
            let tx = result_tx.clone();
            let work = &work;
            scope.spawn(move || {
                for (at, item) in rx.iter() {
                    if cancel.is_cancelled() {
                        continue;
                    }
                    if tx.send((at, work(item))).is_err() {
                        break;
                    }
                }
            });
        }
        drop(task_rx);
        drop(result_tx);

        for (at, result) in result_rx.iter() {
            out[at] = Some(result);
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keeps_input_order() {
        let flag = CancelFlag::new();
        let out = run_parallel((0..100).collect(), 4, &flag, |n: u64| n * n);
        assert_eq!(out.len(), 100);
        for (i, r) in out.into_iter().enumerate() {
            assert_eq!(r, Some((i * i) as u64));
        }
    }

    #[test]
    fn test_cancelled_items_are_skipped() {
        let flag = CancelFlag::new();
        flag.cancel();
        let out = run_parallel(vec![1, 2, 3], 2, &flag, |n: i32| n);
        assert!(out.iter().all(Option::is_none));
    }

    #[test]
    fn test_empty_input() {
        let out: Vec<Option<i32>> = run_parallel(Vec::<i32>::new(), 3, &CancelFlag::new(), |n| n);
        assert!(out.is_empty());
    }
}
