use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use levmar::{ConcurrencyPolicy, Levmar, LevmarError, Problem};
use parking_lot::Mutex;

const XS: [f64; 4] = [0.0, 1.0, 2.0, 3.0];
const YS: [f64; 4] = [1.0, 3.0, 5.0, 7.0];

fn line(p: &[f64], hx: &mut [f64]) {
    for (hx, x) in hx.iter_mut().zip(XS) {
        *hx = p[0] + p[1] * x;
    }
}

fn fit_line(levmar: &Levmar, mut on_call: impl FnMut()) -> Result<[f64; 2], LevmarError> {
    let mut p = [0.0, 0.0];
    let mut problem = Problem::new(&mut p, 2, 4).measurements(&YS);
    levmar.solve_dif(&mut problem, |p, hx, _m, _n, _ctx| {
        on_call();
        line(p, hx);
    })?;
    Ok(p)
}

#[test]
fn busy_instance_rejects_second_thread() {
    let levmar = Levmar::new();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let levmar = &levmar;

    thread::scope(|scope| {
        let running = scope.spawn(move || {
            let mut first = true;
            fit_line(levmar, || {
                if first {
                    first = false;
                    entered_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                }
            })
        });

        entered_rx.recv().unwrap();
        let rejected = scope.spawn(|| fit_line(levmar, || {})).join().unwrap();
        resume_tx.send(()).unwrap();

        assert_eq!(rejected.unwrap_err(), LevmarError::ReentrancyNotSupported);
        let fitted = running.join().unwrap().unwrap();
        assert!((fitted[0] - 1.0).abs() < 1e-6 && (fitted[1] - 2.0).abs() < 1e-6);
    });
}

#[test]
fn blocking_policy_serializes_solves() {
    let levmar = Levmar::new().concurrency(ConcurrencyPolicy::Block);
    let events = Mutex::new(Vec::new());
    let (entered_tx, entered_rx) = mpsc::channel();

    let (levmar, events) = (&levmar, &events);

    thread::scope(|scope| {
        let first = scope.spawn(move || {
            let mut announced = false;
            fit_line(levmar, || {
                if !announced {
                    announced = true;
                    entered_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                }
                events.lock().push('a');
            })
        });

        entered_rx.recv().unwrap();
        let second = scope.spawn(|| fit_line(levmar, || events.lock().push('b')));

        first.join().unwrap().unwrap();
        second.join().unwrap().unwrap();
    });

    let events = events.lock();
    let first_b = events.iter().position(|&e| e == 'b').unwrap();
    assert!(first_b > 0);
    assert!(
        events[first_b..].iter().all(|&e| e == 'b'),
        "solves interleaved: {events:?}"
    );
}

#[test]
fn separate_instances_run_in_parallel() {
    let instances: Vec<Levmar> = (0..4).map(|_| Levmar::new()).collect();

    thread::scope(|scope| {
        let handles: Vec<_> = instances
            .iter()
            .map(|levmar| scope.spawn(move || fit_line(levmar, || {})))
            .collect();

        for handle in handles {
            let fitted = handle.join().unwrap().unwrap();
            assert!((fitted[0] - 1.0).abs() < 1e-6 && (fitted[1] - 2.0).abs() < 1e-6);
        }
    });
}

#[test]
fn rejected_thread_leaves_instance_usable() {
    let levmar = Levmar::new();
    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();

    let levmar = &levmar;

    thread::scope(|scope| {
        let running = scope.spawn(move || {
            let mut first = true;
            fit_line(levmar, || {
                if first {
                    first = false;
                    entered_tx.send(()).unwrap();
                    resume_rx.recv().unwrap();
                }
            })
        });

        entered_rx.recv().unwrap();
        assert!(scope.spawn(|| fit_line(levmar, || {})).join().unwrap().is_err());
        resume_tx.send(()).unwrap();
        running.join().unwrap().unwrap();
    });

    assert!(fit_line(levmar, || {}).is_ok());
}
