use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

use frankenpthread_core::{Deadline, Mutex, MutexAttr, MutexKind, PthreadError, Validity};

#[test]
fn twenty_threads_read_sleep_write_verify() {
    const THREADS: u64 = 20;
    const ROUNDS: u64 = 25;

    let m = Arc::new(Mutex::init(MutexKind::ErrorCheck).unwrap());
    let shared = Arc::new(AtomicU64::new(0));
    let workers: Vec<_> = (0..THREADS)
        .map(|i| {
            let (m, shared) = (Arc::clone(&m), Arc::clone(&shared));
            std::thread::spawn(move || {
                for round in 0..ROUNDS {
                    m.lock().unwrap();
                    let seen = shared.load(Ordering::Relaxed);
                    if (i + round) % 5 == 0 {
                        std::thread::sleep(Duration::from_micros(200));
                    } else {
                        std::thread::yield_now();
                    }
                    shared.store(seen + 1, Ordering::Relaxed);
                    assert_eq!(shared.load(Ordering::Relaxed), seen + 1);
                    m.unlock().unwrap();
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }
    assert_eq!(shared.load(Ordering::Relaxed), THREADS * ROUNDS);
    m.destroy().unwrap();
}

#[test]
fn recursive_needs_k_unlocks() {
    const K: usize = 7;
    let m = Arc::new(Mutex::init(MutexKind::Recursive).unwrap());
    for _ in 0..K {
        m.lock().unwrap();
    }
    for _ in 0..K - 1 {
        m.unlock().unwrap();
    }
    let m2 = Arc::clone(&m);
    let probe = std::thread::spawn(move || m2.trylock()).join().unwrap();
    assert_eq!(probe, Err(PthreadError::Busy));

    m.unlock().unwrap();
    let m2 = Arc::clone(&m);
    let probe = std::thread::spawn(move || {
        let r = m2.trylock();
        m2.unlock().unwrap();
        r
    })
    .join()
    .unwrap();
    assert_eq!(probe, Ok(()));
}

#[test]
fn normal_trylock_sees_holder_then_succeeds() {
    let m = Arc::new(Mutex::init(MutexKind::Normal).unwrap());
    let (locked_tx, locked_rx) = mpsc::channel();
    let (tried_tx, tried_rx) = mpsc::channel::<()>();
    let m_a = Arc::clone(&m);
    let a = std::thread::spawn(move || {
        m_a.lock().unwrap();
        locked_tx.send(()).unwrap();
        tried_rx.recv().unwrap();
        m_a.unlock().unwrap();
    });
    locked_rx.recv().unwrap();
    assert_eq!(m.trylock(), Err(PthreadError::Busy));
    tried_tx.send(()).unwrap();
    a.join().unwrap();
    assert_eq!(m.trylock(), Ok(()));
    m.unlock().unwrap();
}

#[test]
fn destroy_while_busy_keeps_handle_usable() {
    let m = Arc::new(Mutex::init(MutexKind::ErrorCheck).unwrap());
    m.lock().unwrap();
    let before = m.handle();

    let m2 = Arc::clone(&m);
    let contender = std::thread::spawn(move || {
        m2.lock().unwrap();
        m2.unlock().unwrap();
    });
    let give_up = std::time::Instant::now() + Duration::from_secs(10);
    while m.busy_count() != Some(1) {
        assert!(std::time::Instant::now() < give_up);
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(m.destroy(), Err(PthreadError::Busy));
    assert_eq!(m.handle(), before);
    assert_eq!(m.validity(), Validity::Live);

    m.unlock().unwrap();
    contender.join().unwrap();
    m.destroy().unwrap();
    assert_eq!(m.validity(), Validity::Dead);
}

#[test]
fn destroyed_handle_rejects_everything_and_reinit_gets_a_fresh_word() {
    let m = Mutex::init(MutexKind::Normal).unwrap();
    let old = m.handle();
    m.destroy().unwrap();
    assert_eq!(m.lock(), Err(PthreadError::InvalidHandle));
    assert_eq!(m.trylock(), Err(PthreadError::InvalidHandle));
    assert_eq!(
        m.timedlock(Deadline::after(Duration::from_millis(1))),
        Err(PthreadError::InvalidHandle)
    );
    assert_eq!(m.unlock(), Err(PthreadError::InvalidHandle));
    assert_eq!(m.destroy(), Err(PthreadError::InvalidHandle));

    let mut attr = MutexAttr::new();
    attr.set_type(frankenpthread_core::mutex::PTHREAD_MUTEX_RECURSIVE)
        .unwrap();
    m.init_in_place(Some(&attr)).unwrap();
    assert_ne!(m.handle(), old);
    assert_eq!(m.kind(), Ok(MutexKind::Recursive));
}

#[test]
fn first_touch_race_on_static_mutex_yields_one_state() {
    static SHARED: Mutex = Mutex::INITIALIZER;
    let counter = Arc::new(AtomicUsize::new(0));
    let workers: Vec<_> = (0..16)
        .map(|_| {
            let counter = Arc::clone(&counter);
            std::thread::spawn(move || {
                SHARED.lock().unwrap();
                let word = SHARED.handle();
                let v = counter.load(Ordering::Relaxed);
                counter.store(v + 1, Ordering::Relaxed);
                SHARED.unlock().unwrap();
                word
            })
        })
        .collect();
    let words: Vec<u64> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    assert!(words.iter().all(|&w| w == words[0]));
    assert_eq!(counter.load(Ordering::Relaxed), 16);
    assert_eq!(SHARED.validity(), Validity::Live);
    assert_eq!(SHARED.kind(), Ok(MutexKind::ErrorCheck));
}

#[test]
fn timedlock_waits_for_release_within_deadline() {
    let m = Arc::new(Mutex::init(MutexKind::Normal).unwrap());
    m.lock().unwrap();
    let m2 = Arc::clone(&m);
    let waiter = std::thread::spawn(move || {
        let r = m2.timedlock(Deadline::after(Duration::from_secs(10)));
        if r.is_ok() {
            m2.unlock().unwrap();
        }
        r
    });
    std::thread::sleep(Duration::from_millis(20));
    m.unlock().unwrap();
    assert_eq!(waiter.join().unwrap(), Ok(()));
}
