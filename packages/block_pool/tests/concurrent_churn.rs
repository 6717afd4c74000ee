//! Multithreaded allocate/release churn against a shared pool.

use std::num::NonZero;
use std::ptr::NonNull;
use std::sync::{Arc, Barrier};
use std::thread;

use block_pool::BlockPool;

const THREADS: usize = 8;
const ROUNDS: usize = 2_000;
const HELD: usize = 16;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct Stamp {
    thread: usize,
    sequence: usize,
}

#[test]
fn churn_keeps_values_intact() {
    testing::with_watchdog(|| {
        let pool = Arc::new(
            BlockPool::<Stamp>::builder()
                .block_len(NonZero::new(2).unwrap())
                .build(),
        );
        let barrier = Arc::new(Barrier::new(THREADS));

        let handles = (0..THREADS)
            .map(|thread| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);

                thread::spawn(move || {
                    barrier.wait();

                    let mut held = Vec::<(NonNull<Stamp>, Stamp)>::with_capacity(HELD);

                    for sequence in 0..ROUNDS {
                        let stamp = Stamp { thread, sequence };
                        let slot = pool.allocate();

                        // SAFETY: Freshly allocated storage is ours alone until released.
                        unsafe { slot.write(stamp) };
                        held.push((slot, stamp));

                        if held.len() == HELD {
                            for (slot, expected) in held.drain(..) {
                                // If another thread had been handed the same slot, it would
                                // have overwritten our stamp.
                                // SAFETY: Initialized above, still owned by us.
                                assert_eq!(unsafe { slot.read() }, expected);

                                // SAFETY: Came from this pool, released once. Stamp is Copy.
                                unsafe { pool.release(slot) };
                            }
                        }
                    }

                    for (slot, expected) in held {
                        // SAFETY: Initialized above, still owned by us.
                        assert_eq!(unsafe { slot.read() }, expected);

                        // SAFETY: Came from this pool, released once. Stamp is Copy.
                        unsafe { pool.release(slot) };
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        // Everything went back, so the free list covers the whole pool again.
        assert_eq!(pool.free_len(), pool.capacity());
        assert!(pool.capacity() >= HELD);
    });
}

#[test]
fn static_pool_is_usable_from_many_threads() {
    static SHARED: BlockPool<u128> = BlockPool::new();

    testing::with_watchdog(|| {
        let handles = (0..THREADS)
            .map(|thread| {
                thread::spawn(move || {
                    for round in 0..ROUNDS {
                        let value = (thread as u128) << 64 | round as u128;
                        let slot = SHARED.allocate();

                        // SAFETY: Freshly allocated storage is ours alone until released.
                        unsafe { slot.write(value) };
                        // SAFETY: Initialized above.
                        assert_eq!(unsafe { slot.read() }, value);
                        // SAFETY: Came from this pool, released once.
                        unsafe { SHARED.release(slot) };
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(SHARED.free_len(), SHARED.capacity());
    });
}
