//! Basic usage of `BlockPool` as backing storage for hand-managed records.

use std::ptr::NonNull;

use block_pool::BlockPool;

struct Record {
    name: String,
    hits: u64,
}

static RECORDS: BlockPool<Record> = BlockPool::new();

fn create(name: &str) -> NonNull<Record> {
    let slot = RECORDS.allocate();

    // SAFETY: Freshly allocated storage is valid for writes.
    unsafe {
        slot.write(Record {
            name: name.to_string(),
            hits: 0,
        });
    }

    slot
}

fn destroy(record: NonNull<Record>) {
    // SAFETY: The record was initialized in `create()` and nothing references it anymore.
    unsafe { record.drop_in_place() };

    // SAFETY: The pointer came from RECORDS and is released exactly once.
    unsafe { RECORDS.release(record) };
}

fn main() {
    let mut records = ["alpha", "beta", "gamma"].map(create);

    for record in &mut records {
        // SAFETY: Initialized in `create()`, exclusively ours.
        let record = unsafe { record.as_mut() };
        record.hits += record.name.len() as u64;
    }

    for record in &records {
        // SAFETY: Initialized in `create()`.
        let record = unsafe { record.as_ref() };
        println!("{}: {} hits", record.name, record.hits);
    }

    println!(
        "capacity {}, free {} before release",
        RECORDS.capacity(),
        RECORDS.free_len()
    );

    for record in records {
        destroy(record);
    }

    println!(
        "capacity {}, free {} after release",
        RECORDS.capacity(),
        RECORDS.free_len()
    );
}
