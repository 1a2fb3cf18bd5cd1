use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use zmalloc::Allocator;

#[test]
fn many_threads_allocate_and_free_without_corrupting_shared_state() {
    let alloc = Arc::new(Allocator::new());
    let seen = Arc::new(Mutex::new(HashSet::new()));

    std::thread::scope(|s| {
        for _ in 0..16 {
            let alloc = alloc.clone();
            let seen = seen.clone();
            s.spawn(move || {
                for round in 0..300 {
                    let size = 16 << (round % 6);
                    let ptr = alloc.allocate(size).unwrap();
                    {
                        let mut seen = seen.lock().unwrap();
                        assert!(
                            seen.insert(ptr.as_ptr() as usize),
                            "allocator handed out a pointer still in use elsewhere"
                        );
                    }
                    unsafe { ptr.as_ptr().write_bytes(0xA5, size) };
                    let slice = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), size) };
                    assert!(slice.iter().all(|&b| b == 0xA5));
                    seen.lock().unwrap().remove(&(ptr.as_ptr() as usize));
                    unsafe { alloc.deallocate(ptr, size) };
                }
            });
        }
    });
}

#[test]
fn cross_thread_free_is_accepted() {
    let alloc = Arc::new(Allocator::new());
    let a1 = alloc.clone();
    let ptr = std::thread::spawn(move || a1.allocate(128).unwrap())
        .join()
        .unwrap();
    // Free on a different thread than the one that allocated it; the
    // central/transfer cache tiers must make this safe.
    unsafe { alloc.deallocate(ptr, 128) };
}
