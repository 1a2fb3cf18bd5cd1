use zmalloc::{SizeClasses, MAX_SMALL_SIZE};

#[test]
fn every_class_size_is_reachable_and_minimal_enough() {
    let sc = SizeClasses::new();
    for bytes in [1usize, 8, 9, 63, 64, 65, 4095, 4096, 4097, MAX_SMALL_SIZE] {
        let class = sc.class_for(bytes).expect("should have a class");
        let info = sc.class_info(class);
        assert!(info.size >= bytes);
        // no smaller class should also satisfy the request
        if class > 0 {
            assert!(sc.class_info(class - 1).size < bytes);
        }
    }
}

#[test]
fn requests_past_the_small_threshold_have_no_class() {
    let sc = SizeClasses::new();
    assert!(sc.class_for(MAX_SMALL_SIZE + 1).is_none());
    assert!(sc.class_for(10 * 1024 * 1024).is_none());
}
