use scan_relay::ports::{parse_port_range, PortAllocator, PortRange};

#[test]
fn parse_range_and_open_ended_seed() {
    let r = parse_port_range(" 9000-9100 ").expect("parse ok");
    assert_eq!((r.first(), r.last()), (9000, 9100));

    let seed: PortRange = "9000".parse().expect("parse ok");
    assert_eq!((seed.first(), seed.last()), (9000, 65535));
}

#[test]
fn invalid_ranges_rejected() {
    assert!(parse_port_range("0").is_err());
    assert!(parse_port_range("9100-9000").is_err());
    assert!(parse_port_range("70000").is_err());
    assert!(parse_port_range("abc-9000").is_err());
}

#[test]
fn allocator_counts_up_then_reuses_lowest_released() {
    let mut ports = PortAllocator::new(PortRange::new(9000, 9003).unwrap());
    assert_eq!(ports.allocate(), Some(9000));
    assert_eq!(ports.allocate(), Some(9001));
    assert_eq!(ports.allocate(), Some(9002));

    assert!(ports.release(9002));
    assert!(ports.release(9000));
    assert!(!ports.release(9000)); // already returned
    assert!(!ports.release(9003)); // never handed out
    assert_eq!(ports.released_count(), 2);

    assert_eq!(ports.allocate(), Some(9000));
    assert_eq!(ports.allocate(), Some(9002));
    assert_eq!(ports.allocate(), Some(9003));
    assert_eq!(ports.allocate(), None);
}
