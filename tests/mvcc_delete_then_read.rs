//! E5: put, delete, then confirm `get` is empty while the deleted version
//! is still reachable by exact lookup.

use stratum_core::mvcc::Resolver;

#[test]
fn mvcc_delete_then_read() {
    let resolver = Resolver::new();
    let v1 = resolver.put(b"k".to_vec(), vec![0xAA], 0);
    let _v2 = resolver.delete(b"k".to_vec(), 0);

    assert_eq!(resolver.get(b"k"), None);
    assert_eq!(resolver.get_version(b"k", v1), Some(vec![0xAA]));
}

#[test]
fn put_delete_put_resurrects_key() {
    let resolver = Resolver::new();
    resolver.put(b"k".to_vec(), vec![0x01], 0);
    resolver.delete(b"k".to_vec(), 0);
    resolver.put(b"k".to_vec(), vec![0x02], 0);
    assert_eq!(resolver.get(b"k"), Some(vec![0x02]));
}
