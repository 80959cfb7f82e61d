use crate::directory::{find, list, DirectoryBuilder, Object};
use crate::store::Variant;
use crate::test::test_dirs;
use crate::types::TypeTag;

const BUF: usize = 32;

#[test]
fn full_names_resolve() {
    let (short, _) = test_dirs();

    let v = find(BUF, &short, b"/default int8", 64);
    assert!(v.is_variable());
    assert_eq!(v.tag(), TypeTag::INT8);
    assert_eq!(v.offset(), 0);

    let v = find(BUF, &short, b"/default uint32", 64);
    assert_eq!(v.tag(), TypeTag::UINT32);
    assert_eq!(v.offset(), 4);
    assert_eq!(v.size(), 4);

    let v = find(BUF, &short, b"/blob b", 64);
    assert_eq!(v.tag(), TypeTag::BLOB);
    assert_eq!(v.size(), 4);

    let v = find(BUF, &short, b"/time (s)", 64);
    assert!(v.is_function());
    assert_eq!(v.id(), 1);
    assert_eq!(v.tag().value_type(), TypeTag::UINT32);
}

#[test]
fn partial_names_resolve_while_unambiguous() {
    let (short, _) = test_dirs();

    // Only one name under /f.
    let v = find(BUF, &short, b"/f", 64);
    assert_eq!(v.tag(), TypeTag::BOOL);

    // int8 vs int16 diverge after "int1"... at the digit.
    let v = find(BUF, &short, b"/default int8", 64);
    assert!(v.valid());
    let v = find(BUF, &short, b"/default int", 64);
    assert!(!v.valid(), "int8 and int16 are both reachable");

    // All of /default * is ambiguous.
    assert!(!find(BUF, &short, b"/default ", 64).valid());

    // Distinguishing digit present.
    assert_eq!(find(BUF, &short, b"/default int8", 64).offset(), 0);
    assert_eq!(find(BUF, &short, b"/default int1", 64).offset(), 2);
}

#[test]
fn unknown_names_fail() {
    let (short, _) = test_dirs();
    assert!(!find(BUF, &short, b"/zzz", 64).valid());
    assert!(!find(BUF, &short, b"", 64).valid());
    assert!(!find(BUF, &short, b"/default x", 64).valid());
}

#[test]
fn max_name_len_bounds_the_lookup() {
    let (short, _) = test_dirs();
    // Truncated to an ambiguous prefix.
    assert!(!find(BUF, &short, b"/default int8", 9).valid());
    // Truncation that stays unambiguous.
    assert!(find(BUF, &short, b"/flagzzz", 5).valid());
}

#[test]
fn list_enumerates_everything_in_name_order() {
    let (_, long) = test_dirs();
    let mut names = Vec::new();
    list(BUF, &long, &mut |name, v: Variant| {
        assert!(v.valid());
        names.push(name.to_string());
    })
    .unwrap();

    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted);
    assert_eq!(names.len(), 9);
    assert!(names.contains(&"/default double".to_string()));
    assert!(names.contains(&"/time (s)".to_string()));
}

#[test]
fn every_listed_name_finds_the_same_object() {
    let (short, long) = test_dirs();
    list(BUF, &long, &mut |name, v: Variant| {
        let found = find(BUF, &short, name.as_bytes(), name.len());
        assert_eq!(found, v, "mismatch for {name}");
    })
    .unwrap();
}

#[test]
fn misaligned_fixed_objects_are_rejected() {
    let (short, _) = DirectoryBuilder::new()
        .add(
            "/bad",
            Object::Variable {
                tag: TypeTag::INT16,
                offset: 1,
                len: 2,
            },
        )
        .build()
        .unwrap();
    assert!(!find(BUF, &short, b"/bad", 8).valid());
}

#[test]
fn out_of_range_objects_are_rejected() {
    let (short, _) = DirectoryBuilder::new()
        .add(
            "/oob",
            Object::Variable {
                tag: TypeTag::UINT32,
                offset: 60,
                len: 4,
            },
        )
        .build()
        .unwrap();
    assert!(!find(BUF, &short, b"/oob", 8).valid());
    // A bigger buffer accepts the same blob.
    assert!(find(64, &short, b"/oob", 8).valid());
}

#[test]
fn builder_rejects_prefix_collisions() {
    let err = DirectoryBuilder::new()
        .add(
            "/a",
            Object::Variable {
                tag: TypeTag::UINT8,
                offset: 0,
                len: 1,
            },
        )
        .add(
            "/ab",
            Object::Variable {
                tag: TypeTag::UINT8,
                offset: 1,
                len: 1,
            },
        )
        .build();
    assert!(err.is_err());
}
