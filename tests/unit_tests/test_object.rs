// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use bytes::Bytes;
use diamondd::{
    object::{AttrFlags, FLTRTIME_ATTR, OBJ_ID_ATTR, Object, filter_time_attr},
    sig::Signature,
};

#[test]
fn test_attribute_signature_commutes_with_writes() {
    let mut obj = Object::from_uri("http://store/obj/1");
    for value in [&b"one"[..], b"two", b"three"] {
        obj.write_attr("n", Bytes::copy_from_slice(value));
        let attr = obj.read_attr("n").expect("present");
        assert_eq!(attr.sig, Signature::of_bytes(value));
    }
}

#[test]
fn test_identity_from_uri_is_stable() {
    let a = Object::from_uri("http://store/obj/1");
    let b = Object::from_uri("http://store/obj/1");
    let c = Object::from_uri("http://store/obj/2");
    assert_eq!(a.id_sig(), b.id_sig());
    assert_ne!(a.id_sig(), c.id_sig());

    let id = a.read_attr(OBJ_ID_ATTR).expect("object id attr");
    assert_eq!(&id.data[..], b"http://store/obj/1");
}

#[test]
fn test_body_is_the_empty_name_attribute() {
    let mut obj = Object::from_uri("http://store/obj/1");
    assert!(!obj.has_body());
    obj.set_body(Bytes::from_static(b"RED-CIRCLE"));
    assert!(obj.has_body());
    assert_eq!(obj.body().map(|b| &b[..]), Some(&b"RED-CIRCLE"[..]));
    assert_eq!(
        obj.read_attr("").expect("body attr").sig,
        Signature::of_bytes(b"RED-CIRCLE")
    );
}

#[test]
fn test_iteration_is_name_sorted() {
    let mut obj = Object::from_uri("http://store/obj/1");
    obj.write_attr("zebra", Bytes::from_static(b"1"));
    obj.write_attr("alpha", Bytes::from_static(b"2"));
    obj.write_attr("mid", Bytes::from_static(b"3"));

    let names: Vec<&str> = obj.iter_attrs().map(|(n, _)| n).collect();
    let mut sorted = names.clone();
    sorted.sort_unstable();
    assert_eq!(names, sorted);
}

#[test]
fn test_attr_sig_set_matches_state() {
    let mut obj = Object::from_uri("http://store/obj/1");
    obj.set_body(Bytes::from_static(b"BODY"));
    obj.write_attr("color", Bytes::from_static(b"red"));

    let set = obj.attr_sig_set();
    assert!(set.contains("", &Signature::of_bytes(b"BODY")));
    assert!(set.contains("color", &Signature::of_bytes(b"red")));
    assert!(set.contains(
        OBJ_ID_ATTR,
        &Signature::of_bytes(b"http://store/obj/1")
    ));
    assert_eq!(set.len(), 3);
}

#[test]
fn test_omitted_attrs_stay_in_sig_set() {
    let mut obj = Object::from_uri("http://store/obj/1");
    obj.write_attr("secret", Bytes::from_static(b"internal"));
    assert!(obj.omit_attr("secret"));

    let attr = obj.read_attr("secret").expect("engine still sees it");
    assert!(attr.flags.contains(AttrFlags::OMIT));
    assert!(
        obj.attr_sig_set()
            .contains("secret", &Signature::of_bytes(b"internal"))
    );
}

#[test]
fn test_time_stamps_use_reserved_names() {
    let mut obj = Object::from_uri("http://store/obj/1");
    obj.stamp_filter_time("f_has_red", Duration::from_nanos(1234));
    obj.stamp_stack_time(Duration::from_nanos(9999));

    assert_eq!(filter_time_attr("f_has_red"), "_FIL_TIME_f_has_red.time");
    let per_filter = obj
        .read_attr("_FIL_TIME_f_has_red.time")
        .expect("per-filter stamp");
    assert_eq!(&per_filter.data[..], b"1234");
    let stack = obj.read_attr(FLTRTIME_ATTR).expect("stack stamp");
    assert_eq!(&stack.data[..], b"9999");
}
