//! Benchmarks for the wire codecs.
//!
//! Persistent references and composite token values are decoded for every
//! record a lookup returns; issuer names are normalized for every query that
//! carries one.

#![allow(missing_docs)]

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use secitem::der::normalize_name;
use secitem::value::attr;
use secitem::{AttributeMap, CompositeTokenValue, ItemClass, PersistentRef, ResultShape};

fn bench_persistent_ref_encode(c: &mut Criterion) {
    let pref = PersistentRef::new(ItemClass::Key, 0x0102_0304_0506_0708);

    c.bench_function("persistent_ref_encode", |b| {
        b.iter(|| black_box(black_box(pref).encode()));
    });
}

fn bench_persistent_ref_decode(c: &mut Criterion) {
    let bytes = PersistentRef::new(ItemClass::Key, 42).encode();

    c.bench_function("persistent_ref_decode", |b| {
        b.iter(|| black_box(PersistentRef::decode(black_box(&bytes))));
    });
}

fn bench_composite_encode(c: &mut Criterion) {
    let composite = CompositeTokenValue::new(vec![7u8; 32], Some(vec![1u8; 64]), Some(vec![2u8; 256]));

    c.bench_function("composite_encode", |b| {
        b.iter(|| black_box(black_box(&composite).encode()));
    });
}

fn bench_composite_decode(c: &mut Criterion) {
    let composite = CompositeTokenValue::new(vec![7u8; 32], Some(vec![1u8; 64]), Some(vec![2u8; 256]));
    let Ok(bytes) = composite.encode() else {
        return;
    };

    c.bench_function("composite_decode", |b| {
        b.iter(|| black_box(CompositeTokenValue::decode(black_box(&bytes))));
    });
}

fn bench_normalize_name(c: &mut Criterion) {
    // CN = "  Example   Root CA "
    let value = b"  Example   Root CA ";
    let mut atv = vec![0x06, 0x03, 0x55, 0x04, 0x03, 0x13, 20];
    atv.extend_from_slice(value);
    let mut seq = vec![0x30, 27];
    seq.extend(atv);
    let mut set = vec![0x31, 29];
    set.extend(seq);
    let mut name = vec![0x30, 31];
    name.extend(set);

    c.bench_function("normalize_name", |b| {
        b.iter(|| black_box(normalize_name(black_box(&name))));
    });
}

fn bench_result_shape_from_query(c: &mut Criterion) {
    let query = AttributeMap::new()
        .with(attr::CLASS, ItemClass::GenericPassword)
        .with(attr::RETURN_DATA, true)
        .with(attr::RETURN_ATTRIBUTES, true);

    c.bench_function("result_shape_from_query", |b| {
        b.iter(|| black_box(ResultShape::from_query(black_box(&query)).daemon_request()));
    });
}

criterion_group!(
    benches,
    bench_persistent_ref_encode,
    bench_persistent_ref_decode,
    bench_composite_encode,
    bench_composite_decode,
    bench_normalize_name,
    bench_result_shape_from_query,
);
criterion_main!(benches);
