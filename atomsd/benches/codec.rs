//! Encode/decode throughput for the atom wire codec.

use atomsd::atom::{decode_datagram, AtomBuilder};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn build_sample_datagram() -> Vec<u8> {
  let mut builder = AtomBuilder::obtain();
  builder.set_atom_id(1001).unwrap();
  builder.write_i64(42);
  builder.write_string("a representative field value");
  builder.write_i32_array(&[1, 2, 3, 4, 5, 6, 7, 8]);
  builder.add_bool_annotation(1, true);
  let (datagram, _) = builder.write();
  datagram
}

fn bench_encode(c: &mut Criterion) {
  c.bench_function("atom_encode", |b| {
    b.iter(|| {
      let mut builder = AtomBuilder::obtain();
      builder.set_atom_id(black_box(1001)).unwrap();
      builder.write_i64(black_box(42));
      builder.write_string(black_box("a representative field value"));
      black_box(builder.write())
    })
  });
}

fn bench_decode(c: &mut Criterion) {
  let datagram = build_sample_datagram();
  c.bench_function("atom_decode", |b| {
    b.iter(|| black_box(decode_datagram(black_box(&datagram), 0).unwrap()))
  });
}

criterion_group!(benches, bench_encode, bench_decode);
criterion_main!(benches);
