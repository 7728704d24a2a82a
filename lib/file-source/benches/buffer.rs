use std::{fmt, io::Cursor};

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use file_source::buffer::read_until_with_max_size;

struct Parameters {
    bytes: Vec<u8>,
    delim: &'static [u8],
    bytes_before_first_delim: usize,
    max_size: usize,
}

impl fmt::Display for Parameters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bytes_before_first_delim: {}, delim_len: {}",
            self.bytes_before_first_delim,
            self.delim.len()
        )
    }
}

fn read_until_bench(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_until_with_max_size");

    let parameters = [
        Parameters {
            bytes: vec![0; 1024],
            delim: b"\n",
            bytes_before_first_delim: 1024,
            max_size: 2048,
        },
        Parameters {
            bytes: vec![0; 4096],
            delim: b"\n",
            bytes_before_first_delim: 4096,
            max_size: 2048,
        },
        Parameters {
            bytes: vec![0; 4096],
            delim: b"\n\0",
            bytes_before_first_delim: 4096,
            max_size: 8192,
        },
    ];

    for param in &parameters {
        let mut bytes = param.bytes.clone();
        bytes.truncate(param.bytes_before_first_delim);
        bytes.extend_from_slice(param.delim);

        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(param), &bytes, |b, bytes| {
            b.iter_batched(
                || (Cursor::new(bytes.as_slice()), BytesMut::new(), 0),
                |(mut reader, mut buf, mut position)| {
                    while read_until_with_max_size(
                        &mut reader,
                        &mut position,
                        param.delim,
                        &mut buf,
                        param.max_size,
                    )
                    .unwrap()
                    .is_some()
                    {}
                },
                criterion::BatchSize::SmallInput,
            )
        });
    }
    group.finish();
}

criterion_group!(
    name = benches;
    config = Criterion::default().noise_threshold(0.02);
    targets = read_until_bench
);
criterion_main!(benches);
