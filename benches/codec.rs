//! Codec benchmarks: compress and decompress a realistic leaf page.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use cachalot::codec::{compress, decompress};
use cachalot::page::build::append_record;
use cachalot::page::layout::init_page;
use cachalot::page::records::{ColVal, Field, FieldLayout};
use cachalot::page::{Frame, PageType};
use cachalot::PageId;

fn leaf_layout() -> FieldLayout {
    FieldLayout::new(
        vec![Field::fixed(8), Field::fixed(16), Field::variable(2000)],
        Some(1),
    )
    .unwrap()
}

fn sample_page(n: u8, payload_len: usize) -> (Frame, FieldLayout) {
    let mut frame = Frame::new();
    init_page(&mut frame, PageId::new(1, 2), PageType::BtreeLeaf, 10);
    let fl = leaf_layout();
    for k in 0..n {
        let vals = vec![
            ColVal::Val(vec![k; 8]),
            ColVal::Val(vec![0x40 + k; 16]),
            ColVal::Val(
                (0..payload_len)
                    .map(|i| (i as u8).wrapping_mul(31).wrapping_add(k))
                    .collect(),
            ),
        ];
        append_record(&mut frame, &fl, &vals, false).expect("page holds the sample records");
    }
    (frame, fl)
}

fn bench_compress(c: &mut Criterion) {
    let (frame, fl) = sample_page(40, 120);
    c.bench_function("compress_40rec_into_4k", |b| {
        b.iter(|| compress(black_box(&frame), &fl, 3))
    });
}

fn bench_decompress(c: &mut Criterion) {
    let (frame, fl) = sample_page(40, 120);
    let mut image = compress(&frame, &fl, 3).expect("sample page compresses");
    c.bench_function("decompress_40rec_from_4k", |b| {
        b.iter(|| {
            let mut out = Frame::new();
            decompress(black_box(&mut image), &mut out)
        })
    });
}

criterion_group!(benches, bench_compress, bench_decompress);
criterion_main!(benches);
