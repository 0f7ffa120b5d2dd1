use criterion::criterion_group;
use criterion::criterion_main;
use criterion::Criterion;


fn bench_main(c: &mut Criterion) {
    alloc::bench(c);
    recycle::bench(c);
}

criterion_group!(benches, bench_main);
criterion_main!(benches);
