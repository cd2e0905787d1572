//! Store benchmarks using criterion.

use std::hint::black_box;

use bytemuck::{Pod, Zeroable};
use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use dots_ecs::{Component, ComponentKind, World};

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
    z: f32,
}

impl Component for Position {
    const NAME: &'static str = "bench::Position";
}

#[derive(Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct Waypoint(u32);

impl Component for Waypoint {
    const NAME: &'static str = "bench::Waypoint";
    const KIND: ComponentKind = ComponentKind::Buffer { inline_capacity: 4 };
}

fn spawn_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("spawn");

    for count in [100u64, 1000, 10000] {
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::new("with_position", count), &count, |b, &count| {
            b.iter(|| {
                let mut world = World::new();
                let position = world.register::<Position>().unwrap();
                let archetype = world.archetype(&[position]).unwrap();
                for i in 0..count {
                    let entity = world.spawn(archetype).unwrap();
                    world.set(
                        entity,
                        Position {
                            x: i as f32,
                            y: 0.0,
                            z: 0.0,
                        },
                    );
                }
                black_box(world.entity_count())
            });
        });
    }

    group.finish();
}

fn buffer_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer");

    for len in [4u32, 64] {
        group.bench_with_input(BenchmarkId::new("push", len), &len, |b, &len| {
            b.iter(|| {
                let mut world = World::new();
                let waypoint = world.register::<Waypoint>().unwrap();
                let archetype = world.archetype(&[waypoint]).unwrap();
                let entity = world.spawn(archetype).unwrap();
                for i in 0..len {
                    world.buffer_push(entity, Waypoint(i));
                }
                black_box(world.buffer_header::<Waypoint>(entity))
            });
        });
    }

    group.finish();
}

criterion_group!(benches, spawn_benchmarks, buffer_benchmarks);
criterion_main!(benches);
