//! Container integration tests against files on disk

use bytemuck::{Pod, Zeroable};
use dots_ecs::{Component, ComponentKind, World};
use dots_serialize::{
    AsyncFileReader, BinaryReader, ContainerConfig, ContainerReader, ContainerWriter, DeserializeOptions,
    MemoryBinaryReader, MemoryBinaryWriter, NodeRef, NodeType, SerializeOptions, StreamBinaryReader,
    StreamBinaryWriter, StringTable, StringTableWriter, deserialize_world, serialize_world,
};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Position {
    x: f32,
    y: f32,
}

impl Component for Position {
    const NAME: &'static str = "tests::Position";
}

#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
#[repr(C)]
struct Step(u16);

impl Component for Step {
    const NAME: &'static str = "tests::Step";
    const KIND: ComponentKind = ComponentKind::Buffer { inline_capacity: 4 };
}

fn populated_world(count: u32) -> World {
    let mut world = World::new();
    let position = world.register::<Position>().unwrap();
    let step = world.register::<Step>().unwrap();
    let archetype = world.archetype(&[position, step]).unwrap();
    for i in 0..count {
        let e = world.spawn(archetype).unwrap();
        world.set(
            e,
            Position {
                x: i as f32,
                y: -(i as f32),
            },
        );
        for s in 0..(i % 7) as u16 {
            world.buffer_push(e, Step(s));
        }
    }
    world
}

fn empty_target() -> World {
    let mut world = World::new();
    world.register::<Position>().unwrap();
    world.register::<Step>().unwrap();
    world
}

fn positions(world: &World) -> Vec<(u32, u32)> {
    let mut all: Vec<(u32, u32)> = world
        .entities()
        .filter_map(|e| world.get::<Position>(e))
        .map(|p| (p.x.to_bits(), p.y.to_bits()))
        .collect();
    all.sort_unstable();
    all
}

#[test]
fn test_nested_tree_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree.dots");

    let stream = StreamBinaryWriter::create(&path).unwrap();
    let mut writer = ContainerWriter::new(stream, ContainerConfig::new("tests::Tree")).unwrap();
    writer.create_node(NodeType::Folder, Uuid::from_u128(1)).unwrap();
    writer.set_metadata(b"root folder").unwrap();
    let mut names = StringTableWriter::begin(&mut writer, NodeType::StringTable, Uuid::from_u128(2)).unwrap();
    let alpha = names.add(&mut writer, "alpha").unwrap();
    let beta = names.add(&mut writer, "beta").unwrap();
    assert_eq!(names.add(&mut writer, "alpha").unwrap(), alpha);
    names.finish(&mut writer).unwrap();
    writer
        .write_node(NodeType::RawData, Uuid::from_u128(3), 0, &vec![7u8; 100_000])
        .unwrap();
    writer.end_node().unwrap();
    writer.write_node(NodeType::RawData, Uuid::from_u128(4), 0, b"tail").unwrap();
    writer.finish().unwrap().into_inner().unwrap();

    let mut reader = ContainerReader::open(StreamBinaryReader::open(&path).unwrap()).unwrap();
    assert_eq!(reader.header().file_type, "tests::Tree");
    assert_eq!(reader.node_count(), 4);

    let folder = reader.first_child(NodeRef::ROOT).unwrap();
    assert_eq!(reader.read_metadata(folder).unwrap(), Some(&b"root folder"[..]));
    let children: Vec<NodeRef> = reader.children(folder).collect();
    assert_eq!(children.len(), 2);

    let table = StringTable::load(&mut reader, children[0]).unwrap();
    assert_eq!(table.len(), 2);
    assert_eq!(table.get(alpha), "alpha");
    assert_eq!(table.get(beta), "beta");

    let big = reader.read_data_to_vec(children[1]).unwrap();
    assert_eq!(big.len(), 100_000);
    assert!(big.iter().all(|&b| b == 7));

    let tail = reader.find_node_by_id(NodeRef::ROOT, Uuid::from_u128(4), 1).unwrap();
    assert_eq!(reader.read_data_to_vec(tail).unwrap(), b"tail");
    assert_eq!(reader.next_sibling(folder), Some(tail));
    assert_eq!(reader.next_sibling(tail), None);
}

#[test]
fn test_world_through_file_streams() {
    let world = populated_world(500);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world.dots");

    let stream = StreamBinaryWriter::create(&path).unwrap();
    let (stream, referenced) = serialize_world(&world, stream, &SerializeOptions::default()).unwrap();
    stream.into_inner().unwrap();

    let mut restored = empty_target();
    let load = deserialize_world(
        &mut restored,
        StreamBinaryReader::open(&path).unwrap(),
        &referenced,
        &DeserializeOptions::default(),
    )
    .unwrap();
    assert_eq!(load.entities, 500);
    assert_eq!(positions(&restored), positions(&world));
}

#[test]
fn test_world_through_async_reader() {
    let world = populated_world(300);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world.dots");

    let (stream, referenced) =
        serialize_world(&world, StreamBinaryWriter::create(&path).unwrap(), &SerializeOptions::default()).unwrap();
    stream.into_inner().unwrap();

    let mut restored = empty_target();
    let options = DeserializeOptions::new().with_max_chunks_per_block(1);
    deserialize_world(&mut restored, AsyncFileReader::open(&path).unwrap(), &referenced, &options).unwrap();

    for e in restored.entities() {
        let position = restored.get::<Position>(e).unwrap();
        let i = position.x as u32;
        let steps: Vec<Step> = (0..(i % 7) as u16).map(Step).collect();
        assert_eq!(restored.buffer::<Step>(e), Some(steps));
    }
}

#[test]
fn test_world_after_file_prefix() {
    use std::io::{Seek, SeekFrom, Write};

    let world = populated_world(20);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bundle.bin");

    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(b"BUNDLE-HEADER").unwrap();
    let stream = StreamBinaryWriter::from_file(file).unwrap();
    let (stream, referenced) = serialize_world(&world, stream, &SerializeOptions::default()).unwrap();
    stream.into_inner().unwrap();

    let bytes = std::fs::read(&path).unwrap();
    assert_eq!(&bytes[..13], b"BUNDLE-HEADER");
    assert_eq!(&bytes[13..21], b"DOTSBIN!");

    let mut file = std::fs::File::open(&path).unwrap();
    file.seek(SeekFrom::Start(13)).unwrap();
    let mut restored = empty_target();
    let load = deserialize_world(
        &mut restored,
        StreamBinaryReader::from_file(file).unwrap(),
        &referenced,
        &DeserializeOptions::default(),
    )
    .unwrap();
    assert_eq!(load.entities, 20);
    assert_eq!(positions(&restored), positions(&world));
}

#[test]
fn test_file_and_memory_output_match() {
    let world = populated_world(40);
    let id = Uuid::from_u128(77);
    let options = SerializeOptions::new().with_file_id(id);

    let (memory, _) = serialize_world(&world, MemoryBinaryWriter::new(), &options).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world.dots");
    let (stream, _) = serialize_world(&world, StreamBinaryWriter::create(&path).unwrap(), &options).unwrap();
    stream.into_inner().unwrap();

    assert_eq!(std::fs::read(&path).unwrap(), memory.into_inner());
}

#[test]
fn test_async_batch_matches_sequential_reads() {
    let world = populated_world(10);
    let (memory, _) = serialize_world(&world, MemoryBinaryWriter::new(), &SerializeOptions::default()).unwrap();
    let bytes = memory.into_inner();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("world.dots");
    std::fs::write(&path, &bytes).unwrap();

    let mut memory_reader = ContainerReader::open(MemoryBinaryReader::new(&bytes)).unwrap();
    let mut file_reader = ContainerReader::open(AsyncFileReader::open(&path).unwrap()).unwrap();
    let node = memory_reader.find_node_by_type(NodeRef::ROOT, NodeType::World, 1).unwrap();
    let sections: Vec<NodeRef> = memory_reader.children(node).collect();

    let commands = sections.iter().map(|&n| file_reader.prefetch(n).unwrap()).collect();
    let batched = file_reader.read_batch(commands).unwrap();
    for (section, command) in sections.iter().zip(batched) {
        assert_eq!(command.buffer, memory_reader.read_data_to_vec(*section).unwrap());
    }
    assert_eq!(file_reader.stream_mut().stream_len(), bytes.len() as u64);
}
