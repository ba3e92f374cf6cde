//! Decoded OSM data blocks and their read-only views.
//!
//! A [`Block`] is the in-memory form of one OSMData blob: a string table
//! plus flat, parallel arrays for dense nodes, ways, or relations. Entities
//! are not nested structures; each one is a row of range indices into the
//! block-wide arrays, which keeps a multi-thousand-entity block to a
//! handful of allocations. [`Node`], [`Way`], and [`Relation`] are
//! lightweight views that borrow the block to dereference those ranges.

use std::fmt;

use log::warn;

use crate::result::*;
use crate::wire::{for_each_field, Scan};

/// How much of a block to decode.
///
/// Everything short of [`What::Everything`] is an optimization for callers
/// that scan planet files for one thing, e.g. splitting a file by data kind
/// before farming blocks out to workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum What {
    /// The string table and every primitive group.
    Everything,
    /// Only identify which kind of primitive the block holds.
    DataKinds,
    /// Only the string table.
    Strings,
    /// The string table and dense nodes.
    Nodes,
    /// The string table and ways.
    Ways,
    /// The string table and relations.
    Relations,
}

/// The kind of primitive a block holds. Planet files group each kind into
/// its own run of blocks: all nodes, then all ways, then all relations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Nodes,
    Ways,
    Relations,
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DataKind::Nodes => "nodes",
            DataKind::Ways => "ways",
            DataKind::Relations => "relations",
        })
    }
}

/// The block's string table: one UTF-8 arena plus a `(offset, len)` span
/// per entry, in insertion order.
#[derive(Debug, Default)]
struct StringTable {
    arena: String,
    spans: Vec<(u32, u32)>,
}

impl StringTable {
    fn with_capacity(count: usize, total_len: usize) -> Self {
        StringTable {
            arena: String::with_capacity(total_len),
            spans: Vec::with_capacity(count),
        }
    }

    fn push(&mut self, bytes: &[u8]) -> PlanetResult<()> {
        let s = std::str::from_utf8(bytes)?;
        let offset = self.arena.len() as u32;
        self.arena.push_str(s);
        self.spans.push((offset, s.len() as u32));
        Ok(())
    }

    fn len(&self) -> usize {
        self.spans.len()
    }

    fn get(&self, index: usize) -> PlanetResult<&str> {
        let &(offset, len) = self.spans.get(index).ok_or(PlanetError::OutOfBounds)?;
        Ok(&self.arena[offset as usize..(offset + len) as usize])
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockNode {
    id: i64,
    lat: f64,
    lon: f64,
    sset: u32, // first string-index slot
    send: u32, // one past the last slot
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockWay {
    id: i64,
    sset: u32,
    send: u32,
    rset: u32, // first node ref
    rend: u32, // one past the last ref
}

#[derive(Debug, Clone, Copy, Default)]
struct BlockRelation {
    id: i64,
    sset: u32,
    send: u32,
    mset: u32, // first member
    mend: u32, // one past the last member
}

/// One decoded OSMData block. Immutable once built.
#[derive(Debug)]
pub struct Block {
    granularity: i64,
    lat_offset: i64,
    lon_offset: i64,
    date_granularity: i64,
    data_kind: DataKind,
    strings: StringTable,
    nodes: Vec<BlockNode>,
    node_strings: Vec<u32>,
    ways: Vec<BlockWay>,
    way_strings: Vec<u32>,
    way_refs: Vec<i64>,
    relations: Vec<BlockRelation>,
    relation_strings: Vec<u32>,
    relation_member_roles: Vec<u32>,
    relation_member_refs: Vec<i64>,
    relation_member_types: Vec<u8>,
}

impl Block {
    fn new() -> Self {
        Block {
            granularity: 100,
            lat_offset: 0,
            lon_offset: 0,
            date_granularity: 1000,
            data_kind: DataKind::Nodes,
            strings: StringTable::default(),
            nodes: Vec::new(),
            node_strings: Vec::new(),
            ways: Vec::new(),
            way_strings: Vec::new(),
            way_refs: Vec::new(),
            relations: Vec::new(),
            relation_strings: Vec::new(),
            relation_member_roles: Vec::new(),
            relation_member_refs: Vec::new(),
            relation_member_types: Vec::new(),
        }
    }

    /// Decodes an inflated OSMData payload.
    pub fn decode(what: What, data: &[u8]) -> PlanetResult<Block> {
        let mut block = Block::new();
        let mut string_table: &[u8] = &[];
        let mut groups: Vec<&[u8]> = Vec::new();
        for_each_field(data, |field| {
            match field.num() {
                1 => string_table = field.bytes(),
                2 => {
                    if what == What::DataKinds {
                        if let Some(kind) = detect_group_kind(field.bytes())? {
                            block.data_kind = kind;
                        }
                    } else if what != What::Strings {
                        groups.push(field.bytes());
                    }
                }
                17 => block.granularity = field.as_i64(),
                18 => block.date_granularity = field.as_i64(),
                19 => block.lat_offset = field.as_i64(),
                20 => block.lon_offset = field.as_i64(),
                num => return Err(PlanetError::UnsupportedField(num)),
            }
            Ok(Scan::Continue)
        })?;
        if what != What::DataKinds {
            decode_string_table(string_table, &mut block)?;
            for group in groups {
                decode_group(what, group, &mut block)?;
            }
        }
        Ok(block)
    }

    pub fn data_kind(&self) -> DataKind {
        self.data_kind
    }

    /// Nano-degree units per coordinate step in this block. Node
    /// coordinates are already scaled; this is metadata for callers that
    /// want the raw resolution.
    pub fn granularity(&self) -> i64 {
        self.granularity
    }

    /// Milliseconds per timestamp step in this block. Timestamps live in
    /// the entity Info messages, which this decoder skips.
    pub fn date_granularity(&self) -> i64 {
        self.date_granularity
    }

    pub fn num_strings(&self) -> usize {
        self.strings.len()
    }

    pub fn string_at(&self, index: usize) -> PlanetResult<&str> {
        self.strings.get(index)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node_at(&self, index: usize) -> PlanetResult<Node<'_>> {
        let raw = self.nodes.get(index).ok_or(PlanetError::OutOfBounds)?;
        Ok(Node { block: self, raw })
    }

    pub fn num_ways(&self) -> usize {
        self.ways.len()
    }

    pub fn way_at(&self, index: usize) -> PlanetResult<Way<'_>> {
        let raw = self.ways.get(index).ok_or(PlanetError::OutOfBounds)?;
        Ok(Way { block: self, raw })
    }

    pub fn num_relations(&self) -> usize {
        self.relations.len()
    }

    pub fn relation_at(&self, index: usize) -> PlanetResult<Relation<'_>> {
        let raw = self.relations.get(index).ok_or(PlanetError::OutOfBounds)?;
        Ok(Relation { block: self, raw })
    }
}

/// A read-only view of one node. Produced by [`Block::node_at`]; borrows
/// the block for string lookups.
#[derive(Debug, Clone, Copy)]
pub struct Node<'a> {
    block: &'a Block,
    raw: &'a BlockNode,
}

impl<'a> Node<'a> {
    pub fn id(&self) -> i64 {
        self.raw.id
    }

    /// Latitude in degrees.
    pub fn lat(&self) -> f64 {
        self.raw.lat
    }

    /// Longitude in degrees.
    pub fn lon(&self) -> f64 {
        self.raw.lon
    }

    /// The number of string-table indices attached to this node. These
    /// alternate key, value, key, value.
    pub fn num_strings(&self) -> usize {
        (self.raw.send - self.raw.sset) as usize
    }

    pub fn string_at(&self, index: usize) -> PlanetResult<&'a str> {
        let slots = &self.block.node_strings[self.raw.sset as usize..self.raw.send as usize];
        let &sid = slots.get(index).ok_or(PlanetError::OutOfBounds)?;
        self.block.string_at(sid as usize)
    }
}

/// A read-only view of one way. Produced by [`Block::way_at`].
#[derive(Debug, Clone, Copy)]
pub struct Way<'a> {
    block: &'a Block,
    raw: &'a BlockWay,
}

impl<'a> Way<'a> {
    pub fn id(&self) -> i64 {
        self.raw.id
    }

    pub fn num_refs(&self) -> usize {
        (self.raw.rend - self.raw.rset) as usize
    }

    /// The absolute id of the `index`th node on this way.
    pub fn ref_at(&self, index: usize) -> PlanetResult<i64> {
        let refs = &self.block.way_refs[self.raw.rset as usize..self.raw.rend as usize];
        refs.get(index).copied().ok_or(PlanetError::OutOfBounds)
    }

    /// The number of string-table indices attached to this way (alternating
    /// key, value).
    pub fn num_strings(&self) -> usize {
        (self.raw.send - self.raw.sset) as usize
    }

    pub fn string_at(&self, index: usize) -> PlanetResult<&'a str> {
        let slots = &self.block.way_strings[self.raw.sset as usize..self.raw.send as usize];
        let &sid = slots.get(index).ok_or(PlanetError::OutOfBounds)?;
        self.block.string_at(sid as usize)
    }
}

/// A read-only view of one relation. Produced by [`Block::relation_at`].
#[derive(Debug, Clone, Copy)]
pub struct Relation<'a> {
    block: &'a Block,
    raw: &'a BlockRelation,
}

impl<'a> Relation<'a> {
    pub fn id(&self) -> i64 {
        self.raw.id
    }

    /// The number of string-table indices attached to this relation
    /// (alternating key, value).
    pub fn num_strings(&self) -> usize {
        (self.raw.send - self.raw.sset) as usize
    }

    pub fn string_at(&self, index: usize) -> PlanetResult<&'a str> {
        let slots = &self.block.relation_strings[self.raw.sset as usize..self.raw.send as usize];
        let &sid = slots.get(index).ok_or(PlanetError::OutOfBounds)?;
        self.block.string_at(sid as usize)
    }

    pub fn num_members(&self) -> usize {
        (self.raw.mend - self.raw.mset) as usize
    }

    /// The `index`th member as `(type, ref, role)`, where type 0 is a node,
    /// 1 a way, and 2 a relation.
    pub fn member_at(&self, index: usize) -> PlanetResult<(u8, i64, &'a str)> {
        let range = self.raw.mset as usize..self.raw.mend as usize;
        if index >= range.len() {
            return Err(PlanetError::OutOfBounds);
        }
        let typ = self.block.relation_member_types[range.clone()][index];
        let reference = self.block.relation_member_refs[range.clone()][index];
        let role_sid = self.block.relation_member_roles[range][index];
        let role = self.block.string_at(role_sid as usize)?;
        Ok((typ, reference, role))
    }
}

/// Finds which primitive kind a group's first recognizable subfield holds,
/// without decoding anything.
fn detect_group_kind(data: &[u8]) -> PlanetResult<Option<DataKind>> {
    let mut kind = None;
    for_each_field(data, |field| {
        kind = match field.num() {
            2 => Some(DataKind::Nodes),
            3 => Some(DataKind::Ways),
            4 => Some(DataKind::Relations),
            _ => return Ok(Scan::Continue),
        };
        Ok(Scan::Stop)
    })?;
    Ok(kind)
}

fn decode_string_table(data: &[u8], block: &mut Block) -> PlanetResult<()> {
    // Sizing pass so the arena and span list allocate once.
    let mut count = 0usize;
    let mut total_len = 0usize;
    for_each_field(data, |field| {
        count += 1;
        total_len += field.bytes().len();
        Ok(Scan::Continue)
    })?;
    let mut strings = StringTable::with_capacity(count, total_len);
    for_each_field(data, |field| {
        strings.push(field.bytes())?;
        Ok(Scan::Continue)
    })?;
    block.strings = strings;
    Ok(())
}

fn decode_group(what: What, data: &[u8], block: &mut Block) -> PlanetResult<()> {
    for_each_field(data, |field| {
        match field.num() {
            1 => return Err(PlanetError::UnsupportedFeature("plain nodes")),
            2 => {
                block.data_kind = DataKind::Nodes;
                if matches!(what, What::Everything | What::Nodes) {
                    decode_dense_nodes(field.bytes(), block)?;
                }
            }
            3 => {
                block.data_kind = DataKind::Ways;
                if matches!(what, What::Everything | What::Ways) {
                    decode_way(field.bytes(), block)?;
                }
            }
            4 => {
                block.data_kind = DataKind::Relations;
                if matches!(what, What::Everything | What::Relations) {
                    decode_relation(field.bytes(), block)?;
                }
            }
            5 => {} // changesets
            num => return Err(PlanetError::UnsupportedField(num)),
        }
        Ok(Scan::Continue)
    })
}

/// Decodes one DenseNodes message: three delta-coded packed arrays (id,
/// lat, lon) plus the keys_vals run, where each node's tags end with a 0.
fn decode_dense_nodes(data: &[u8], block: &mut Block) -> PlanetResult<()> {
    // Sizing pass: the parallel arrays can't be allocated until the node
    // and tag counts are known.
    let mut num_nodes = 0usize;
    let mut num_strings = 0usize;
    for_each_field(data, |field| {
        match field.num() {
            1 => field.for_each_packed_i64(|_| {
                num_nodes += 1;
                Ok(())
            })?,
            10 => {
                let mut on_value = false;
                field.for_each_packed_u64(|x| {
                    if !on_value && x == 0 {
                        return Ok(()); // terminator of one node's tag run
                    }
                    num_strings += 1;
                    on_value = !on_value;
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(Scan::Continue)
    })?;

    let mut nodes = vec![BlockNode::default(); num_nodes];
    let mut node_strings = vec![0u32; num_strings];
    // Slot positions are block-wide; rebase in case an earlier group in
    // this block already contributed nodes.
    let base = block.node_strings.len() as u32;

    let granularity = block.granularity;
    let lat_offset = block.lat_offset;
    let lon_offset = block.lon_offset;

    let mut id_sum = 0i64;
    let mut lat_sum = 0i64;
    let mut lon_sum = 0i64;
    for_each_field(data, |field| {
        match field.num() {
            1 => {
                let mut i = 0usize;
                field.for_each_packed_i64(|x| {
                    id_sum += x;
                    nodes[i].id = id_sum;
                    i += 1;
                    Ok(())
                })?;
            }
            8 => {
                let mut i = 0usize;
                field.for_each_packed_i64(|x| {
                    lat_sum += x;
                    let node = nodes.get_mut(i).ok_or(PlanetError::InvalidWire)?;
                    node.lat = 1e-9 * ((lat_offset + granularity * lat_sum) as f64);
                    i += 1;
                    Ok(())
                })?;
            }
            9 => {
                let mut i = 0usize;
                field.for_each_packed_i64(|x| {
                    lon_sum += x;
                    let node = nodes.get_mut(i).ok_or(PlanetError::InvalidWire)?;
                    node.lon = 1e-9 * ((lon_offset + granularity * lon_sum) as f64);
                    i += 1;
                    Ok(())
                })?;
            }
            10 => {
                let mut string_idx = 0u32;
                let mut node_idx = 0usize;
                let mut on_value = false;
                let mut started = false;
                field.for_each_packed_u64(|x| {
                    if !on_value && x == 0 {
                        // Even a leading terminator (an empty tag list for
                        // the first node) advances the node index.
                        node_idx += 1;
                        started = false;
                        return Ok(());
                    }
                    let node = nodes.get_mut(node_idx).ok_or(PlanetError::InvalidWire)?;
                    if !started {
                        node.sset = base + string_idx;
                        started = true;
                    }
                    node_strings[string_idx as usize] = x as u32;
                    string_idx += 1;
                    node.send = base + string_idx;
                    on_value = !on_value;
                    Ok(())
                })?;
            }
            _ => {}
        }
        Ok(Scan::Continue)
    })?;

    block.nodes.extend_from_slice(&nodes);
    block.node_strings.extend_from_slice(&node_strings);
    Ok(())
}

fn decode_way(data: &[u8], block: &mut Block) -> PlanetResult<()> {
    let mut way = BlockWay {
        sset: block.way_strings.len() as u32,
        rset: block.way_refs.len() as u32,
        ..Default::default()
    };
    // Keys are appended as (key, 0) pairs; vals then overwrite the zero
    // slots in order, trailing the append position by one.
    let mut val_slot = block.way_strings.len() + 1;
    let mut num_vals = 0usize;
    let mut ref_sum = 0i64;
    for_each_field(data, |field| {
        match field.num() {
            1 => way.id = field.as_u64() as i64,
            2 => field.for_each_packed_u64(|x| {
                block.way_strings.push(x as u32);
                block.way_strings.push(0);
                Ok(())
            })?,
            3 => field.for_each_packed_u64(|x| {
                if let Some(slot) = block.way_strings.get_mut(val_slot) {
                    *slot = x as u32;
                }
                val_slot += 2;
                num_vals += 1;
                Ok(())
            })?,
            8 => field.for_each_packed_i64(|x| {
                ref_sum += x;
                block.way_refs.push(ref_sum);
                Ok(())
            })?,
            _ => {} // info and anything else
        }
        Ok(Scan::Continue)
    })?;
    way.send = block.way_strings.len() as u32;
    way.rend = block.way_refs.len() as u32;
    let num_keys = (way.send - way.sset) as usize / 2;
    if num_keys != num_vals {
        // Unfilled value slots keep string 0, the empty string.
        warn!("way {}: {num_keys} keys but {num_vals} values", way.id);
    }
    block.ways.push(way);
    Ok(())
}

fn decode_relation(data: &[u8], block: &mut Block) -> PlanetResult<()> {
    let mut relation = BlockRelation {
        sset: block.relation_strings.len() as u32,
        mset: block.relation_member_refs.len() as u32,
        ..Default::default()
    };
    let mut val_slot = block.relation_strings.len() + 1;
    let mut num_vals = 0usize;
    let mut member_sum = 0i64;
    for_each_field(data, |field| {
        match field.num() {
            1 => relation.id = field.as_u64() as i64,
            2 => field.for_each_packed_u64(|x| {
                block.relation_strings.push(x as u32);
                block.relation_strings.push(0);
                Ok(())
            })?,
            3 => field.for_each_packed_u64(|x| {
                if let Some(slot) = block.relation_strings.get_mut(val_slot) {
                    *slot = x as u32;
                }
                val_slot += 2;
                num_vals += 1;
                Ok(())
            })?,
            8 => field.for_each_packed_u64(|x| {
                block.relation_member_roles.push(x as u32);
                Ok(())
            })?,
            9 => field.for_each_packed_i64(|x| {
                member_sum += x;
                block.relation_member_refs.push(member_sum);
                Ok(())
            })?,
            10 => field.for_each_packed_u64(|x| {
                block.relation_member_types.push(x as u8);
                Ok(())
            })?,
            _ => {}
        }
        Ok(Scan::Continue)
    })?;
    relation.send = block.relation_strings.len() as u32;
    relation.mend = block.relation_member_refs.len() as u32;
    let num_keys = (relation.send - relation.sset) as usize / 2;
    if num_keys != num_vals {
        warn!(
            "relation {}: {num_keys} keys but {num_vals} values",
            relation.id
        );
    }
    block.relations.push(relation);
    Ok(())
}
