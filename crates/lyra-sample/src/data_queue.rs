use std::collections::VecDeque;

use lyra_bufpool::{Allocation, Allocator};
use tracing::trace;

/// One link of the chunk chain: the byte range `[start, end)` of the
/// virtual stream, backed by an allocation once written to.
#[derive(Debug)]
struct AllocationNode {
    start: u64,
    end: u64,
    allocation: Option<Allocation>,
}

impl AllocationNode {
    fn new(start: u64, length: usize) -> Self {
        Self {
            start,
            end: start + length as u64,
            allocation: None,
        }
    }

    fn translate(&self, absolute: u64) -> usize {
        usize::try_from(absolute - self.start).unwrap_or(usize::MAX)
    }
}

/// A virtual append-only byte stream stored in leased chunks.
///
/// `nodes[0]` is the first node still holding data, the last node is the
/// write node. Only nodes up to and including the write node own an
/// allocation; the write node gets one lazily on first write.
#[derive(Debug)]
pub struct SampleDataQueue {
    allocator: Allocator,
    allocation_length: usize,
    nodes: VecDeque<AllocationNode>,
    /// Index into `nodes` of the read cursor.
    read_node: usize,
    total_bytes_written: u64,
}

impl SampleDataQueue {
    #[must_use]
    pub fn new(allocator: Allocator) -> Self {
        let allocation_length = allocator.individual_allocation_length();
        let mut nodes = VecDeque::new();
        nodes.push_back(AllocationNode::new(0, allocation_length));
        Self {
            allocator,
            allocation_length,
            nodes,
            read_node: 0,
            total_bytes_written: 0,
        }
    }

    #[must_use]
    pub fn total_bytes_written(&self) -> u64 {
        self.total_bytes_written
    }

    /// Absolute position of the first byte still retained.
    #[must_use]
    pub fn first_position(&self) -> u64 {
        self.nodes.front().map_or(self.total_bytes_written, |n| n.start)
    }

    fn write_node(&mut self) -> &mut AllocationNode {
        self.nodes
            .back_mut()
            .expect("sample data queue always has a write node")
    }

    /// Discard all data and return to a single empty node.
    pub fn reset(&mut self) {
        if self.total_bytes_written == 0 && self.nodes.len() == 1 && self.read_node == 0 {
            return;
        }
        self.clear_nodes_from(0);
        self.nodes
            .push_back(AllocationNode::new(0, self.allocation_length));
        self.read_node = 0;
        self.total_bytes_written = 0;
        trace!("SampleDataQueue: reset");
    }

    /// Move the read cursor back to the first retained node.
    pub fn rewind(&mut self) {
        self.read_node = 0;
    }

    /// Release every node from `index` onwards.
    fn clear_nodes_from(&mut self, index: usize) {
        let released: Vec<Allocation> = self
            .nodes
            .drain(index..)
            .filter_map(|node| node.allocation)
            .collect();
        if !released.is_empty() {
            self.allocator.release_all(released);
        }
    }

    /// Rewind the write position to `total_bytes_written`, dropping every
    /// byte after it.
    ///
    /// # Panics
    ///
    /// Panics if `total_bytes_written` is past the current write position.
    pub fn discard_upstream_sample_bytes(&mut self, total_bytes_written: u64) {
        assert!(
            total_bytes_written <= self.total_bytes_written,
            "upstream discard to {total_bytes_written} past write position {}",
            self.total_bytes_written
        );
        self.total_bytes_written = total_bytes_written;

        if total_bytes_written == 0 || total_bytes_written <= self.first_position() {
            self.clear_nodes_from(0);
            self.nodes
                .push_back(AllocationNode::new(total_bytes_written, self.allocation_length));
            self.read_node = 0;
            return;
        }

        // Last node holding at least one byte to keep.
        let keep = self
            .nodes
            .iter()
            .position(|node| total_bytes_written <= node.end)
            .unwrap_or(self.nodes.len() - 1);
        self.clear_nodes_from(keep + 1);
        let keep_end = self.nodes[keep].end;
        if total_bytes_written == keep_end {
            self.nodes
                .push_back(AllocationNode::new(keep_end, self.allocation_length));
        }
        self.read_node = self.read_node.min(self.nodes.len() - 1);
    }

    /// Release every node that ends at or before `absolute_position`.
    ///
    /// The only path that hands chunks back to the allocator before a reset.
    pub fn discard_downstream_to(&mut self, absolute_position: u64) {
        let mut released = Vec::new();
        while self.nodes.len() > 1 && absolute_position >= self.nodes[0].end {
            if let Some(node) = self.nodes.pop_front() {
                released.extend(node.allocation);
            }
            self.read_node = self.read_node.saturating_sub(1);
        }
        if !released.is_empty() {
            trace!(
                position = absolute_position,
                released = released.len(),
                "SampleDataQueue: discard downstream"
            );
            self.allocator.release_all(released);
        }
    }

    /// Bytes that can be written before the write node is full; leases the
    /// write node's chunk if it has none yet.
    fn pre_append(&mut self, length: usize) -> usize {
        let total = self.total_bytes_written;
        if self.write_node().allocation.is_none() {
            let allocation = self.allocator.allocate();
            self.write_node().allocation = Some(allocation);
        }
        let room = usize::try_from(self.write_node().end - total).unwrap_or(usize::MAX);
        length.min(room)
    }

    fn post_append(&mut self, length: usize) {
        self.total_bytes_written += length as u64;
        let end = self.write_node().end;
        if self.total_bytes_written == end {
            self.nodes
                .push_back(AllocationNode::new(end, self.allocation_length));
        }
    }

    /// Append up to the end of the write node. Returns bytes appended.
    pub fn sample_data_partial(&mut self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let length = self.pre_append(data.len());
        let total = self.total_bytes_written;
        let node = self.write_node();
        let offset = node.translate(total);
        if let Some(allocation) = node.allocation.as_mut() {
            allocation[offset..offset + length].copy_from_slice(&data[..length]);
        }
        self.post_append(length);
        length
    }

    /// Append all of `data`, splitting it across nodes.
    pub fn sample_data(&mut self, mut data: &[u8]) {
        while !data.is_empty() {
            let written = self.sample_data_partial(data);
            data = &data[written..];
        }
    }

    /// Let `fill` write at most `length` bytes straight into the write node.
    ///
    /// `fill` receives a slice no longer than the room left in the node and
    /// returns how many bytes it produced.
    ///
    /// # Errors
    ///
    /// Propagates the error of `fill`; nothing is appended in that case.
    pub fn sample_data_with<E, F>(&mut self, length: usize, fill: F) -> Result<usize, E>
    where
        F: FnOnce(&mut [u8]) -> Result<usize, E>,
    {
        if length == 0 {
            return Ok(0);
        }
        let length = self.pre_append(length);
        let total = self.total_bytes_written;
        let node = self.write_node();
        let offset = node.translate(total);
        let produced = match node.allocation.as_mut() {
            Some(allocation) => fill(&mut allocation[offset..offset + length])?,
            None => 0,
        };
        let produced = produced.min(length);
        self.post_append(produced);
        Ok(produced)
    }

    /// Copy `target.len()` bytes starting at `absolute_position` and move the
    /// read cursor to where the copy ended.
    pub fn read_to(&mut self, absolute_position: u64, target: &mut [u8]) {
        self.read_node = self.copy_out(self.read_node, absolute_position, target);
    }

    /// Like [`read_to`](Self::read_to) but leaves the read cursor alone.
    pub fn peek_to(&self, absolute_position: u64, target: &mut [u8]) {
        self.copy_out(self.read_node, absolute_position, target);
    }

    fn node_containing(&self, mut index: usize, absolute_position: u64) -> usize {
        if self.nodes[index].start > absolute_position {
            index = 0;
        }
        while absolute_position >= self.nodes[index].end {
            index += 1;
        }
        index
    }

    fn copy_out(&self, from_node: usize, mut position: u64, target: &mut [u8]) -> usize {
        let size = target.len() as u64;
        assert!(
            position >= self.first_position() && position + size <= self.total_bytes_written,
            "read of [{position}, {}) outside staged window [{}, {})",
            position + size,
            self.first_position(),
            self.total_bytes_written
        );
        if target.is_empty() {
            return from_node.min(self.nodes.len() - 1);
        }

        let mut index = self.node_containing(from_node.min(self.nodes.len() - 1), position);
        let mut copied = 0;
        while copied < target.len() {
            let node = &self.nodes[index];
            let available = usize::try_from(node.end - position).unwrap_or(usize::MAX);
            let count = available.min(target.len() - copied);
            let offset = node.translate(position);
            let chunk = node
                .allocation
                .as_ref()
                .expect("staged byte range is backed by an allocation");
            target[copied..copied + count].copy_from_slice(&chunk[offset..offset + count]);
            copied += count;
            position += count as u64;
            if position == node.end {
                index += 1;
            }
        }
        index
    }

    #[cfg(test)]
    pub(crate) fn node_count(&self) -> usize {
        self.nodes.len()
    }
}
