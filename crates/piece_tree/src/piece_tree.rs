use std::cell::RefCell;

use crate::buffer::{BufferCursor, StringBuffer};
use crate::cache::{CacheEntry, LastVisitedLine, SearchCache};
use crate::scanner::{
    create_line_starts_fast, replace_eol, strip_trailing_eol_range, trailing_eol_len,
};
use crate::tree::{NodeIdx, Piece, RbTree, SENTINEL};

/// Target size of a backing buffer in bytes. Text longer than this is split
/// into separate immutable buffers on insertion; shorter text is appended
/// to the change buffer. Shrunk under test so the chunking paths run.
pub const AVERAGE_BUFFER_SIZE: usize = if cfg!(test) { 16 } else { 65535 };

/// Document end-of-line sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndOfLine {
    Lf,
    CrLf,
}

impl EndOfLine {
    pub fn as_str(self) -> &'static str {
        match self {
            EndOfLine::Lf => "\n",
            EndOfLine::CrLf => "\r\n",
        }
    }

    pub fn len(self) -> usize {
        self.as_str().len()
    }
}

/// Where an absolute offset landed: a node, the offset within its piece,
/// and the absolute offset at which the piece starts.
#[derive(Debug, Clone, Copy)]
struct NodePosition {
    node: NodeIdx,
    remainder: usize,
    node_start_offset: usize,
}

fn start_with_lf_str(value: &str) -> bool {
    value.as_bytes().first() == Some(&b'\n')
}

fn end_with_cr_str(value: &str) -> bool {
    value.as_bytes().last() == Some(&b'\r')
}

/// A text buffer backed by immutable string chunks indexed by a red/black
/// tree whose in-order traversal yields the document.
///
/// Offsets are 0-based byte offsets. Lines and columns in the public query
/// methods are 1-based; the minimum column of a line is 1 and the maximum
/// is the line length plus one.
#[derive(Debug)]
pub struct PieceTree {
    buffers: Vec<StringBuffer>,
    tree: RbTree,
    length: usize,
    line_count: usize,
    eol: EndOfLine,
    eol_normalized: bool,
    /// Write end of the change buffer; pieces ending here may grow in place.
    last_change_buffer_pos: BufferCursor,
    search_cache: RefCell<SearchCache>,
    last_visited_line: RefCell<LastVisitedLine>,
}

impl PieceTree {
    pub fn new(chunks: Vec<StringBuffer>, eol: EndOfLine, eol_normalized: bool) -> Self {
        let mut tree = Self {
            buffers: Vec::new(),
            tree: RbTree::new(),
            length: 0,
            line_count: 1,
            eol,
            eol_normalized,
            last_change_buffer_pos: BufferCursor::default(),
            search_cache: RefCell::new(SearchCache::new(1)),
            last_visited_line: RefCell::new(LastVisitedLine::default()),
        };
        tree.create(chunks, eol, eol_normalized);
        tree
    }

    fn create(&mut self, chunks: Vec<StringBuffer>, eol: EndOfLine, eol_normalized: bool) {
        self.buffers = vec![StringBuffer::with_line_starts(String::new(), vec![0])];
        self.last_change_buffer_pos = BufferCursor::default();
        self.tree = RbTree::new();
        self.line_count = 1;
        self.length = 0;
        self.eol = eol;
        self.eol_normalized = eol_normalized;
        self.search_cache.borrow_mut().clear();
        self.reset_last_visited_line();

        // a \r ending one chunk and a \n starting the next must end up in
        // the same buffer, or the pieces would straddle the break
        let mut fixed: Vec<StringBuffer> = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            if chunk.is_empty() {
                continue;
            }
            let mut chunk = chunk;
            if let Some(prev) = fixed.last_mut() {
                if end_with_cr_str(&prev.buffer) && start_with_lf_str(&chunk.buffer) {
                    let mut joined = std::mem::take(&mut prev.buffer);
                    joined.push('\n');
                    *prev = StringBuffer::new(joined);
                    let rest = chunk.buffer[1..].to_string();
                    if rest.is_empty() {
                        continue;
                    }
                    chunk = StringBuffer::new(rest);
                }
            }
            fixed.push(chunk);
        }

        let mut last_node = SENTINEL;
        for chunk in fixed {
            let buffer_idx = self.buffers.len();
            let piece = Piece::new(
                buffer_idx,
                BufferCursor::default(),
                chunk.end_cursor(),
                chunk.len(),
                chunk.line_starts.len() - 1,
            );
            self.buffers.push(chunk);
            last_node = self.tree.rb_insert_right(last_node, piece);
        }
        self.compute_buffer_metadata();
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn line_count(&self) -> usize {
        self.line_count
    }

    pub fn eol(&self) -> EndOfLine {
        self.eol
    }

    pub fn is_eol_normalized(&self) -> bool {
        self.eol_normalized
    }

    /// Rebuilds every buffer under the new EOL sequence.
    pub fn set_eol(&mut self, eol: EndOfLine) {
        self.eol = eol;
        self.normalize_eol(eol);
    }

    // ---------- edits ----------

    /// Inserts `value` at `offset` (clamped to the document length).
    /// `eol_normalized` asserts that `value` only contains the document's
    /// EOL sequence; it is ANDed into the tree's flag.
    pub fn insert(&mut self, offset: usize, value: &str, eol_normalized: bool) {
        if value.is_empty() {
            return;
        }
        self.eol_normalized = self.eol_normalized && eol_normalized;
        self.reset_last_visited_line();
        let offset = offset.min(self.length);
        let value = value.to_string();

        if self.tree.root != SENTINEL {
            let NodePosition {
                node,
                remainder,
                node_start_offset,
            } = self.node_at(offset);
            let piece = self.tree.node(node).piece;

            if piece.buffer_idx == 0
                && piece.end == self.last_change_buffer_pos
                && node_start_offset + piece.length == offset
                && value.len() < AVERAGE_BUFFER_SIZE
            {
                // the insertion continues the previous edit; grow its piece
                self.append_to_node(node, value);
                self.compute_buffer_metadata();
                return;
            }

            if node_start_offset == offset {
                self.insert_content_to_node_left(value, node);
                self.search_cache.borrow_mut().validate(offset);
            } else if node_start_offset + piece.length > offset {
                // inserting into the middle of a node
                let mut nodes_to_del = Vec::new();
                let insert_pos = self.position_in_buffer(node, remainder);
                let mut new_right_piece = Piece::new(
                    piece.buffer_idx,
                    insert_pos,
                    piece.end,
                    self.offset_in_buffer(piece.buffer_idx, piece.end)
                        - self.offset_in_buffer(piece.buffer_idx, insert_pos),
                    self.get_line_feed_cnt(piece.buffer_idx, insert_pos, piece.end),
                );
                let mut value = value;

                if self.should_check_crlf()
                    && end_with_cr_str(&value)
                    && self.node_char_code_at(node, remainder) == Some(b'\n')
                {
                    // pull the right remnant's leading \n into the new text
                    let new_start = BufferCursor::new(new_right_piece.start.line + 1, 0);
                    new_right_piece = Piece::new(
                        new_right_piece.buffer_idx,
                        new_start,
                        new_right_piece.end,
                        new_right_piece.length - 1,
                        self.get_line_feed_cnt(
                            new_right_piece.buffer_idx,
                            new_start,
                            new_right_piece.end,
                        ),
                    );
                    value.push('\n');
                }

                if self.should_check_crlf() && start_with_lf_str(&value) {
                    if self.node_char_code_at(node, remainder - 1) == Some(b'\r') {
                        // pull the left remnant's trailing \r into the new text
                        let previous_pos = self.position_in_buffer(node, remainder - 1);
                        self.delete_node_tail(node, previous_pos);
                        value.insert(0, '\r');
                        if self.tree.node(node).piece.length == 0 {
                            nodes_to_del.push(node);
                        }
                    } else {
                        self.delete_node_tail(node, insert_pos);
                    }
                } else {
                    self.delete_node_tail(node, insert_pos);
                }

                let new_pieces = self.create_new_pieces(&value);
                if new_right_piece.length > 0 {
                    self.rb_insert_right(node, new_right_piece);
                }
                let mut tmp_node = node;
                for piece in new_pieces {
                    tmp_node = self.rb_insert_right(tmp_node, piece);
                }
                self.delete_nodes(nodes_to_del);
            } else {
                self.insert_content_to_node_right(value, node);
            }
        } else {
            let new_pieces = self.create_new_pieces(&value);
            let mut node = self.rb_insert_left(SENTINEL, new_pieces[0]);
            for piece in &new_pieces[1..] {
                node = self.rb_insert_right(node, *piece);
            }
        }
        self.compute_buffer_metadata();
    }

    /// Removes `cnt` bytes starting at `offset`. A zero count is a no-op;
    /// the range is clamped to the document length.
    pub fn delete(&mut self, offset: usize, cnt: usize) {
        self.reset_last_visited_line();
        if cnt == 0 || self.tree.root == SENTINEL || offset >= self.length {
            return;
        }
        let cnt = cnt.min(self.length - offset);

        let start_position = self.node_at(offset);
        let end_position = self.node_at(offset + cnt);
        let start_node = start_position.node;
        let end_node = end_position.node;

        if start_node == end_node {
            let start_split = self.position_in_buffer(start_node, start_position.remainder);
            let end_split = self.position_in_buffer(start_node, end_position.remainder);

            if start_position.node_start_offset == offset {
                if cnt == self.tree.node(start_node).piece.length {
                    let next = self.tree.next(start_node);
                    self.rb_delete(start_node);
                    self.validate_crlf_with_prev_node(next);
                    self.compute_buffer_metadata();
                    return;
                }
                self.delete_node_head(start_node, end_split);
                self.search_cache.borrow_mut().validate(offset);
                self.validate_crlf_with_prev_node(start_node);
                self.compute_buffer_metadata();
                return;
            }

            if start_position.node_start_offset + self.tree.node(start_node).piece.length
                == offset + cnt
            {
                self.delete_node_tail(start_node, start_split);
                self.validate_crlf_with_next_node(start_node);
                self.compute_buffer_metadata();
                return;
            }

            // the deleted range is interior; the node splits in two
            self.shrink_node(start_node, start_split, end_split);
            self.compute_buffer_metadata();
            return;
        }

        let mut nodes_to_del = Vec::new();
        let start_split = self.position_in_buffer(start_node, start_position.remainder);
        self.delete_node_tail(start_node, start_split);
        self.search_cache.borrow_mut().validate(offset);
        if self.tree.node(start_node).piece.length == 0 {
            nodes_to_del.push(start_node);
        }

        let end_split = self.position_in_buffer(end_node, end_position.remainder);
        self.delete_node_head(end_node, end_split);
        if self.tree.node(end_node).piece.length == 0 {
            nodes_to_del.push(end_node);
        }

        let mut node = self.tree.next(start_node);
        while node != SENTINEL && node != end_node {
            nodes_to_del.push(node);
            node = self.tree.next(node);
        }

        let prev = if self.tree.node(start_node).piece.length == 0 {
            self.tree.prev(start_node)
        } else {
            start_node
        };
        self.delete_nodes(nodes_to_del);
        self.validate_crlf_with_next_node(prev);
        self.compute_buffer_metadata();
    }

    fn insert_content_to_node_left(&mut self, value: String, node: NodeIdx) {
        // inserting content at the beginning of a node
        let mut nodes_to_del = Vec::new();
        let mut value = value;

        if self.should_check_crlf() && end_with_cr_str(&value) && self.start_with_lf_node(node) {
            // move the node's leading \n into the inserted text
            let piece = self.tree.node(node).piece;
            let new_start = BufferCursor::new(piece.start.line + 1, 0);
            let new_piece = Piece::new(
                piece.buffer_idx,
                new_start,
                piece.end,
                piece.length - 1,
                self.get_line_feed_cnt(piece.buffer_idx, new_start, piece.end),
            );
            self.tree.node_mut(node).piece = new_piece;
            value.push('\n');
            self.tree.update_metadata(node, -1, -1);
            if new_piece.length == 0 {
                nodes_to_del.push(node);
            }
        }

        let new_pieces = self.create_new_pieces(&value);
        let mut new_node = self.rb_insert_left(node, *new_pieces.last().unwrap());
        for piece in new_pieces[..new_pieces.len() - 1].iter().rev() {
            new_node = self.rb_insert_left(new_node, *piece);
        }
        self.validate_crlf_with_prev_node(new_node);
        self.delete_nodes(nodes_to_del);
    }

    fn insert_content_to_node_right(&mut self, value: String, node: NodeIdx) {
        // inserting content after a node's end
        let mut value = value;
        if self.adjust_carriage_return_from_next(&value, node) {
            value.push('\n');
        }

        let new_pieces = self.create_new_pieces(&value);
        let new_node = self.rb_insert_right(node, new_pieces[0]);
        let mut tmp_node = new_node;
        for piece in &new_pieces[1..] {
            tmp_node = self.rb_insert_right(tmp_node, *piece);
        }
        self.validate_crlf_with_prev_node(new_node);
    }

    /// Grows the piece that ends at the change buffer's write position by
    /// appending `value` to the change buffer in place.
    fn append_to_node(&mut self, node: NodeIdx, value: String) {
        let mut value = value;
        if self.adjust_carriage_return_from_next(&value, node) {
            value.push('\n');
        }

        let hit_crlf = self.should_check_crlf()
            && start_with_lf_str(&value)
            && self.end_with_cr_node(node);

        let start_offset = self.buffers[0].len();
        self.buffers[0].buffer.push_str(&value);
        let mut line_starts = create_line_starts_fast(&value);
        for line_start in line_starts.iter_mut() {
            *line_start += start_offset;
        }
        if hit_crlf {
            // the appended \n merges with the trailing \r already recorded
            // as a break; that break's line start moves past the \n
            let prev_start_offset = {
                let change = &mut self.buffers[0];
                let prev = change.line_starts[change.line_starts.len() - 2];
                change.line_starts.pop();
                prev
            };
            self.last_change_buffer_pos = BufferCursor::new(
                self.last_change_buffer_pos.line - 1,
                start_offset - prev_start_offset,
            );
        }
        self.buffers[0]
            .line_starts
            .extend_from_slice(&line_starts[1..]);

        let end_index = self.buffers[0].line_starts.len() - 1;
        let end_column = self.buffers[0].len() - self.buffers[0].line_starts[end_index];
        let new_end = BufferCursor::new(end_index, end_column);
        let piece = self.tree.node(node).piece;
        let new_length = piece.length + value.len();
        let new_lf = self.get_line_feed_cnt(0, piece.start, new_end);
        let lf_delta = new_lf as isize - piece.line_feed_cnt as isize;
        self.tree.node_mut(node).piece = Piece::new(0, piece.start, new_end, new_length, new_lf);
        self.last_change_buffer_pos = new_end;
        self.tree
            .update_metadata(node, value.len() as isize, lf_delta);
    }

    /// Turns `text` into pieces. Large text is split into fresh immutable
    /// buffers, never inside a `\r\n` pair or a multi-byte UTF-8 sequence;
    /// anything else is appended to the change buffer.
    fn create_new_pieces(&mut self, text: &str) -> Vec<Piece> {
        if text.len() > AVERAGE_BUFFER_SIZE {
            let mut new_pieces = Vec::new();
            let mut text = text;
            while text.len() > AVERAGE_BUFFER_SIZE {
                let mut split = AVERAGE_BUFFER_SIZE;
                while split > 0 && !text.is_char_boundary(split) {
                    split -= 1;
                }
                if split > 0 && text.as_bytes()[split - 1] == b'\r' {
                    // hold the \r back so a following \n lands in the same chunk
                    split -= 1;
                }
                if split == 0 {
                    split = text
                        .char_indices()
                        .nth(1)
                        .map(|(i, _)| i)
                        .unwrap_or(text.len());
                }
                new_pieces.push(self.register_chunk(&text[..split]));
                text = &text[split..];
            }
            new_pieces.push(self.register_chunk(text));
            return new_pieces;
        }

        let mut start_offset = self.buffers[0].len();
        let mut line_starts = create_line_starts_fast(text);
        let mut start = self.last_change_buffer_pos;

        if self.buffers[0].line_starts[self.buffers[0].line_starts.len() - 1] == start_offset
            && start_offset != 0
            && start_with_lf_str(text)
            && end_with_cr_str(&self.buffers[0].buffer)
        {
            // appending \n right after the buffer's trailing \r would merge
            // them into a break spanning two pieces; pad with a filler byte
            // no piece will ever address
            self.last_change_buffer_pos = BufferCursor::new(
                self.last_change_buffer_pos.line,
                self.last_change_buffer_pos.column + 1,
            );
            start = self.last_change_buffer_pos;
            for line_start in line_starts.iter_mut() {
                *line_start += start_offset + 1;
            }
            self.buffers[0]
                .line_starts
                .extend_from_slice(&line_starts[1..]);
            self.buffers[0].buffer.push('_');
            self.buffers[0].buffer.push_str(text);
            start_offset += 1;
        } else {
            if start_offset != 0 {
                for line_start in line_starts.iter_mut() {
                    *line_start += start_offset;
                }
            }
            self.buffers[0]
                .line_starts
                .extend_from_slice(&line_starts[1..]);
            self.buffers[0].buffer.push_str(text);
        }

        let end_offset = self.buffers[0].len();
        let end_index = self.buffers[0].line_starts.len() - 1;
        let end_column = end_offset - self.buffers[0].line_starts[end_index];
        let end_pos = BufferCursor::new(end_index, end_column);
        let piece = Piece::new(
            0,
            start,
            end_pos,
            end_offset - start_offset,
            self.get_line_feed_cnt(0, start, end_pos),
        );
        self.last_change_buffer_pos = end_pos;
        vec![piece]
    }

    fn register_chunk(&mut self, chunk: &str) -> Piece {
        let buffer = StringBuffer::new(chunk.to_string());
        let buffer_idx = self.buffers.len();
        let piece = Piece::new(
            buffer_idx,
            BufferCursor::default(),
            buffer.end_cursor(),
            buffer.len(),
            buffer.line_starts.len() - 1,
        );
        self.buffers.push(buffer);
        piece
    }

    // ---------- piece surgery ----------

    fn delete_node_tail(&mut self, node: NodeIdx, pos: BufferCursor) {
        let piece = self.tree.node(node).piece;
        let original_end_offset = self.offset_in_buffer(piece.buffer_idx, piece.end);
        let new_end_offset = self.offset_in_buffer(piece.buffer_idx, pos);
        let new_lf = self.get_line_feed_cnt(piece.buffer_idx, piece.start, pos);
        let lf_delta = new_lf as isize - piece.line_feed_cnt as isize;
        let size_delta = new_end_offset as isize - original_end_offset as isize;
        let new_length = (piece.length as isize + size_delta) as usize;
        self.tree.node_mut(node).piece =
            Piece::new(piece.buffer_idx, piece.start, pos, new_length, new_lf);
        self.tree.update_metadata(node, size_delta, lf_delta);
    }

    fn delete_node_head(&mut self, node: NodeIdx, pos: BufferCursor) {
        let piece = self.tree.node(node).piece;
        let original_start_offset = self.offset_in_buffer(piece.buffer_idx, piece.start);
        let new_start_offset = self.offset_in_buffer(piece.buffer_idx, pos);
        let new_lf = self.get_line_feed_cnt(piece.buffer_idx, pos, piece.end);
        let lf_delta = new_lf as isize - piece.line_feed_cnt as isize;
        let size_delta = original_start_offset as isize - new_start_offset as isize;
        let new_length = (piece.length as isize + size_delta) as usize;
        self.tree.node_mut(node).piece =
            Piece::new(piece.buffer_idx, pos, piece.end, new_length, new_lf);
        self.tree.update_metadata(node, size_delta, lf_delta);
    }

    /// Keeps `[piece.start, start)` in `node` and re-inserts
    /// `[end, piece.end)` as a new node to its right.
    fn shrink_node(&mut self, node: NodeIdx, start: BufferCursor, end: BufferCursor) {
        let piece = self.tree.node(node).piece;
        let original_end = piece.end;

        let new_lf = self.get_line_feed_cnt(piece.buffer_idx, piece.start, start);
        let new_length = self.offset_in_buffer(piece.buffer_idx, start)
            - self.offset_in_buffer(piece.buffer_idx, piece.start);
        let size_delta = new_length as isize - piece.length as isize;
        let lf_delta = new_lf as isize - piece.line_feed_cnt as isize;
        self.tree.node_mut(node).piece =
            Piece::new(piece.buffer_idx, piece.start, start, new_length, new_lf);
        self.tree.update_metadata(node, size_delta, lf_delta);

        let new_piece = Piece::new(
            piece.buffer_idx,
            end,
            original_end,
            self.offset_in_buffer(piece.buffer_idx, original_end)
                - self.offset_in_buffer(piece.buffer_idx, end),
            self.get_line_feed_cnt(piece.buffer_idx, end, original_end),
        );
        let new_node = self.rb_insert_right(node, new_piece);
        self.validate_crlf_with_prev_node(new_node);
    }

    fn rb_insert_left(&mut self, node: NodeIdx, piece: Piece) -> NodeIdx {
        self.tree.rb_insert_left(node, piece)
    }

    fn rb_insert_right(&mut self, node: NodeIdx, piece: Piece) -> NodeIdx {
        self.tree.rb_insert_right(node, piece)
    }

    fn rb_delete(&mut self, node: NodeIdx) {
        self.search_cache.borrow_mut().evict_node(node);
        self.tree.rb_delete(node);
    }

    fn delete_nodes(&mut self, nodes: Vec<NodeIdx>) {
        for node in nodes {
            self.rb_delete(node);
        }
    }

    // ---------- CRLF stitching ----------

    fn should_check_crlf(&self) -> bool {
        !(self.eol_normalized && self.eol == EndOfLine::Lf)
    }

    fn start_with_lf_node(&self, node: NodeIdx) -> bool {
        if node == SENTINEL || self.tree.node(node).piece.line_feed_cnt == 0 {
            return false;
        }
        let piece = self.tree.node(node).piece;
        let buffer = &self.buffers[piece.buffer_idx];
        let line = piece.start.line;
        let start_offset = buffer.line_starts[line] + piece.start.column;
        if line == buffer.line_starts.len() - 1 {
            // no break after the piece's first line in this buffer
            return false;
        }
        let next_line_offset = buffer.line_starts[line + 1];
        if next_line_offset > start_offset + 1 {
            return false;
        }
        buffer.buffer.as_bytes()[start_offset] == b'\n'
    }

    fn end_with_cr_node(&self, node: NodeIdx) -> bool {
        if node == SENTINEL || self.tree.node(node).piece.line_feed_cnt == 0 {
            return false;
        }
        let length = self.tree.node(node).piece.length;
        self.node_char_code_at(node, length - 1) == Some(b'\r')
    }

    /// If `value` ends with `\r` and the node after `node` starts with
    /// `\n`, consumes that `\n` (shrinking or deleting the next node) and
    /// returns true so the caller appends it to `value`.
    fn adjust_carriage_return_from_next(&mut self, value: &str, node: NodeIdx) -> bool {
        if !(self.should_check_crlf() && end_with_cr_str(value)) {
            return false;
        }
        let next_node = self.tree.next(node);
        if !self.start_with_lf_node(next_node) {
            return false;
        }
        if self.tree.node(next_node).piece.length == 1 {
            self.rb_delete(next_node);
        } else {
            let piece = self.tree.node(next_node).piece;
            let new_start = BufferCursor::new(piece.start.line + 1, 0);
            let new_piece = Piece::new(
                piece.buffer_idx,
                new_start,
                piece.end,
                piece.length - 1,
                self.get_line_feed_cnt(piece.buffer_idx, new_start, piece.end),
            );
            self.tree.node_mut(next_node).piece = new_piece;
            self.tree.update_metadata(next_node, -1, -1);
        }
        true
    }

    fn validate_crlf_with_prev_node(&mut self, next_node: NodeIdx) {
        if self.should_check_crlf() && self.start_with_lf_node(next_node) {
            let prev_node = self.tree.prev(next_node);
            if self.end_with_cr_node(prev_node) {
                self.fix_crlf(prev_node, next_node);
            }
        }
    }

    fn validate_crlf_with_next_node(&mut self, node: NodeIdx) {
        if self.should_check_crlf() && self.end_with_cr_node(node) {
            let next_node = self.tree.next(node);
            if self.start_with_lf_node(next_node) {
                self.fix_crlf(node, next_node);
            }
        }
    }

    /// Repairs a `\r` | `\n` seam: both halves are trimmed away and a fresh
    /// piece carrying a literal `\r\n` is inserted between them.
    fn fix_crlf(&mut self, prev: NodeIdx, next: NodeIdx) {
        let mut nodes_to_del = Vec::new();

        let prev_piece = self.tree.node(prev).piece;
        let new_end = if prev_piece.end.column == 0 {
            // the piece ended with a lone \r break
            let line_starts = &self.buffers[prev_piece.buffer_idx].line_starts;
            BufferCursor::new(
                prev_piece.end.line - 1,
                line_starts[prev_piece.end.line] - line_starts[prev_piece.end.line - 1] - 1,
            )
        } else {
            // the \r is the last byte of the piece's final partial line
            BufferCursor::new(prev_piece.end.line, prev_piece.end.column - 1)
        };
        let prev_new = Piece::new(
            prev_piece.buffer_idx,
            prev_piece.start,
            new_end,
            prev_piece.length - 1,
            prev_piece.line_feed_cnt - 1,
        );
        self.tree.node_mut(prev).piece = prev_new;
        self.tree.update_metadata(prev, -1, -1);
        if prev_new.length == 0 {
            nodes_to_del.push(prev);
        }

        let next_piece = self.tree.node(next).piece;
        let new_start = BufferCursor::new(next_piece.start.line + 1, 0);
        let next_new = Piece::new(
            next_piece.buffer_idx,
            new_start,
            next_piece.end,
            next_piece.length - 1,
            self.get_line_feed_cnt(next_piece.buffer_idx, new_start, next_piece.end),
        );
        self.tree.node_mut(next).piece = next_new;
        self.tree.update_metadata(next, -1, -1);
        if next_new.length == 0 {
            nodes_to_del.push(next);
        }

        let pieces = self.create_new_pieces("\r\n");
        self.rb_insert_right(prev, pieces[0]);
        self.delete_nodes(nodes_to_del);
    }

    // ---------- locating ----------

    fn node_at(&self, offset: usize) -> NodePosition {
        let cached = self.search_cache.borrow().get(offset, &self.tree);
        if let Some(entry) = cached {
            return NodePosition {
                node: entry.node,
                remainder: offset - entry.node_start_offset,
                node_start_offset: entry.node_start_offset,
            };
        }

        let mut offset = offset;
        let mut x = self.tree.root;
        let mut node_start_offset = 0;
        while x != SENTINEL {
            let n = self.tree.node(x);
            if n.size_left > offset {
                x = n.left;
            } else if n.size_left + n.piece.length >= offset {
                node_start_offset += n.size_left;
                let position = NodePosition {
                    node: x,
                    remainder: offset - n.size_left,
                    node_start_offset,
                };
                self.search_cache.borrow_mut().set(CacheEntry {
                    node: x,
                    node_start_offset,
                    node_start_line_number: None,
                });
                return position;
            } else {
                offset -= n.size_left + n.piece.length;
                node_start_offset += n.size_left + n.piece.length;
                x = n.right;
            }
        }
        NodePosition {
            node: SENTINEL,
            remainder: 0,
            node_start_offset: 0,
        }
    }

    fn node_at2(&self, line_number: usize, column: usize) -> NodePosition {
        if self.tree.root == SENTINEL {
            return NodePosition {
                node: SENTINEL,
                remainder: 0,
                node_start_offset: 0,
            };
        }
        let mut line_number = line_number.clamp(1, self.line_count);
        let mut column = column.max(1);

        let mut x = self.tree.root;
        let mut node_start_offset = 0;
        while x != SENTINEL {
            let n = self.tree.node(x);
            if n.left != SENTINEL && n.lf_left >= line_number - 1 {
                x = n.left;
            } else if n.lf_left + n.piece.line_feed_cnt > line_number - 1 {
                let prev_acc =
                    self.get_accumulated_value(x, line_number as isize - n.lf_left as isize - 2);
                let acc =
                    self.get_accumulated_value(x, line_number as isize - n.lf_left as isize - 1);
                node_start_offset += n.size_left;
                return NodePosition {
                    node: x,
                    remainder: (prev_acc + column - 1).min(acc),
                    node_start_offset,
                };
            } else if n.lf_left + n.piece.line_feed_cnt == line_number - 1 {
                let prev_acc =
                    self.get_accumulated_value(x, line_number as isize - n.lf_left as isize - 2);
                if prev_acc + column - 1 <= n.piece.length {
                    return NodePosition {
                        node: x,
                        remainder: prev_acc + column - 1,
                        node_start_offset: node_start_offset + n.size_left,
                    };
                }
                // the requested column continues in following nodes
                column -= n.piece.length - prev_acc;
                break;
            } else {
                line_number -= n.lf_left + n.piece.line_feed_cnt;
                node_start_offset += n.size_left + n.piece.length;
                x = n.right;
            }
        }

        let mut x = self.tree.next(x);
        while x != SENTINEL {
            let n = self.tree.node(x);
            if n.piece.line_feed_cnt > 0 {
                let acc = self.get_accumulated_value(x, 0);
                return NodePosition {
                    node: x,
                    remainder: (column - 1).min(acc),
                    node_start_offset: self.offset_of_node(x),
                };
            }
            if n.piece.length >= column - 1 {
                return NodePosition {
                    node: x,
                    remainder: column - 1,
                    node_start_offset: self.offset_of_node(x),
                };
            }
            column -= n.piece.length;
            x = self.tree.next(x);
        }

        // the column overran the document; land at the very end
        let last = self.tree.rightest(self.tree.root);
        NodePosition {
            node: last,
            remainder: self.tree.node(last).piece.length,
            node_start_offset: self.offset_of_node(last),
        }
    }

    /// Converts an offset within a node's piece to a cursor in its buffer
    /// by binary-searching the buffer's line starts.
    fn position_in_buffer(&self, node: NodeIdx, remainder: usize) -> BufferCursor {
        let piece = self.tree.node(node).piece;
        let line_starts = &self.buffers[piece.buffer_idx].line_starts;

        let start_offset = line_starts[piece.start.line] + piece.start.column;
        let end_offset = line_starts[piece.end.line] + piece.end.column;
        let target = (start_offset + remainder).min(end_offset);

        let mut low = piece.start.line;
        let mut high = piece.end.line;
        let mut mid = low;
        while low <= high {
            mid = low + (high - low) / 2;
            if mid == high {
                break;
            }
            let mid_start = line_starts[mid];
            let mid_stop = line_starts[mid + 1];
            if target < mid_start {
                high = mid - 1;
            } else if target >= mid_stop {
                low = mid + 1;
            } else {
                break;
            }
        }

        BufferCursor::new(mid, target - line_starts[mid])
    }

    fn offset_in_buffer(&self, buffer_idx: usize, cursor: BufferCursor) -> usize {
        self.buffers[buffer_idx].offset_of(cursor)
    }

    fn offset_of_node(&self, node: NodeIdx) -> usize {
        if node == SENTINEL {
            return 0;
        }
        let mut pos = self.tree.node(node).size_left;
        let mut node = node;
        while node != self.tree.root {
            let parent = self.tree.node(node).parent;
            if self.tree.node(parent).right == node {
                pos += self.tree.node(parent).size_left + self.tree.node(parent).piece.length;
            }
            node = parent;
        }
        pos
    }

    /// Line breaks whose final byte lies in `(start, end]` of the buffer.
    /// A `\r\n` whose `\r` sits exactly at `end` counts as one break inside
    /// the range.
    fn get_line_feed_cnt(
        &self,
        buffer_idx: usize,
        start: BufferCursor,
        end: BufferCursor,
    ) -> usize {
        if end.column == 0 {
            return end.line - start.line;
        }

        let buffer = &self.buffers[buffer_idx];
        if end.line == buffer.line_starts.len() - 1 {
            // no breaks after end in this buffer
            return end.line - start.line;
        }

        let next_line_start_offset = buffer.line_starts[end.line + 1];
        let end_offset = buffer.line_starts[end.line] + end.column;
        if next_line_start_offset > end_offset + 1 {
            // the next break ends more than one byte past end
            return end.line - start.line;
        }

        // the byte at end_offset is \n; does its \r fall inside the range?
        if end_offset > 0 && buffer.buffer.as_bytes()[end_offset - 1] == b'\r' {
            end.line - start.line + 1
        } else {
            end.line - start.line
        }
    }

    /// Bytes from the piece's start through its `index`-th line break,
    /// clamped to the piece's end; zero when `index` is negative.
    fn get_accumulated_value(&self, node: NodeIdx, index: isize) -> usize {
        if index < 0 {
            return 0;
        }
        let piece = self.tree.node(node).piece;
        let line_starts = &self.buffers[piece.buffer_idx].line_starts;
        let expected_line_start_index = piece.start.line + index as usize + 1;
        if expected_line_start_index > piece.end.line {
            line_starts[piece.end.line] + piece.end.column
                - line_starts[piece.start.line]
                - piece.start.column
        } else {
            line_starts[expected_line_start_index]
                - line_starts[piece.start.line]
                - piece.start.column
        }
    }

    /// For an offset within a node's piece: how many line breaks precede it
    /// inside the piece, and the byte remainder within that line.
    fn get_index_of(&self, node: NodeIdx, accumulated_value: usize) -> (usize, usize) {
        let piece = self.tree.node(node).piece;
        let pos = self.position_in_buffer(node, accumulated_value);
        let line_cnt = pos.line - piece.start.line;

        if self.offset_in_buffer(piece.buffer_idx, piece.end)
            - self.offset_in_buffer(piece.buffer_idx, piece.start)
            == accumulated_value
        {
            // at the very end of the node a \r\n spanning the piece boundary
            // counts one more break than the line arithmetic suggests
            let real_line_cnt = self.get_line_feed_cnt(piece.buffer_idx, piece.start, pos);
            if real_line_cnt != line_cnt {
                return (real_line_cnt, 0);
            }
        }

        (line_cnt, pos.column)
    }

    fn node_char_code_at(&self, node: NodeIdx, offset: usize) -> Option<u8> {
        let piece = self.tree.node(node).piece;
        if piece.line_feed_cnt < 1 {
            return None;
        }
        let buffer = &self.buffers[piece.buffer_idx];
        let byte_offset = buffer.offset_of(piece.start) + offset;
        buffer.buffer.as_bytes().get(byte_offset).copied()
    }

    // ---------- coordinate conversion ----------

    /// 1-based `(line, column)` to 0-based offset.
    pub fn get_offset_at(&self, line_number: usize, column: usize) -> usize {
        if line_number == 0 {
            return 0;
        }
        let mut line_number = line_number;
        let mut left_len = 0;
        let mut x = self.tree.root;

        while x != SENTINEL {
            let n = self.tree.node(x);
            if n.left != SENTINEL && n.lf_left + 1 >= line_number {
                x = n.left;
            } else if n.lf_left + n.piece.line_feed_cnt + 1 >= line_number {
                left_len += n.size_left;
                let index = line_number as isize - n.lf_left as isize - 2;
                let acc = self.get_accumulated_value(x, index);
                return (left_len + acc + column.saturating_sub(1)).min(self.length);
            } else {
                line_number -= n.lf_left + n.piece.line_feed_cnt;
                left_len += n.size_left + n.piece.length;
                x = n.right;
            }
        }

        left_len
    }

    /// 0-based offset to 1-based `(line, column)` position.
    pub fn get_position_at(&self, offset: usize) -> BufferCursor {
        let mut offset = offset.min(self.length);
        let original_offset = offset;
        let mut x = self.tree.root;
        let mut lf_cnt = 0;

        while x != SENTINEL {
            let n = self.tree.node(x);
            if n.size_left != 0 && n.size_left >= offset {
                x = n.left;
            } else if n.size_left + n.piece.length >= offset {
                let (index, remainder) = self.get_index_of(x, offset - n.size_left);
                lf_cnt += n.lf_left + index;
                if index == 0 {
                    // still on the line the node starts on
                    let line_start_offset = self.get_offset_at(lf_cnt + 1, 1);
                    let column = original_offset - line_start_offset;
                    return BufferCursor::new(lf_cnt + 1, column + 1);
                }
                return BufferCursor::new(lf_cnt + 1, remainder + 1);
            } else {
                offset -= n.size_left + n.piece.length;
                lf_cnt += n.lf_left + n.piece.line_feed_cnt;
                if n.right == SENTINEL {
                    let line_start_offset = self.get_offset_at(lf_cnt + 1, 1);
                    let column = original_offset - offset - line_start_offset;
                    return BufferCursor::new(lf_cnt + 1, column + 1);
                }
                x = n.right;
            }
        }

        BufferCursor::new(1, 1)
    }

    // ---------- content retrieval ----------

    fn get_node_content(&self, node: NodeIdx) -> &str {
        let piece = &self.tree.node(node).piece;
        let buffer = &self.buffers[piece.buffer_idx];
        let start = buffer.offset_of(piece.start);
        let end = buffer.offset_of(piece.end);
        &buffer.buffer[start..end]
    }

    /// Full document text via one in-order traversal.
    pub fn get_text(&self) -> String {
        let mut text = String::with_capacity(self.length);
        self.iterate(|piece| {
            text.push_str(piece);
            true
        });
        text
    }

    /// Content between two 1-based document positions. When `eol` is given
    /// and differs from the document EOL, or the document is not known to
    /// be normalized, line terminators in the result are rewritten.
    pub fn get_value_in_range(
        &self,
        start: BufferCursor,
        end: BufferCursor,
        eol: Option<EndOfLine>,
    ) -> String {
        if (start.line, start.column) >= (end.line, end.column) {
            return String::new();
        }
        let start_position = self.node_at2(start.line, start.column);
        let end_position = self.node_at2(end.line, end.column);
        let value = self.get_value_in_range2(&start_position, &end_position);
        match eol {
            Some(eol) if eol != self.eol || !self.eol_normalized => {
                replace_eol(&value, eol.as_str())
            }
            _ => value,
        }
    }

    fn get_value_in_range2(&self, start: &NodePosition, end: &NodePosition) -> String {
        if start.node == SENTINEL {
            return String::new();
        }
        if start.node == end.node {
            let piece = self.tree.node(start.node).piece;
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            return buffer.buffer[start_offset + start.remainder..start_offset + end.remainder]
                .to_string();
        }

        let mut x = start.node;
        let piece = self.tree.node(x).piece;
        let buffer = &self.buffers[piece.buffer_idx];
        let start_offset = buffer.offset_of(piece.start);
        let mut value =
            buffer.buffer[start_offset + start.remainder..start_offset + piece.length].to_string();

        x = self.tree.next(x);
        while x != SENTINEL {
            let piece = self.tree.node(x).piece;
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            if x == end.node {
                value.push_str(&buffer.buffer[start_offset..start_offset + end.remainder]);
                break;
            }
            value.push_str(&buffer.buffer[start_offset..start_offset + piece.length]);
            x = self.tree.next(x);
        }
        value
    }

    /// All lines without their terminators. A `\r` ending one piece and a
    /// `\n` starting the next merge into a single break, keeping this walk
    /// independent of the stitching repair.
    pub fn get_lines_content(&self) -> Vec<String> {
        let mut lines: Vec<String> = Vec::new();
        let mut current_line = String::new();
        let mut dangling_cr = false;

        let mut x = if self.tree.root == SENTINEL {
            SENTINEL
        } else {
            self.tree.leftest(self.tree.root)
        };
        while x != SENTINEL {
            self.collect_lines(x, &mut lines, &mut current_line, &mut dangling_cr);
            x = self.tree.next(x);
        }

        if dangling_cr {
            lines.push(std::mem::take(&mut current_line));
        }
        lines.push(current_line);
        lines
    }

    fn collect_lines(
        &self,
        node: NodeIdx,
        lines: &mut Vec<String>,
        current_line: &mut String,
        dangling_cr: &mut bool,
    ) {
        let piece = self.tree.node(node).piece;
        let mut piece_length = piece.length;
        if piece_length == 0 {
            return;
        }

        let buffer = &self.buffers[piece.buffer_idx].buffer;
        let line_starts = &self.buffers[piece.buffer_idx].line_starts;
        let bytes = buffer.as_bytes();
        let mut piece_start_line = piece.start.line;
        let piece_end_line = piece.end.line;
        let mut piece_start_offset = line_starts[piece_start_line] + piece.start.column;

        if *dangling_cr {
            if bytes[piece_start_offset] == b'\n' {
                // pretend the \n was in the previous piece; the rest of
                // this piece begins on the following buffer line
                piece_start_offset += 1;
                piece_length -= 1;
                piece_start_line += 1;
            }
            lines.push(std::mem::take(current_line));
            *dangling_cr = false;
            if piece_length == 0 {
                return;
            }
        }

        if piece_start_line == piece_end_line {
            // no line break ends inside this piece
            if !self.eol_normalized && bytes[piece_start_offset + piece_length - 1] == b'\r' {
                *dangling_cr = true;
                current_line
                    .push_str(&buffer[piece_start_offset..piece_start_offset + piece_length - 1]);
            } else {
                current_line
                    .push_str(&buffer[piece_start_offset..piece_start_offset + piece_length]);
            }
            return;
        }

        // text before the first line start inside this piece
        let seg_end = if self.eol_normalized {
            (line_starts[piece_start_line + 1] - self.eol.len()).max(piece_start_offset)
        } else {
            strip_trailing_eol_range(buffer, piece_start_offset, line_starts[piece_start_line + 1])
        };
        current_line.push_str(&buffer[piece_start_offset..seg_end]);
        lines.push(std::mem::take(current_line));

        for line in (piece_start_line + 1)..piece_end_line {
            let line_end = if self.eol_normalized {
                line_starts[line + 1] - self.eol.len()
            } else {
                strip_trailing_eol_range(buffer, line_starts[line], line_starts[line + 1])
            };
            lines.push(buffer[line_starts[line]..line_end].to_string());
        }

        let end_line_start = line_starts[piece_end_line];
        if !self.eol_normalized && bytes[end_line_start + piece.end.column - 1] == b'\r' {
            *dangling_cr = true;
            if piece.end.column == 0 {
                // the last full line ended with a lone \r; undo its push so
                // the break can merge with a following \n
                *current_line = lines.pop().unwrap_or_default();
            } else {
                *current_line =
                    buffer[end_line_start..end_line_start + piece.end.column - 1].to_string();
            }
        } else {
            *current_line = buffer[end_line_start..end_line_start + piece.end.column].to_string();
        }
    }

    /// Content of line `line_number` without its terminator.
    pub fn get_line_content(&self, line_number: usize) -> String {
        if line_number == 0 || line_number > self.line_count {
            return String::new();
        }
        {
            let cache = self.last_visited_line.borrow();
            if cache.line_number == line_number {
                return cache.value.clone();
            }
        }

        let value = if line_number == self.line_count {
            self.get_line_raw_content(line_number, 0)
        } else if self.eol_normalized {
            self.get_line_raw_content(line_number, self.eol.len())
        } else {
            let mut raw = self.get_line_raw_content(line_number, 0);
            let strip = trailing_eol_len(&raw);
            raw.truncate(raw.len() - strip);
            raw
        };

        let mut cache = self.last_visited_line.borrow_mut();
        cache.line_number = line_number;
        cache.value = value.clone();
        value
    }

    /// Content of line `line_number` including its terminator, minus
    /// `end_offset` trailing bytes.
    pub fn get_line_raw_content(&self, line_number: usize, end_offset: usize) -> String {
        if self.tree.root == SENTINEL || line_number == 0 || line_number > self.line_count {
            return String::new();
        }

        let mut x;
        let mut ret;
        let cached = self.search_cache.borrow().get2(line_number, &self.tree);

        if let Some(cache) = cached {
            x = cache.node;
            let node_start_line = cache.node_start_line_number.unwrap_or(0);
            let prev_acc =
                self.get_accumulated_value(x, line_number as isize - node_start_line as isize - 1);
            let piece = self.tree.node(x).piece;
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            if node_start_line + piece.line_feed_cnt == line_number {
                // the line runs past this piece
                ret = buffer.buffer[start_offset + prev_acc..start_offset + piece.length]
                    .to_string();
            } else {
                let acc = self
                    .get_accumulated_value(x, line_number as isize - node_start_line as isize);
                return buffer.buffer[start_offset + prev_acc..start_offset + acc - end_offset]
                    .to_string();
            }
        } else {
            x = self.tree.root;
            let mut line_number = line_number;
            let mut node_start_offset = 0;
            let original_line_number = line_number;
            ret = String::new();
            while x != SENTINEL {
                let n = self.tree.node(x);
                let lf_left = n.lf_left;
                let size_left = n.size_left;
                let piece = n.piece;
                if n.left != SENTINEL && lf_left >= line_number - 1 {
                    x = n.left;
                } else if lf_left + piece.line_feed_cnt > line_number - 1 {
                    let prev_acc = self
                        .get_accumulated_value(x, line_number as isize - lf_left as isize - 2);
                    let acc = self
                        .get_accumulated_value(x, line_number as isize - lf_left as isize - 1);
                    let buffer = &self.buffers[piece.buffer_idx];
                    let start_offset = buffer.offset_of(piece.start);
                    node_start_offset += size_left;
                    self.search_cache.borrow_mut().set(CacheEntry {
                        node: x,
                        node_start_offset,
                        node_start_line_number: Some(
                            original_line_number - (line_number - 1 - lf_left),
                        ),
                    });
                    return buffer.buffer[start_offset + prev_acc..start_offset + acc - end_offset]
                        .to_string();
                } else if lf_left + piece.line_feed_cnt == line_number - 1 {
                    // the line starts here and continues in later nodes
                    let prev_acc = self
                        .get_accumulated_value(x, line_number as isize - lf_left as isize - 2);
                    let buffer = &self.buffers[piece.buffer_idx];
                    let start_offset = buffer.offset_of(piece.start);
                    ret = buffer.buffer[start_offset + prev_acc..start_offset + piece.length]
                        .to_string();
                    break;
                } else {
                    line_number -= lf_left + piece.line_feed_cnt;
                    node_start_offset += size_left + piece.length;
                    x = n.right;
                }
            }
        }

        // walk forward to the break that ends the line
        let mut x = self.tree.next(x);
        while x != SENTINEL {
            let piece = self.tree.node(x).piece;
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            if piece.line_feed_cnt > 0 {
                let acc = self.get_accumulated_value(x, 0);
                ret.push_str(&buffer.buffer[start_offset..start_offset + acc - end_offset]);
                return ret;
            }
            ret.push_str(&buffer.buffer[start_offset..start_offset + piece.length]);
            x = self.tree.next(x);
        }

        ret
    }

    /// Byte length of line `line_number`, terminator excluded.
    pub fn get_line_length(&self, line_number: usize) -> usize {
        self.get_line_content(line_number).len()
    }

    /// Byte at `offset`, if in range.
    pub fn char_code_at(&self, offset: usize) -> Option<u8> {
        if self.tree.root == SENTINEL || offset >= self.length {
            return None;
        }
        let node_pos = self.node_at(offset);
        self.get_char_code(&node_pos)
    }

    /// Byte at 0-based `index` within line `line_number`.
    pub fn get_line_char_code(&self, line_number: usize, index: usize) -> Option<u8> {
        if self.tree.root == SENTINEL {
            return None;
        }
        let node_pos = self.node_at2(line_number, index + 1);
        self.get_char_code(&node_pos)
    }

    fn get_char_code(&self, node_pos: &NodePosition) -> Option<u8> {
        if node_pos.node == SENTINEL {
            return None;
        }
        if node_pos.remainder == self.tree.node(node_pos.node).piece.length {
            // the byte sits at the head of the next node
            let matching_node = self.tree.next(node_pos.node);
            if matching_node == SENTINEL {
                return None;
            }
            let piece = self.tree.node(matching_node).piece;
            let buffer = &self.buffers[piece.buffer_idx];
            let start_offset = buffer.offset_of(piece.start);
            return buffer.buffer.as_bytes().get(start_offset).copied();
        }
        let piece = self.tree.node(node_pos.node).piece;
        let buffer = &self.buffers[piece.buffer_idx];
        let start_offset = buffer.offset_of(piece.start) + node_pos.remainder;
        buffer.buffer.as_bytes().get(start_offset).copied()
    }

    /// In-order visit over piece contents; stops when `visit` returns
    /// false. Returns whether the walk ran to completion. The visitor gets
    /// a shared view and cannot mutate the tree.
    pub fn iterate<F: FnMut(&str) -> bool>(&self, mut visit: F) -> bool {
        self.iterate_node(self.tree.root, &mut visit)
    }

    fn iterate_node<F: FnMut(&str) -> bool>(&self, node: NodeIdx, visit: &mut F) -> bool {
        if node == SENTINEL {
            return true;
        }
        if !self.iterate_node(self.tree.node(node).left, visit) {
            return false;
        }
        if !visit(self.get_node_content(node)) {
            return false;
        }
        self.iterate_node(self.tree.node(node).right, visit)
    }

    /// Content equality regardless of chunking: walks this tree's pieces
    /// and compares each against the other tree's content at that range.
    pub fn equal(&self, other: &PieceTree) -> bool {
        if self.length != other.length || self.line_count != other.line_count {
            return false;
        }
        let mut offset = 0;
        self.iterate(|content| {
            if content.is_empty() {
                return true;
            }
            let start = other.node_at(offset);
            let end = other.node_at(offset + content.len());
            let value = other.get_value_in_range2(&start, &end);
            offset += content.len();
            content == value
        })
    }

    // ---------- maintenance ----------

    /// Walks the right spine to refresh the O(1) running totals.
    fn compute_buffer_metadata(&mut self) {
        let mut x = self.tree.root;
        let mut lf_cnt = 1;
        let mut len = 0;

        while x != SENTINEL {
            let n = self.tree.node(x);
            lf_cnt += n.lf_left + n.piece.line_feed_cnt;
            len += n.size_left + n.piece.length;
            x = n.right;
        }

        self.line_count = lf_cnt;
        self.length = len;
    }

    /// Re-chunks the whole document into evenly sized buffers with every
    /// line break rewritten to `eol`, then rebuilds the tree.
    fn normalize_eol(&mut self, eol: EndOfLine) {
        let average_buffer_size = AVERAGE_BUFFER_SIZE;
        let min = average_buffer_size - average_buffer_size / 3;
        let max = min * 2;

        let mut temp_chunk = String::new();
        let mut chunks: Vec<StringBuffer> = Vec::new();
        let mut x = if self.tree.root == SENTINEL {
            SENTINEL
        } else {
            self.tree.leftest(self.tree.root)
        };
        while x != SENTINEL {
            let content = self.get_node_content(x);
            let len = content.len();
            if temp_chunk.len() <= min || temp_chunk.len() + len < max {
                temp_chunk.push_str(content);
            } else {
                let text = replace_eol(&temp_chunk, eol.as_str());
                chunks.push(StringBuffer::new(text));
                temp_chunk = content.to_string();
            }
            x = self.tree.next(x);
        }
        if !temp_chunk.is_empty() {
            let text = replace_eol(&temp_chunk, eol.as_str());
            chunks.push(StringBuffer::new(text));
        }

        self.create(chunks, eol, true);
    }

    fn reset_last_visited_line(&self) {
        let mut cache = self.last_visited_line.borrow_mut();
        cache.line_number = 0;
        cache.value.clear();
    }

    // ---------- validation ----------

    /// Checks the red/black properties, the augmented sums, the running
    /// totals, piece bounds, and the CRLF seam invariant. A test aid;
    /// panics on the first violation.
    pub fn assert_invariants(&self) {
        let sentinel = self.tree.node(SENTINEL);
        assert_eq!(sentinel.size_left, 0, "sentinel size_left");
        assert_eq!(sentinel.lf_left, 0, "sentinel lf_left");
        assert_eq!(sentinel.parent, SENTINEL, "sentinel parent");

        if self.tree.root == SENTINEL {
            assert_eq!(self.length, 0);
            assert_eq!(self.line_count, 1);
            return;
        }

        assert_eq!(
            self.tree.node(self.tree.root).parent,
            SENTINEL,
            "root parent"
        );
        let (total_size, total_lf, _) = self.validate_node(self.tree.root);
        assert_eq!(self.length, total_size, "tree length total");
        assert_eq!(self.line_count, total_lf + 1, "tree line count total");

        // adjacent pieces must never split a \r\n
        let mut prev = SENTINEL;
        let mut x = self.tree.leftest(self.tree.root);
        while x != SENTINEL {
            if prev != SENTINEL {
                let a = self.get_node_content(prev);
                let b = self.get_node_content(x);
                assert!(
                    !(a.ends_with('\r') && b.starts_with('\n')),
                    "\\r\\n split across adjacent pieces"
                );
            }
            if self.eol_normalized && self.eol == EndOfLine::Lf {
                assert!(
                    !self.get_node_content(x).contains('\r'),
                    "\\r in a \\n-normalized document"
                );
            }
            prev = x;
            x = self.tree.next(x);
        }
    }

    fn validate_node(&self, node: NodeIdx) -> (usize, usize, usize) {
        use crate::tree::NodeColor;

        if node == SENTINEL {
            return (0, 0, 1);
        }
        let n = self.tree.node(node);
        let piece = n.piece;
        let (color, left, right, size_left, lf_left) =
            (n.color, n.left, n.right, n.size_left, n.lf_left);

        if color == NodeColor::Red {
            assert_eq!(
                self.tree.node(left).color,
                NodeColor::Black,
                "red node with red left child"
            );
            assert_eq!(
                self.tree.node(right).color,
                NodeColor::Black,
                "red node with red right child"
            );
        }
        if left != SENTINEL {
            assert_eq!(self.tree.node(left).parent, node, "left child parent");
        }
        if right != SENTINEL {
            assert_eq!(self.tree.node(right).parent, node, "right child parent");
        }

        assert!(piece.length > 0, "empty piece left in the tree");
        let buffer = &self.buffers[piece.buffer_idx];
        let start_offset = buffer.offset_of(piece.start);
        let end_offset = buffer.offset_of(piece.end);
        assert!(start_offset <= end_offset && end_offset <= buffer.len());
        assert_eq!(piece.length, end_offset - start_offset, "piece length");
        assert_eq!(
            piece.line_feed_cnt,
            self.get_line_feed_cnt(piece.buffer_idx, piece.start, piece.end),
            "piece line feed count"
        );

        let (left_size, left_lf, left_height) = self.validate_node(left);
        let (right_size, right_lf, right_height) = self.validate_node(right);
        assert_eq!(size_left, left_size, "size_left");
        assert_eq!(lf_left, left_lf, "lf_left");
        assert_eq!(left_height, right_height, "black height");

        let height = if color == NodeColor::Black {
            left_height + 1
        } else {
            left_height
        };
        (
            left_size + piece.length + right_size,
            left_lf + piece.line_feed_cnt + right_lf,
            height,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::create_line_starts;

    fn build(chunks: &[&str]) -> PieceTree {
        PieceTree::new(
            chunks.iter().map(|c| StringBuffer::new(c.to_string())).collect(),
            EndOfLine::Lf,
            false,
        )
    }

    fn empty() -> PieceTree {
        build(&[])
    }

    /// Splits a shadow string into lines the way the tree counts them:
    /// `\r\n`, `\r`, and `\n` each end a line.
    fn split_lines(text: &str) -> Vec<String> {
        let scan = create_line_starts(text);
        let mut lines = Vec::with_capacity(scan.line_starts.len());
        for (i, &start) in scan.line_starts.iter().enumerate() {
            let end = if i + 1 < scan.line_starts.len() {
                strip_trailing_eol_range(text, start, scan.line_starts[i + 1])
            } else {
                text.len()
            };
            lines.push(text[start..end].to_string());
        }
        lines
    }

    /// Full shadow check: content, totals, invariants, line retrieval, and
    /// coordinate round trips.
    fn assert_doc(tree: &PieceTree, expected: &str) {
        tree.assert_invariants();
        assert_eq!(tree.get_text(), expected);
        assert_eq!(tree.len(), expected.len());

        let expected_lines = split_lines(expected);
        assert_eq!(tree.line_count(), expected_lines.len());
        assert_eq!(tree.get_lines_content(), expected_lines);
        for (i, line) in expected_lines.iter().enumerate() {
            assert_eq!(&tree.get_line_content(i + 1), line, "line {}", i + 1);
            assert_eq!(tree.get_line_length(i + 1), line.len());
        }

        for offset in 0..=expected.len() {
            let pos = tree.get_position_at(offset);
            assert_eq!(
                tree.get_offset_at(pos.line, pos.column),
                offset,
                "offset {} -> ({}, {})",
                offset,
                pos.line,
                pos.column
            );
        }
    }

    #[test]
    fn lines_basic_unix() {
        let tree = build(&["Hello\nWorld"]);
        assert_eq!(tree.get_lines_content(), vec!["Hello", "World"]);
        assert_eq!(tree.get_line_content(1), "Hello");
        assert_eq!(tree.get_line_content(2), "World");
        assert_eq!(tree.get_line_content(3), "");
    }

    #[test]
    fn lines_crlf_single_buffer() {
        let tree = build(&["abc\r\ndef\r\nxyz"]);
        assert_eq!(tree.get_lines_content(), vec!["abc", "def", "xyz"]);
        assert_eq!(tree.line_count(), 3);
    }

    #[test]
    fn lines_multiple_chunks() {
        let tree = build(&["foo\n", "bar\nbaz"]);
        assert_eq!(tree.get_lines_content(), vec!["foo", "bar", "baz"]);
        assert_doc(&tree, "foo\nbar\nbaz");
    }

    #[test]
    fn lines_chunk_split_inside_crlf() {
        // a \r ending one chunk and a \n starting the next count as one break
        let tree = build(&["abc\r", "\ndef"]);
        assert_eq!(tree.line_count(), 2);
        assert_eq!(tree.get_lines_content(), vec!["abc", "def"]);
    }

    #[test]
    fn lines_trailing_newline() {
        let tree = build(&["a\nb\n"]);
        assert_eq!(tree.get_lines_content(), vec!["a", "b", ""]);
        assert_eq!(tree.get_line_content(3), "");
    }

    #[test]
    fn insert_into_empty_and_append() {
        let mut tree = empty();
        tree.insert(0, "Hello\nWorld", false);
        assert_doc(&tree, "Hello\nWorld");

        tree.insert(5, " Rust", false);
        assert_doc(&tree, "Hello Rust\nWorld");

        let end = tree.len();
        tree.insert(end, "\n!!!", false);
        assert_doc(&tree, "Hello Rust\nWorld\n!!!");
    }

    #[test]
    fn insert_begin_middle_end_positions() {
        let mut tree = empty();
        tree.insert(0, "abc\ndef", false);
        tree.insert(0, ">>", false);
        assert_doc(&tree, ">>abc\ndef");

        tree.insert(3, "_MID_", false);
        assert_doc(&tree, ">>a_MID_bc\ndef");

        let end = tree.len();
        tree.insert(end, "\nEND", false);
        assert_doc(&tree, ">>a_MID_bc\ndef\nEND");
    }

    #[test]
    fn delete_within_single_node_middle() {
        let mut tree = empty();
        tree.insert(0, "Hello\nWorld", false);
        tree.delete(3, 5);
        assert_doc(&tree, "Helrld");
    }

    #[test]
    fn delete_spanning_multiple_nodes() {
        let mut tree = build(&["foo\n", "bar\n", "baz"]);
        assert_doc(&tree, "foo\nbar\nbaz");

        tree.delete(2, 6);
        assert_doc(&tree, "fobaz");

        tree.delete(0, tree.len());
        assert_doc(&tree, "");
        assert_eq!(tree.get_lines_content(), vec![""]);
    }

    #[test]
    fn delete_trailing_newline_boundary() {
        let mut tree = empty();
        tree.insert(0, "a\nb\n", false);
        tree.delete(3, 1);
        assert_doc(&tree, "a\nb");
        tree.delete(1, 1);
        assert_doc(&tree, "ab");
    }

    #[test]
    fn basic_edits() {
        let mut tree = empty();
        tree.insert(0, "This is a document with some text.", false);
        assert_doc(&tree, "This is a document with some text.");

        tree.insert(34, "This is some more text to insert at offset 34.", false);
        assert_doc(
            &tree,
            "This is a document with some text.This is some more text to insert at offset 34.",
        );

        tree.delete(42, 5);
        assert_doc(
            &tree,
            "This is a document with some text.This is more text to insert at offset 34.",
        );
    }

    #[test]
    fn prefix_sums_after_append() {
        let mut tree = build(&["a\nb\nc\nde"]);
        tree.insert(8, "fh\ni\njk", false);
        tree.delete(7, 2);
        assert_doc(&tree, "a\nb\nc\ndh\ni\njk");
        assert_eq!(tree.line_count(), 6);

        let pos = tree.get_position_at(9);
        assert_eq!((pos.line, pos.column), (5, 1));
        assert_eq!(tree.get_offset_at(6, 3), 13);
    }

    #[test]
    fn crlf_stitching_on_delete() {
        let mut tree = empty();
        tree.insert(0, "a\r\nb", false);
        tree.delete(0, 2);
        assert_doc(&tree, "\nb");
        assert_eq!(tree.line_count(), 2);

        let mut tree = empty();
        tree.insert(0, "a\r\nb", false);
        tree.delete(2, 2);
        assert_doc(&tree, "a\r");
        assert_eq!(tree.line_count(), 2);
    }

    #[test]
    fn crlf_stitching_under_insertion() {
        let mut shadow = String::new();
        let mut tree = empty();

        let apply_insert = |tree: &mut PieceTree, shadow: &mut String, at: usize, s: &str| {
            tree.insert(at, s, false);
            shadow.insert_str(at, s);
        };
        apply_insert(&mut tree, &mut shadow, 0, "\n\n\r\r");
        assert_doc(&tree, &shadow);
        apply_insert(&mut tree, &mut shadow, 1, "\r\n\r\n");
        assert_doc(&tree, &shadow);

        tree.delete(5, 3);
        shadow.replace_range(5..8, "");
        assert_doc(&tree, &shadow);

        tree.delete(2, 3);
        shadow.replace_range(2..5, "");
        assert_doc(&tree, &shadow);
    }

    #[test]
    fn crlf_insert_between_cr_and_lf() {
        let mut tree = empty();
        tree.insert(0, "a\r\nb", false);
        tree.insert(2, "x", false);
        assert_doc(&tree, "a\rx\nb");
        assert_eq!(tree.line_count(), 3);
    }

    #[test]
    fn crlf_append_joins_previous_edit() {
        // sequential typing goes through the change-buffer append path
        let mut tree = empty();
        tree.insert(0, "a\r", false);
        tree.insert(2, "\nb", false);
        assert_doc(&tree, "a\r\nb");
        assert_eq!(tree.line_count(), 2);

        tree.insert(4, "\r", false);
        tree.insert(5, "\nc", false);
        assert_doc(&tree, "a\r\nb\r\nc");
        assert_eq!(tree.line_count(), 3);
    }

    #[test]
    fn change_buffer_filler_keeps_breaks_apart() {
        let mut tree = empty();
        tree.insert(0, "x\r", false);
        // inserting at the front forces a fresh change-buffer range while
        // the buffer still ends with \r
        tree.insert(0, "\ny", false);
        assert_doc(&tree, "\nyx\r");
        assert_eq!(tree.line_count(), 3);
    }

    #[test]
    fn large_insert_is_chunked_safely() {
        // \r\n straddling the first split point, a multi-byte char later
        let mut text = String::new();
        text.push_str(&"a".repeat(AVERAGE_BUFFER_SIZE - 1));
        text.push_str("\r\n");
        text.push_str(&"b".repeat(AVERAGE_BUFFER_SIZE - 4));
        text.push('😀');
        text.push_str(&"c".repeat(AVERAGE_BUFFER_SIZE));
        assert!(text.len() > 2 * AVERAGE_BUFFER_SIZE);

        let mut tree = empty();
        tree.insert(0, &text, false);
        assert_doc(&tree, &text);

        // and again in the middle of existing content
        let mut tree = build(&["start\nend"]);
        tree.insert(5, &text, false);
        let mut shadow = String::from("start\nend");
        shadow.insert_str(5, &text);
        assert_doc(&tree, &shadow);
    }

    #[test]
    fn equality_ignores_chunking() {
        let a = build(&["abc"]);
        let b = build(&["ab", "c"]);
        assert!(a.equal(&b));
        assert!(b.equal(&a));

        let c = build(&["abd"]);
        let d = build(&["abcd"]);
        assert!(!a.equal(&c));
        assert!(!a.equal(&d));

        let mut e = empty();
        e.insert(0, "ab", false);
        e.insert(2, "c", false);
        assert!(a.equal(&e));
    }

    #[test]
    fn get_text_and_line_length() {
        let mut tree = empty();
        tree.insert(0, "abc\ndef", false);
        assert_eq!(tree.get_text(), "abc\ndef");
        assert_eq!(tree.get_line_length(1), 3);
        assert_eq!(tree.get_line_length(2), 3);
        assert_eq!(tree.get_line_length(3), 0);
    }

    #[test]
    fn offset_and_position_roundtrip() {
        let mut tree = empty();
        tree.insert(0, "012\n45\n789", false);

        assert_eq!(tree.get_offset_at(1, 1), 0);
        assert_eq!(tree.get_offset_at(1, 4), 3);
        assert_eq!(tree.get_offset_at(2, 1), 4);
        assert_eq!(tree.get_offset_at(2, 3), 6);
        assert_eq!(tree.get_offset_at(3, 1), 7);
        assert_eq!(tree.get_offset_at(3, 4), 10);

        for (offset, line, column) in
            [(0, 1, 1), (3, 1, 4), (4, 2, 1), (6, 2, 3), (7, 3, 1), (10, 3, 4)]
        {
            let pos = tree.get_position_at(offset);
            assert_eq!((pos.line, pos.column), (line, column));
        }
    }

    #[test]
    fn edits_with_empty_input_are_noops() {
        let mut tree = build(&["abc"]);
        tree.insert(1, "", false);
        tree.delete(1, 0);
        assert_doc(&tree, "abc");
    }

    #[test]
    fn out_of_range_inputs_are_clamped() {
        let mut tree = build(&["abc\ndef"]);
        tree.insert(100, "!", false);
        assert_doc(&tree, "abc\ndef!");
        tree.delete(4, 100);
        assert_doc(&tree, "abc\n");
        let pos = tree.get_position_at(100);
        assert_eq!((pos.line, pos.column), (2, 1));
    }

    #[test]
    fn value_in_range() {
        let tree = build(&["ab\ncd\nef"]);
        let value = tree.get_value_in_range(
            BufferCursor::new(1, 2),
            BufferCursor::new(3, 2),
            None,
        );
        assert_eq!(value, "b\ncd\ne");

        // degenerate and reversed ranges are empty
        assert_eq!(
            tree.get_value_in_range(BufferCursor::new(2, 1), BufferCursor::new(2, 1), None),
            ""
        );
        assert_eq!(
            tree.get_value_in_range(BufferCursor::new(3, 1), BufferCursor::new(1, 1), None),
            ""
        );
    }

    #[test]
    fn value_in_range_rewrites_eol() {
        let tree = build(&["ab\rcd\r\nef\ngh"]);
        let all = tree.get_value_in_range(
            BufferCursor::new(1, 1),
            BufferCursor::new(4, 3),
            Some(EndOfLine::CrLf),
        );
        assert_eq!(all, "ab\r\ncd\r\nef\r\ngh");

        let lf = tree.get_value_in_range(
            BufferCursor::new(1, 1),
            BufferCursor::new(4, 3),
            Some(EndOfLine::Lf),
        );
        assert_eq!(lf, "ab\ncd\nef\ngh");
    }

    #[test]
    fn value_in_range_across_many_pieces() {
        let tree = build(&["one\n", "two\n", "three\n", "four"]);
        let value = tree.get_value_in_range(
            BufferCursor::new(1, 3),
            BufferCursor::new(4, 2),
            None,
        );
        assert_eq!(value, "e\ntwo\nthree\nf");
    }

    #[test]
    fn line_raw_content_includes_terminator() {
        let tree = build(&["ab\ncd\r\nef"]);
        assert_eq!(tree.get_line_raw_content(1, 0), "ab\n");
        assert_eq!(tree.get_line_raw_content(2, 0), "cd\r\n");
        assert_eq!(tree.get_line_raw_content(2, 2), "cd");
        assert_eq!(tree.get_line_raw_content(3, 0), "ef");
        assert_eq!(tree.get_line_raw_content(4, 0), "");
    }

    #[test]
    fn line_raw_content_spanning_nodes() {
        let mut tree = empty();
        tree.insert(0, "ab", false);
        tree.insert(0, "12\n", false);
        tree.insert(tree.len(), "cd\nend", false);
        assert_doc(&tree, "12\nabcd\nend");
        assert_eq!(tree.get_line_raw_content(2, 0), "abcd\n");
    }

    #[test]
    fn char_codes() {
        let tree = build(&["ab\ncd"]);
        assert_eq!(tree.char_code_at(0), Some(b'a'));
        assert_eq!(tree.char_code_at(2), Some(b'\n'));
        assert_eq!(tree.char_code_at(4), Some(b'd'));
        assert_eq!(tree.char_code_at(5), None);

        assert_eq!(tree.get_line_char_code(1, 0), Some(b'a'));
        assert_eq!(tree.get_line_char_code(2, 1), Some(b'd'));
    }

    #[test]
    fn char_code_across_piece_boundary() {
        let mut tree = empty();
        tree.insert(0, "ab", false);
        tree.insert(0, "xy", false);
        assert_doc(&tree, "xyab");
        assert_eq!(tree.char_code_at(2), Some(b'a'));
    }

    #[test]
    fn set_eol_to_crlf_and_back() {
        let mut tree = empty();
        tree.insert(0, "one\rtwo\nthree\r\nfour", false);
        tree.set_eol(EndOfLine::CrLf);
        assert!(tree.is_eol_normalized());
        assert_eq!(tree.get_text(), "one\r\ntwo\r\nthree\r\nfour");
        assert_doc(&tree, "one\r\ntwo\r\nthree\r\nfour");

        tree.set_eol(EndOfLine::Lf);
        assert_eq!(tree.get_text(), "one\ntwo\nthree\nfour");
        assert_doc(&tree, "one\ntwo\nthree\nfour");
    }

    #[test]
    fn normalized_lf_skips_stitching() {
        let mut tree = PieceTree::new(
            vec![StringBuffer::new("one\ntwo\n".to_string())],
            EndOfLine::Lf,
            true,
        );
        tree.insert(4, "mid\n", true);
        assert!(tree.is_eol_normalized());
        assert_doc(&tree, "one\nmid\ntwo\n");

        // a non-normalized insert drops the flag and re-enables stitching
        tree.insert(0, "x\r", false);
        assert!(!tree.is_eol_normalized());
        assert_doc(&tree, "x\rone\nmid\ntwo\n");
    }

    #[test]
    fn line_content_cache_is_invalidated_by_edits() {
        let mut tree = build(&["aaa\nbbb"]);
        assert_eq!(tree.get_line_content(2), "bbb");
        assert_eq!(tree.get_line_content(2), "bbb");
        tree.insert(4, "x", false);
        assert_eq!(tree.get_line_content(2), "xbbb");
        tree.delete(4, 2);
        assert_eq!(tree.get_line_content(2), "bb");
    }

    #[test]
    fn search_cache_survives_repeated_lookups() {
        let mut tree = empty();
        for i in 0..50 {
            if i % 3 == 0 {
                // front inserts force separate nodes
                tree.insert(0, "x\n", false);
            } else {
                let at = tree.len();
                tree.insert(at, "yz", false);
            }
        }
        let text = tree.get_text();
        // sequential byte reads drive node_at through the cache
        for (i, &b) in text.as_bytes().iter().enumerate() {
            assert_eq!(tree.char_code_at(i), Some(b));
        }
        // line reads drive get2
        for line in 1..=tree.line_count() {
            let _ = tree.get_line_raw_content(line, 0);
        }
        tree.assert_invariants();
    }

    #[test]
    fn interleaved_edits_shadow() {
        let ops: &[(bool, usize, &str, usize)] = &[
            (true, 0, "the quick\nbrown fox\n", 0),
            (true, 4, "very ", 0),
            (false, 0, "", 3),
            (true, 10, "\r\n", 0),
            (false, 8, "", 6),
            (true, 0, "\n", 0),
            (true, 1, "\r", 0),
            (false, 1, "", 1),
        ];
        let mut tree = empty();
        let mut shadow = String::new();
        for &(is_insert, at, text, cnt) in ops {
            if is_insert {
                tree.insert(at, text, false);
                shadow.insert_str(at, text);
            } else {
                let end = (at + cnt).min(shadow.len());
                tree.delete(at, cnt);
                shadow.replace_range(at..end, "");
            }
            assert_doc(&tree, &shadow);
        }
    }
}
