use piece_tree::{BufferCursor, EndOfLine, PieceTree, StringBuffer};

/// 1-based line/column pair used by the position-addressed calls,
/// forwarded from piece_tree.
pub type Position = BufferCursor;

/// Document façade over the piece tree. Edits take byte offsets or
/// positions; queries answer in whichever coordinate space the caller
/// asked in.
#[derive(Debug)]
pub struct TextBuffer {
    tree: PieceTree,
}

impl TextBuffer {
    /// Wraps a single string with an LF document EOL.
    pub fn from_text(text: &str) -> Self {
        Self::from_chunks(vec![StringBuffer::new(text.to_string())])
    }

    /// Build from multiple chunks with an LF document EOL.
    pub fn from_chunks(chunks: Vec<StringBuffer>) -> Self {
        Self::from_chunks_with_eol(chunks, EndOfLine::Lf)
    }

    /// Build from multiple chunks under the given document EOL.
    pub fn from_chunks_with_eol(chunks: Vec<StringBuffer>, eol: EndOfLine) -> Self {
        Self {
            tree: PieceTree::new(chunks, eol, false),
        }
    }

    /// Splices `text` in at a byte offset; offsets past the end append.
    pub fn insert(&mut self, offset: usize, text: &str) {
        self.tree.insert(offset, text, false);
    }

    /// Removes `len` bytes from `offset` on, clamped to the document end.
    pub fn delete(&mut self, offset: usize, len: usize) {
        self.tree.delete(offset, len);
    }

    /// Position-addressed insertion, for callers that think in lines.
    pub fn insert_at(&mut self, at: Position, text: &str) {
        let offset = self.offset_of(at);
        self.insert(offset, text);
    }

    /// Removes everything between two positions, `to` exclusive. A
    /// reversed pair removes nothing.
    pub fn delete_range(&mut self, from: Position, to: Position) {
        let start = self.offset_of(from);
        let end = self.offset_of(to);
        if start < end {
            self.delete(start, end - start);
        }
    }

    /// The whole document as one string.
    pub fn text(&self) -> String {
        self.tree.get_text()
    }

    /// Document size in bytes.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// How many lines the document spans; never less than one.
    pub fn line_count(&self) -> usize {
        self.tree.line_count()
    }

    /// A single line, terminator stripped. Lines outside the document come
    /// back empty.
    pub fn line(&self, line_number: usize) -> String {
        self.tree.get_line_content(line_number)
    }

    /// Every line of the document, terminators stripped.
    pub fn lines(&self) -> Vec<String> {
        self.tree.get_lines_content()
    }

    /// Byte length of a line without its terminator.
    pub fn line_len(&self, line_number: usize) -> usize {
        self.tree.get_line_length(line_number)
    }

    /// One past the last valid column of a line; the caret's rightmost
    /// stop.
    pub fn line_end_column(&self, line_number: usize) -> usize {
        self.line_len(line_number) + 1
    }

    /// Text between two positions, optionally rewriting line terminators
    /// to `eol`.
    pub fn text_in_range(&self, from: Position, to: Position, eol: Option<EndOfLine>) -> String {
        self.tree.get_value_in_range(from, to, eol)
    }

    /// The document EOL sequence.
    pub fn eol(&self) -> EndOfLine {
        self.tree.eol()
    }

    /// Rewrite every line terminator in the document to `eol`.
    pub fn set_eol(&mut self, eol: EndOfLine) {
        self.tree.set_eol(eol);
    }

    /// Byte offset of a 1-based position.
    pub fn offset_of(&self, position: Position) -> usize {
        self.tree.get_offset_at(position.line, position.column)
    }

    /// 1-based position of a byte offset.
    pub fn position_of(&self, offset: usize) -> Position {
        self.tree.get_position_at(offset)
    }
}
