pub use crate::buffer::TextBuffer;

use piece_tree::{EndOfLine, StringBuffer};

#[derive(Default, Debug)]
pub struct TextBufferBuilder {
    chunks: Vec<StringBuffer>,
    /// A trailing `\r` held back so a `\n` opening the next chunk joins it.
    carry_cr: bool,
}

impl TextBufferBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a chunk of text (may include multiple lines).
    pub fn accept_chunk(&mut self, chunk: &str) {
        if chunk.is_empty() {
            return;
        }
        let mut text = String::with_capacity(chunk.len() + 1);
        if self.carry_cr {
            text.push('\r');
            self.carry_cr = false;
        }
        text.push_str(chunk);
        if text.ends_with('\r') {
            text.pop();
            self.carry_cr = true;
        }
        if !text.is_empty() {
            self.chunks.push(StringBuffer::new(text));
        }
    }

    /// Finish building and return a `TextBuffer` with an LF document EOL.
    pub fn finish(self) -> TextBuffer {
        self.finish_with_eol(EndOfLine::Lf)
    }

    /// Finish building under the given document EOL.
    pub fn finish_with_eol(mut self, eol: EndOfLine) -> TextBuffer {
        if self.carry_cr {
            self.chunks.push(StringBuffer::new("\r".to_string()));
            self.carry_cr = false;
        }
        TextBuffer::from_chunks_with_eol(std::mem::take(&mut self.chunks), eol)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_boundary_inside_crlf() {
        let mut builder = TextBufferBuilder::new();
        builder.accept_chunk("one\r");
        builder.accept_chunk("\ntwo");
        let buffer = builder.finish();
        assert_eq!(buffer.line_count(), 2);
        assert_eq!(buffer.lines(), vec!["one", "two"]);
    }

    #[test]
    fn trailing_cr_is_flushed() {
        let mut builder = TextBufferBuilder::new();
        builder.accept_chunk("one\r");
        let buffer = builder.finish();
        assert_eq!(buffer.text(), "one\r");
        assert_eq!(buffer.line_count(), 2);
    }
}
