mod buffer;
mod cache;
mod piece_tree;
mod scanner;
mod tree;

pub use crate::buffer::{BufferCursor, StringBuffer};
pub use crate::piece_tree::{AVERAGE_BUFFER_SIZE, EndOfLine, PieceTree};
pub use crate::scanner::{LineStarts, create_line_starts};
pub use crate::tree::Piece;
