mod buffer;
mod buffer_builder;
mod io;

pub use crate::buffer::{Position, TextBuffer};
pub use crate::buffer_builder::TextBufferBuilder;
pub use crate::io::load_from_path;
pub use piece_tree::EndOfLine;
