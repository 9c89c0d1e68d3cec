use std::{
    fs::File,
    io::{self, BufReader, Read},
    path::Path,
};

use crate::TextBufferBuilder;
use crate::buffer::TextBuffer;

const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Loads a file into a `TextBuffer` through the chunking builder. Reads are
/// bounded and a UTF-8 sequence split across two reads is carried over to
/// the next chunk instead of failing.
pub fn load_from_path<P: AsRef<Path>>(path: P) -> io::Result<TextBuffer> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut builder = TextBufferBuilder::new();

    let mut pending: Vec<u8> = Vec::with_capacity(READ_CHUNK_SIZE + 4);
    let mut buf = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        pending.extend_from_slice(&buf[..n]);

        let valid_len = match std::str::from_utf8(&pending) {
            Ok(chunk) => {
                builder.accept_chunk(chunk);
                pending.len()
            }
            Err(e) => {
                // feed the longest valid prefix; keep the partial codepoint
                let valid = e.valid_up_to();
                if valid > 0 {
                    builder.accept_chunk(std::str::from_utf8(&pending[..valid]).expect("valid prefix"));
                }
                valid
            }
        };
        pending.drain(..valid_len);
    }

    if !pending.is_empty() {
        // a broken trailing sequence decodes lossily rather than failing the load
        builder.accept_chunk(&String::from_utf8_lossy(&pending));
    }

    Ok(builder.finish())
}
