use std::io;

/// Grows `buf` until it has room for `needed` more bytes, preserving
/// contents. Returns the same allocation when capacity already
/// suffices. Allocation failure surfaces as an error instead of
/// aborting, which is what lets the acceptor run its out-of-memory
/// recovery.
pub fn expand(buf: &mut Vec<u8>, needed: usize) -> io::Result<()> {
    if buf.capacity() - buf.len() >= needed {
        return Ok(());
    }
    buf.try_reserve(needed)
        .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "buffer expansion failed"))
}

/// Application-level read/write buffer pair bound to one connection.
/// Pairs are pooled; `clear` is called between owners.
#[derive(Debug)]
pub struct BufferPair {
    read: Vec<u8>,
    write: Vec<u8>,
}

impl BufferPair {
    pub fn with_capacity(read_size: usize, write_size: usize) -> io::Result<BufferPair> {
        let mut read = Vec::new();
        read.try_reserve(read_size)
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "read buffer"))?;
        let mut write = Vec::new();
        write
            .try_reserve(write_size)
            .map_err(|_| io::Error::new(io::ErrorKind::OutOfMemory, "write buffer"))?;

        Ok(BufferPair { read, write })
    }

    pub fn read_buf(&mut self) -> &mut Vec<u8> {
        &mut self.read
    }

    pub fn write_buf(&mut self) -> &mut Vec<u8> {
        &mut self.write
    }

    pub fn capacity(&self) -> usize {
        self.read.capacity() + self.write.capacity()
    }

    pub fn clear(&mut self) {
        self.read.clear();
        self.write.clear();
    }
}

#[cfg(test)]
mod test {
    use super::{expand, BufferPair};

    #[test]
    fn expand_keeps_contents() {
        let mut buf = Vec::with_capacity(8);
        buf.extend_from_slice(b"abc");

        expand(&mut buf, 1024).unwrap();
        assert!(buf.capacity() - buf.len() >= 1024);
        assert_eq!(&buf[..], b"abc");
    }

    #[test]
    fn expand_is_noop_with_room() {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(b"xy");
        let cap = buf.capacity();

        expand(&mut buf, 16).unwrap();
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn pair_clear() {
        let mut pair = BufferPair::with_capacity(16, 16).unwrap();
        pair.read_buf().extend_from_slice(b"in");
        pair.write_buf().extend_from_slice(b"out");

        pair.clear();
        assert!(pair.read_buf().is_empty());
        assert!(pair.write_buf().is_empty());
    }
}
