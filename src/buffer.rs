/// Receive buffer for a byte stream, consumed from the front.
///
/// Consumed bytes are only reclaimed when the buffer runs empty or
/// when more than half of the allocation is dead space.
#[derive(Debug, Default)]
pub(crate) struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self {
            data: Vec::with_capacity(300),
            read_pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len() - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn consume(&mut self, len: usize) {
        assert!(len <= self.len());
        self.read_pos += len;
    }

    pub fn write(&mut self, bytes: &[u8]) {
        if self.read_pos == self.data.len() {
            self.clear();
        } else if self.read_pos > self.data.len() / 2 {
            self.data.drain(..self.read_pos);
            self.read_pos = 0;
        }
        self.data.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.read_pos = 0;
    }
}

impl AsRef<[u8]> for Buffer {
    fn as_ref(&self) -> &[u8] {
        &self.data[self.read_pos..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_buffer() -> Buffer {
        let mut buf = Buffer::new();
        buf.write(b"\x10\x40\x01\x00\x41\x16");
        buf
    }

    #[test]
    fn test_slice() {
        let buf = get_buffer();
        assert_eq!(buf.as_ref().len(), buf.len());
    }

    #[test]
    fn test_consume_and_compact() {
        let mut buf = get_buffer();
        buf.consume(4);
        assert_eq!(buf.as_ref(), b"\x41\x16");
        buf.write(b"\x68");
        assert_eq!(buf.as_ref(), b"\x41\x16\x68");
        buf.consume(3);
        assert!(buf.is_empty());
        buf.write(b"\x10");
        assert_eq!(buf.as_ref(), b"\x10");
    }
}
