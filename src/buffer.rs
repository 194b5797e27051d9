/// Default capacity of a [`DirectionalBuffer`].
pub const BUFFER_CAPACITY: usize = 16384;

/// Fixed-capacity byte buffer for one direction of the relay.
///
/// Bytes are appended at the write cursor and consumed from the read cursor, so
/// `read <= write <= capacity` always holds. Once `write` reaches the capacity no
/// more input is accepted until the sink consumes bytes from the front.
pub struct DirectionalBuffer {
    data: Box<[u8]>,
    read: usize,
    write: usize,
}

impl DirectionalBuffer {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be positive");

        Self {
            data: vec![0; capacity].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes produced but not yet consumed.
    pub fn len(&self) -> usize {
        self.write - self.read
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn is_full(&self) -> bool {
        self.write == self.capacity()
    }

    pub fn pending(&self) -> &[u8] {
        &self.data[self.read..self.write]
    }

    /// Splits the buffer into the bytes waiting for the sink and the free space for the source.
    pub fn split(&mut self) -> (&[u8], &mut [u8]) {
        let (filled, spare) = self.data.split_at_mut(self.write);
        (&filled[self.read..], spare)
    }

    /// Records `n` bytes read into the space handed out by [`split`](Self::split).
    pub fn produce(&mut self, n: usize) {
        assert!(
            n <= self.capacity() - self.write,
            "produced {} bytes into {} free bytes",
            n,
            self.capacity() - self.write
        );
        self.write += n;
    }

    /// Drops `n` bytes from the front after the sink accepted them.
    pub fn consume(&mut self, n: usize) {
        assert!(
            n <= self.len(),
            "consumed {} bytes out of {} pending",
            n,
            self.len()
        );
        self.read += n;

        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        } else if self.read > 0 {
            self.data.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }
    }
}
