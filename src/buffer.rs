//! fixed size buffer with two cursors: `position` marks the start of the
//! data still to consume, `end` marks the end of the data already filled in

use std::{
    cmp,
    io::{self, Write},
};

use poule::Reset;

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Buffer {
    memory: Vec<u8>,
    position: usize,
    end: usize,
}

impl Buffer {
    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            memory: vec![0; capacity],
            position: 0,
            end: 0,
        }
    }

    pub fn available_data(&self) -> usize {
        self.end - self.position
    }

    pub fn available_space(&self) -> usize {
        self.memory.len() - self.end
    }

    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    pub fn empty(&self) -> bool {
        self.position == self.end
    }

    /// advances the consuming cursor, shifting the data back to the start of
    /// the memory once more than half of it was consumed
    pub fn consume(&mut self, count: usize) -> usize {
        let cnt = cmp::min(count, self.available_data());
        self.position += cnt;
        if self.position > self.capacity() / 2 {
            self.shift();
        }
        cnt
    }

    /// advances the filling cursor after data was written into `space()`
    pub fn fill(&mut self, count: usize) -> usize {
        let cnt = cmp::min(count, self.available_space());
        self.end += cnt;
        if self.available_space() < self.available_data() + cnt {
            self.shift();
        }
        cnt
    }

    pub fn clear(&mut self) {
        self.position = 0;
        self.end = 0;
    }

    pub fn data(&self) -> &[u8] {
        &self.memory[self.position..self.end]
    }

    pub fn space(&mut self) -> &mut [u8] {
        let end = self.end;
        &mut self.memory[end..]
    }

    pub fn shift(&mut self) {
        if self.position > 0 {
            self.memory.copy_within(self.position..self.end, 0);
            self.end -= self.position;
            self.position = 0;
        }
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = {
            let space = self.space();
            let len = cmp::min(space.len(), buf.len());
            space[..len].copy_from_slice(&buf[..len]);
            len
        };
        self.fill(written);
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Reset for Buffer {
    fn reset(&mut self) {
        self.clear();
    }
}
