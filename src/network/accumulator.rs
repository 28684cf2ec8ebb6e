// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use crate::{AppError, AppResult};

pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Linear receive buffer holding bytes that have not been framed yet.
///
/// ```text
///  0          front            rear          capacity
///  |  consumed  |    unread     |   writable    |
/// ```
///
/// `consume` only moves `front`, leaving dead space behind it. That space is
/// reclaimed when the buffer grows or on a compacting `read`, so the hot path
/// (peek a header, decode a frame in place, advance) never shifts bytes.
///
/// Invariant: `front <= rear <= capacity`.
#[derive(Debug)]
pub struct ByteAccumulator {
    buffer: Vec<u8>,
    front: usize,
    rear: usize,
}

impl Default for ByteAccumulator {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }
}

impl ByteAccumulator {
    pub fn with_capacity(capacity: usize) -> Self {
        ByteAccumulator {
            buffer: vec![0; capacity],
            front: 0,
            rear: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }
    pub fn front(&self) -> usize {
        self.front
    }
    pub fn rear(&self) -> usize {
        self.rear
    }
    /// Unread bytes.
    pub fn len(&self) -> usize {
        self.rear - self.front
    }
    pub fn is_empty(&self) -> bool {
        self.front == self.rear
    }
    /// Room left after `rear`. Dead space before `front` is not counted.
    pub fn writable_len(&self) -> usize {
        self.capacity() - self.rear
    }

    pub fn clear(&mut self) {
        self.front = 0;
        self.rear = 0;
    }

    /// Append `src`, doubling the capacity as many times as needed.
    pub fn write(&mut self, src: &[u8]) -> usize {
        if self.writable_len() < src.len() {
            let mut new_capacity = (self.capacity() * 2).max(1);
            while new_capacity - self.len() < src.len() {
                new_capacity *= 2;
            }
            self.resize(new_capacity);
        }
        self.buffer[self.rear..self.rear + src.len()].copy_from_slice(src);
        self.rear += src.len();
        src.len()
    }

    /// Copy up to `count` unread bytes without consuming them.
    pub fn peek(&self, count: usize) -> Vec<u8> {
        let size = count.min(self.len());
        self.buffer[self.front..self.front + size].to_vec()
    }

    /// Borrow every unread byte.
    pub fn unread(&self) -> &[u8] {
        &self.buffer[self.front..self.rear]
    }

    /// Advance `front` by `count`, clipped to the unread length.
    pub fn consume(&mut self, count: usize) {
        self.front += count.min(self.len());
    }

    /// Copy out up to `count` bytes, then compact the remainder to offset 0
    /// of a fresh backing array.
    pub fn read(&mut self, count: usize) -> Vec<u8> {
        let size = count.min(self.len());
        let out = self.buffer[self.front..self.front + size].to_vec();
        self.front += size;

        let mut buffer = vec![0; self.capacity()];
        let remaining = self.len();
        buffer[..remaining].copy_from_slice(&self.buffer[self.front..self.rear]);
        self.buffer = buffer;
        self.front = 0;
        self.rear = remaining;
        out
    }

    /// Grow to `new_capacity`, which must exceed the current capacity.
    pub fn grow(&mut self, new_capacity: usize) -> AppResult<()> {
        if new_capacity <= self.capacity() {
            return Err(AppError::InvalidValue(format!(
                "new capacity {} must exceed current capacity {}",
                new_capacity,
                self.capacity()
            )));
        }
        self.resize(new_capacity);
        Ok(())
    }

    /// Region after `rear` that a socket read may fill.
    pub fn writable_mut(&mut self) -> &mut [u8] {
        let rear = self.rear;
        &mut self.buffer[rear..]
    }

    /// Mark `count` bytes written through `writable_mut` as unread data.
    pub fn commit(&mut self, count: usize) {
        self.rear += count.min(self.writable_len());
    }

    fn resize(&mut self, new_capacity: usize) {
        let len = self.len();
        let mut buffer = vec![0; new_capacity];
        buffer[..len].copy_from_slice(&self.buffer[self.front..self.rear]);
        self.buffer = buffer;
        self.front = 0;
        self.rear = len;
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    fn assert_invariant(acc: &ByteAccumulator) {
        assert!(acc.front() <= acc.rear());
        assert!(acc.rear() <= acc.capacity());
        assert_eq!(acc.len(), acc.rear() - acc.front());
    }

    #[test]
    fn test_write_peek_consume() {
        let mut acc = ByteAccumulator::with_capacity(8);
        assert_eq!(acc.write(b"hello"), 5);
        assert_eq!(acc.peek(3), b"hel");
        assert_eq!(acc.peek(100), b"hello");
        assert_eq!(acc.len(), 5);

        acc.consume(2);
        assert_eq!(acc.front(), 2);
        assert_eq!(acc.unread(), b"llo");
        // consume never compacts
        assert_eq!(acc.writable_len(), 3);
        assert_invariant(&acc);

        acc.consume(10);
        assert!(acc.is_empty());
        assert_invariant(&acc);
    }

    #[test]
    fn test_write_grows_by_doubling_and_reclaims_dead_space() {
        let mut acc = ByteAccumulator::with_capacity(4);
        acc.write(b"abcd");
        acc.consume(3);
        assert_eq!(acc.writable_len(), 0);

        acc.write(b"efghij");
        assert_eq!(acc.capacity(), 8);
        assert_eq!(acc.front(), 0);
        assert_eq!(acc.unread(), b"defghij");
        assert_invariant(&acc);

        acc.write(&[7u8; 30]);
        assert_eq!(acc.capacity(), 64);
        assert_eq!(acc.len(), 37);
        assert_invariant(&acc);
    }

    #[test]
    fn test_zero_capacity_write() {
        let mut acc = ByteAccumulator::with_capacity(0);
        acc.write(b"xyz");
        assert_eq!(acc.unread(), b"xyz");
        assert!(acc.capacity() >= 3);
    }

    #[test]
    fn test_read_compacts() {
        let mut acc = ByteAccumulator::with_capacity(16);
        acc.write(b"0123456789");
        acc.consume(2);

        let out = acc.read(3);
        assert_eq!(out, b"234");
        assert_eq!(acc.front(), 0);
        assert_eq!(acc.rear(), 5);
        assert_eq!(acc.unread(), b"56789");
        assert_eq!(acc.capacity(), 16);

        let out = acc.read(100);
        assert_eq!(out, b"56789");
        assert!(acc.is_empty());
        assert_invariant(&acc);
    }

    #[test]
    fn test_grow() {
        let mut acc = ByteAccumulator::with_capacity(8);
        acc.write(b"abcdef");
        acc.consume(4);
        assert!(acc.grow(8).is_err());
        assert!(acc.grow(4).is_err());

        acc.grow(32).unwrap();
        assert_eq!(acc.capacity(), 32);
        assert_eq!(acc.front(), 0);
        assert_eq!(acc.unread(), b"ef");
    }

    #[test]
    fn test_writable_mut_and_commit() {
        let mut acc = ByteAccumulator::with_capacity(8);
        acc.write(b"ab");
        let region = acc.writable_mut();
        assert_eq!(region.len(), 6);
        region[..3].copy_from_slice(b"cde");
        acc.commit(3);
        assert_eq!(acc.unread(), b"abcde");

        acc.commit(100);
        assert_eq!(acc.rear(), acc.capacity());
        assert_invariant(&acc);
    }

    #[test]
    fn test_random_operations_keep_invariant() {
        let mut rng = rand::thread_rng();
        let mut acc = ByteAccumulator::with_capacity(4);
        // mirror of the bytes written and not yet consumed
        let mut model: Vec<u8> = Vec::new();
        let mut next = 0u8;

        for _ in 0..2000 {
            match rng.gen_range(0..4) {
                0 => {
                    let n = rng.gen_range(0..40);
                    let data: Vec<u8> = (0..n)
                        .map(|_| {
                            next = next.wrapping_add(1);
                            next
                        })
                        .collect();
                    acc.write(&data);
                    model.extend_from_slice(&data);
                }
                1 => {
                    let n = rng.gen_range(0..20);
                    acc.consume(n);
                    model.drain(..n.min(model.len()));
                }
                2 => {
                    let n = rng.gen_range(0..20);
                    let out = acc.read(n);
                    let expected: Vec<u8> = model.drain(..n.min(model.len())).collect();
                    assert_eq!(out, expected);
                }
                _ => {
                    let target = acc.capacity() + rng.gen_range(1..16);
                    acc.grow(target).unwrap();
                }
            }
            assert_invariant(&acc);
            assert_eq!(acc.peek(acc.len()), model);
        }
    }
}
