// SPDX-License-Identifier: GPL-3.0-only

//! Wait-free single-producer single-consumer triple buffer
//!
//! Three slots rotate between the two parties. The writer owns one slot, the
//! reader owns one (the *locked* slot), and the third holds the most recently
//! published value. Both hand-offs are a single atomic swap of the middle
//! slot's index, so neither side ever blocks.

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

const INDEX_MASK: u8 = 0b011;
const FRESH: u8 = 0b100;

struct Shared<T> {
    slots: [UnsafeCell<T>; 3],
    /// Index of the most-recent slot plus the `FRESH` flag
    middle: AtomicU8,
}

// SAFETY: every slot is accessed by exactly one side at a time; ownership of
// a slot only changes through the atomic swap on `middle`. The halves are
// `!Sync`, so a slot is never reachable from two threads through one half.
unsafe impl<T: Send> Sync for Shared<T> {}

/// `!Sync` marker for the two halves
type NotSync = PhantomData<Cell<()>>;

/// Producer half
pub struct TripleWriter<T> {
    shared: Arc<Shared<T>>,
    write_index: u8,
    _not_sync: NotSync,
}

/// Consumer half
///
/// A reader may move to another thread but cannot be shared between threads;
/// wrap it in a `Mutex` for that.
///
/// ```compile_fail
/// fn shared<T: Sync>(_: &T) {}
/// let (_writer, reader) = kinect3d::frame::triple_buffer(0u32);
/// shared(&reader);
/// ```
pub struct TripleReader<T> {
    shared: Arc<Shared<T>>,
    locked_index: u8,
    _not_sync: NotSync,
}

/// Create a triple buffer whose three slots start as clones of `initial`
pub fn triple_buffer<T: Clone>(initial: T) -> (TripleWriter<T>, TripleReader<T>) {
    let shared = Arc::new(Shared {
        slots: [
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial.clone()),
            UnsafeCell::new(initial),
        ],
        middle: AtomicU8::new(1),
    });
    (
        TripleWriter {
            shared: Arc::clone(&shared),
            write_index: 2,
            _not_sync: PhantomData,
        },
        TripleReader {
            shared,
            locked_index: 0,
            _not_sync: PhantomData,
        },
    )
}

impl<T> TripleWriter<T> {
    /// Scratch slot the next value can be assembled in
    pub fn write_slot(&mut self) -> &mut T {
        // SAFETY: the write slot is owned by the writer until `post`
        unsafe { &mut *self.shared.slots[self.write_index as usize].get() }
    }

    /// Publish the write slot as the most recent value
    pub fn post(&mut self) {
        let previous = self
            .shared
            .middle
            .swap(self.write_index | FRESH, Ordering::AcqRel);
        self.write_index = previous & INDEX_MASK;
    }

    /// Store `value` and publish it
    pub fn post_new_value(&mut self, value: T) {
        *self.write_slot() = value;
        self.post();
    }
}

impl<T> TripleReader<T> {
    /// True when a value was posted since the last successful lock
    pub fn has_new_value(&self) -> bool {
        self.shared.middle.load(Ordering::Acquire) & FRESH != 0
    }

    /// Latch the most recent value if a fresh one exists
    pub fn lock_new_value(&mut self) -> bool {
        if !self.has_new_value() {
            return false;
        }
        let previous = self
            .shared
            .middle
            .swap(self.locked_index, Ordering::AcqRel);
        self.locked_index = previous & INDEX_MASK;
        true
    }

    /// The currently latched value
    pub fn locked_value(&self) -> &T {
        // SAFETY: the locked slot is never touched by the writer
        unsafe { &*self.shared.slots[self.locked_index as usize].get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_single_post_then_lock() {
        let (mut writer, mut reader) = triple_buffer(0u32);
        assert!(!reader.lock_new_value());
        writer.post_new_value(5);
        assert!(reader.lock_new_value());
        assert_eq!(*reader.locked_value(), 5);
        assert!(!reader.lock_new_value());
        assert_eq!(*reader.locked_value(), 5);
    }

    #[test]
    fn test_second_post_overrides_first() {
        let (mut writer, mut reader) = triple_buffer(String::new());
        writer.post_new_value("first".to_string());
        writer.post_new_value("second".to_string());
        assert!(reader.lock_new_value());
        assert_eq!(reader.locked_value(), "second");
        assert!(!reader.lock_new_value());
    }

    #[test]
    fn test_halves_move_across_threads_for_send_only_values() {
        let (mut writer, mut reader) = triple_buffer(Cell::new(0u32));
        let producer = thread::spawn(move || writer.post_new_value(Cell::new(7)));
        producer.join().unwrap();
        let consumer = thread::spawn(move || {
            assert!(reader.lock_new_value());
            reader.locked_value().get()
        });
        assert_eq!(consumer.join().unwrap(), 7);
    }

    #[test]
    fn test_contended_values_are_monotonic() {
        let (mut writer, mut reader) = triple_buffer(0u32);
        let producer = thread::spawn(move || {
            for value in 0..1000u32 {
                writer.post_new_value(value);
            }
        });

        let mut last = 0;
        loop {
            if reader.lock_new_value() {
                let value = *reader.locked_value();
                assert!(value >= last, "saw {} after {}", value, last);
                last = value;
                if value == 999 {
                    break;
                }
            } else if producer.is_finished() && !reader.has_new_value() {
                break;
            }
        }
        producer.join().unwrap();
        assert_eq!(last, 999);
    }
}
