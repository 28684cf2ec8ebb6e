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

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;
use tracing::trace;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

struct FreeList<T> {
    items: Vec<T>,
    /// total instances ever preallocated, also the size of the next refill
    alloc_size: usize,
}

/// A free-list of reusable instances.
///
/// `allocate` never fails: an empty pool refills itself with as many instances
/// as it has preallocated so far, so refills grow geometrically. Nothing is
/// tracked once an instance is handed out; forgetting to `free` it only shrinks
/// the cache, and freeing the same instance twice is the caller's bug.
pub struct ObjectPool<T> {
    free: Mutex<FreeList<T>>,
    created: AtomicUsize,
    factory: Factory<T>,
}

impl<T> Debug for ObjectPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let free = self.free.lock();
        f.debug_struct("ObjectPool")
            .field("available", &free.items.len())
            .field("alloc_size", &free.alloc_size)
            .field("created", &self.created.load(Ordering::Relaxed))
            .finish()
    }
}

impl<T: Default + Send + 'static> ObjectPool<T> {
    pub fn with_default(init_size: usize) -> Self {
        Self::new(init_size, T::default)
    }
}

impl<T: Send + 'static> ObjectPool<T> {
    pub fn new<F>(init_size: usize, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        let pool = ObjectPool {
            free: Mutex::new(FreeList {
                items: Vec::with_capacity(init_size),
                alloc_size: 0,
            }),
            created: AtomicUsize::new(0),
            factory: Box::new(factory),
        };
        {
            let mut free = pool.free.lock();
            pool.preallocate(&mut free, init_size);
        }
        pool
    }

    pub fn allocate(&self) -> T {
        let mut free = self.free.lock();
        if free.items.is_empty() {
            let refill = free.alloc_size.max(1);
            trace!("pool empty, preallocating {} instances", refill);
            self.preallocate(&mut free, refill);
        }
        free.items.pop().unwrap_or_else(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            (self.factory)()
        })
    }

    pub fn free(&self, item: T) {
        self.free.lock().items.push(item);
    }

    /// Instances currently waiting in the pool.
    pub fn available(&self) -> usize {
        self.free.lock().items.len()
    }

    /// Instances ever constructed by this pool.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    pub fn alloc_size(&self) -> usize {
        self.free.lock().alloc_size
    }

    fn preallocate(&self, free: &mut FreeList<T>, size: usize) {
        free.items.reserve(size);
        for _ in 0..size {
            free.items.push((self.factory)());
        }
        free.alloc_size += size;
        self.created.fetch_add(size, Ordering::Relaxed);
    }
}
