//! Type aliases for commonly used complex types.
//!
//! Gives meaningful names to the shared-state and callback shapes used
//! across the engine and analyzer crates.

use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// A thread-safe deque for cross-thread queue/buffer management.
pub type ThreadSafeDeque<T> = Arc<Mutex<VecDeque<T>>>;

/// A thread-safe hash map for cross-thread key-value storage.
pub type ThreadSafeMap<K, V> = Arc<Mutex<HashMap<K, V>>>;

/// A thread-safe reader-writer lock wrapper for read-heavy workloads.
///
/// Use when reads greatly outnumber writes; snapshot readers never see a
/// torn state.
pub type ThreadSafeRw<T> = Arc<RwLock<T>>;

/// A thread-safe reader-writer hash map.
pub type ThreadSafeRwMap<K, V> = Arc<RwLock<HashMap<K, V>>>;

/// Cooperative cancellation flag, polled once per outer loop iteration.
pub type AbortFlag = Arc<AtomicBool>;

/// Progress callback reporting a fraction in 0.0..=1.0.
pub type ProgressCallback = Arc<dyn Fn(f64) + Send + Sync>;
