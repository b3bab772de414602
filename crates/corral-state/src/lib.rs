//! Durable state shared by replicas of a clustered deployment.
//!
//! Replicas coordinate through small files on a shared filesystem: boolean
//! markers whose presence is the signal, and a stamp file recording the
//! last-applied build. [`SemaphoreStore`] owns the read and write protocol;
//! [`WriteMutex`] serialises writers even on filesystems without advisory
//! locking.

mod mutex;
mod semaphore;

pub use mutex::{MutexError, WriteGuard, WriteMutex, select_mutex};
pub use semaphore::{Marker, SemaphoreStore, Stamp, StateError};
