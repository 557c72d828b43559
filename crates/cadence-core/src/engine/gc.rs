//! Deferred deallocation for buffers dropped on the render thread
//!
//! Control ops and sample channels are handed to the renderer wrapped in
//! `basedrop::Owned` / `basedrop::Shared`. When the renderer drops one, the
//! pointer is queued instead of freed; a background "render-gc" thread
//! collects the queue periodically. The renderer never calls into the
//! allocator to release large buffers.
//!
//! ```ignore
//! use basedrop::Shared;
//! use crate::engine::gc::gc_handle;
//!
//! let data = Shared::new(&gc_handle(), SampleData::new(channels, 48000));
//! client.set_sample_data(handle, data)?;
//! ```

use basedrop::{Collector, Handle};
use std::sync::mpsc;
use std::sync::OnceLock;
use std::thread;
use std::time::Duration;

/// How often the collector thread drains the drop queue
const COLLECT_INTERVAL: Duration = Duration::from_millis(50);

static GC_HANDLE: OnceLock<Handle> = OnceLock::new();

fn spawn_collector() -> Handle {
    let (tx, rx) = mpsc::channel();

    let spawned = thread::Builder::new()
        .name("render-gc".to_string())
        .spawn(move || {
            // Collector is !Sync, so it lives and dies on this thread
            let mut collector = Collector::new();
            if tx.send(collector.handle()).is_err() {
                return;
            }
            log::info!("Render GC thread started");
            loop {
                collector.collect();
                thread::sleep(COLLECT_INTERVAL);
            }
        });

    let handle = match spawned {
        Ok(_) => rx.recv().ok(),
        Err(e) => {
            log::error!("Failed to spawn render GC thread: {}", e);
            None
        }
    };

    // Without a collector thread, deferred drops simply accumulate
    handle.unwrap_or_else(|| Box::leak(Box::new(Collector::new())).handle())
}

/// Handle for allocating `basedrop` pointers; starts the collector on first use
pub fn gc_handle() -> Handle {
    GC_HANDLE.get_or_init(spawn_collector).clone()
}
