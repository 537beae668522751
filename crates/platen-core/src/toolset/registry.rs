//! Pinned callback registry for native converter objects.
//!
//! The engine's callbacks carry no user-data pointer, only the converter
//! pointer, so the extern "C" trampolines have to find their sink through a
//! process-wide table. An entry is inserted when callbacks are registered
//! for a converter and removed when the converter is destroyed; the sink
//! therefore lives exactly as long as the native object that may invoke it.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use super::events::{ConversionEvent, EventSink};

pub(crate) struct DelegateRegistry {
    entries: Mutex<HashMap<usize, EventSink>>,
}

static REGISTRY: OnceLock<DelegateRegistry> = OnceLock::new();

impl DelegateRegistry {
    /// The process-wide registry. The engine cannot be loaded twice in one
    /// process, so converter pointers are unique keys.
    pub(crate) fn global() -> &'static DelegateRegistry {
        REGISTRY.get_or_init(|| DelegateRegistry {
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub(crate) fn register(&self, converter: usize, sink: EventSink) {
        self.entries.lock().unwrap().insert(converter, sink);
    }

    pub(crate) fn unregister(&self, converter: usize) {
        self.entries.lock().unwrap().remove(&converter);
    }

    /// Deliver `event` to the sink registered for `converter`, if any.
    /// Called from the engine's callback trampolines.
    pub(crate) fn dispatch(&self, converter: usize, event: ConversionEvent) {
        let sink = self.entries.lock().unwrap().get(&converter).cloned();
        if let Some(sink) = sink {
            sink(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::toolset::events::sink;

    #[test]
    fn test_dispatch_reaches_registered_sink_only() {
        let registry = DelegateRegistry {
            entries: Mutex::new(HashMap::new()),
        };
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        registry.register(
            7,
            sink(move |_| {
                hits_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        registry.dispatch(7, ConversionEvent::Finish { success: true });
        registry.dispatch(8, ConversionEvent::Finish { success: true });
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        registry.unregister(7);
        registry.dispatch(7, ConversionEvent::Finish { success: true });
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
