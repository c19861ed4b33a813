use std::fmt;

use crate::layer::LayerId;

/// Which part of a layer a `LayerChanged` event refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerChange {
    Visibility,
    Lock,
    Opacity,
    BlendMode,
    Name,
    /// Raster content changed (draw, decode, merge).
    Content,
    /// Several modifiers replaced at once (import).
    Properties,
}

/// Notifications broadcast by `LayerStack` after a successful mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum LayerEvent {
    LayerAdded { id: LayerId, index: usize },
    LayerRemoved { id: LayerId, index: usize },
    ActiveLayerChanged { id: LayerId, index: usize },
    LayerMoved { id: LayerId, from: usize, to: usize },
    LayerChanged { id: LayerId, index: usize, change: LayerChange },
    CanvasResized { width: u32, height: u32 },
    Cleared,
    /// All layers were replaced by a single background holding the composite.
    Flattened { id: LayerId },
}

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Box<dyn FnMut(&LayerEvent) + Send>;

/// Registry of event callbacks, invoked synchronously in subscription order.
#[derive(Default)]
pub(crate) struct Listeners {
    next_id: u64,
    entries: Vec<(ListenerId, Listener)>,
}

impl Listeners {
    pub(crate) fn subscribe(&mut self, listener: Listener) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    pub(crate) fn unsubscribe(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(lid, _)| *lid != id);
        self.entries.len() != before
    }

    pub(crate) fn emit(&mut self, event: LayerEvent) {
        log::trace!("event {:?}", event);
        for (_, listener) in &mut self.entries {
            listener(&event);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}
