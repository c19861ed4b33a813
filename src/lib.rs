//! Layer stack and compositing engine.
//!
//! A [`LayerStack`] owns an ordered set of [`Layer`]s (index 0 at the bottom),
//! tracks the active layer and composites visible layers into a single RGBA
//! image. Surfaces are sparse, chunked and copy-on-write ([`TiledImage`]);
//! pixels are straight (non-premultiplied) RGBA8 throughout.

pub mod blend;
pub mod canvas;
pub mod config;
pub mod error;
pub mod events;
pub mod io;
pub mod layer;
pub mod logger;
pub mod ops;
pub mod stack;

pub use blend::BlendMode;
pub use canvas::TiledImage;
pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use events::{LayerChange, LayerEvent, ListenerId};
pub use io::{LayerRecord, RasterFormat, RasterSource};
pub use layer::{Layer, LayerId, LayerOptions};
pub use ops::shapes::{LineCap, LineJoin, Point, Primitive, Shadow, StrokeStyle};
pub use stack::{DecodeOutcome, DecodeReport, DecodeTicket, LayerStack};
