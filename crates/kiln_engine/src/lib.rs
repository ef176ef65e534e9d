//! # Kiln Engine
//!
//! A cross-platform rendering engine core built around a pluggable video
//! backend. The primary backend is Vulkan; a CPU-side stub backend mirrors
//! the same contract for headless use and testing.
//!
//! The engine is organised around an N-frames-in-flight lifecycle:
//!
//! - [`render::Renderer::begin_frame`] waits for the current slot's fence,
//!   acquires a presentable image and starts command recording
//! - framebuffer, pipeline, buffer and texture operations record commands
//!   or enqueue deferred host writes
//! - [`render::Renderer::end_frame`] flushes the slot's pending writes,
//!   submits, presents, drains deferred destructions and advances the
//!   frame index
//!
//! Windowing, input and the generic resource cache are collaborators, not
//! parts of this crate: the engine consumes a [`render::RenderSurface`]
//! for drawable size and native surface handles, and exposes loader
//! callbacks for `"shader"` and `"texture"` assets.

pub mod config;
pub mod render;

pub use render::{RenderError, RenderResult, Renderer, RendererConfig};
