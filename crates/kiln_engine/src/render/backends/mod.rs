//! Concrete video backend implementations and selection

pub mod null;
pub mod vulkan;

pub use null::NullBackend;
pub use vulkan::VulkanBackend;

use crate::render::api::{VideoApi, VideoBackend};
use crate::render::config::RendererConfig;
use crate::render::error::{RenderError, RenderResult};
use crate::render::surface::RenderSurface;

/// Instantiate the backend selected by the configuration
///
/// The stub backend runs without a window; Vulkan requires one. OpenGL is
/// not implemented and resolves to the stub so content can still be loaded
/// and exercised.
pub fn create_backend(
    config: &RendererConfig,
    surface: Option<&dyn RenderSurface>,
) -> RenderResult<Box<dyn VideoBackend>> {
    let config = config.clone().sanitized();
    match config.api {
        VideoApi::Vulkan => {
            let surface = surface.ok_or_else(|| {
                RenderError::InitializationFailed(
                    "the Vulkan backend requires a window surface".to_string(),
                )
            })?;
            Ok(Box::new(VulkanBackend::new(surface, &config)?))
        }
        VideoApi::OpenGl => {
            log::warn!("OpenGL backend is not implemented; falling back to the stub backend");
            Ok(Box::new(stub_backend(&config, surface)))
        }
        VideoApi::Null => Ok(Box::new(stub_backend(&config, surface))),
    }
}

fn stub_backend(config: &RendererConfig, surface: Option<&dyn RenderSurface>) -> NullBackend {
    let drawable_size = surface.map(|s| s.drawable_size()).unwrap_or((1280, 720));
    NullBackend::new(config.frames_in_flight, drawable_size, config.clear_color)
}
