//! Rendering subsystem
//!
//! The engine talks to the GPU exclusively through [`api::VideoBackend`],
//! selected once at startup from the renderer configuration. [`Renderer`]
//! owns the backend trait object and drives the frame lifecycle; resource
//! creation and drawing go straight through to the backend.

pub mod api;
pub mod backends;
pub mod config;
pub mod error;
pub mod frame;
pub mod loader;
pub mod shader_format;
pub mod surface;

pub use config::RendererConfig;
pub use error::{RenderError, RenderResult};
pub use surface::RenderSurface;

use std::any::Any;

use api::VideoBackend;
use loader::{LoadedResource, LoaderRegistry, ResourceLoader};

/// Owns the selected video backend and drives the frame lifecycle
pub struct Renderer {
    backend: Box<dyn VideoBackend>,
    loaders: LoaderRegistry,
}

impl Renderer {
    /// Initialize the renderer over a window surface
    pub fn new(config: &RendererConfig, surface: &dyn RenderSurface) -> RenderResult<Self> {
        let backend = backends::create_backend(config, Some(surface))?;
        log::info!("Renderer initialized with {:?} backend", backend.api());
        Ok(Self {
            backend,
            loaders: LoaderRegistry::with_defaults(),
        })
    }

    /// Initialize without a window, forcing the stub backend. Used by
    /// headless tools and tests.
    pub fn headless(config: &RendererConfig) -> RenderResult<Self> {
        let mut config = config.clone().sanitized();
        config.api = api::VideoApi::Null;
        let backend = backends::create_backend(&config, None)?;
        Ok(Self {
            backend,
            loaders: LoaderRegistry::with_defaults(),
        })
    }

    /// Register a loader for an additional resource type name
    pub fn register_loader(&mut self, type_name: &'static str, loader: Box<dyn ResourceLoader>) {
        self.loaders.register(type_name, loader);
    }

    /// Load raw asset bytes through the loader registered for `type_name`
    /// (`"shader"` and `"texture"` are registered at construction)
    pub fn load_resource(
        &mut self,
        type_name: &str,
        bytes: &[u8],
        udata: Option<&dyn Any>,
    ) -> RenderResult<LoadedResource> {
        self.loaders
            .load(type_name, self.backend.as_mut(), bytes, udata)
    }

    /// Release a resource produced by [`Renderer::load_resource`]
    pub fn unload_resource(
        &mut self,
        type_name: &str,
        resource: LoadedResource,
    ) -> RenderResult<()> {
        self.loaders
            .unload(type_name, self.backend.as_mut(), resource)
    }

    /// Access the backend
    pub fn backend(&self) -> &dyn VideoBackend {
        self.backend.as_ref()
    }

    /// Access the backend mutably; all resource and drawing calls go here
    pub fn backend_mut(&mut self) -> &mut dyn VideoBackend {
        self.backend.as_mut()
    }

    /// Begin recording the next frame
    pub fn begin_frame(&mut self) -> RenderResult<()> {
        self.backend.begin_frame()
    }

    /// Submit and present the recorded frame
    pub fn end_frame(&mut self) -> RenderResult<()> {
        self.backend.end_frame()
    }

    /// Notify the renderer that the window surface changed size
    pub fn handle_resize(&mut self) {
        self.backend.request_swapchain_recreation();
    }

    /// Block until the GPU is idle; call before tearing down resources
    /// that may still be referenced by in-flight frames
    pub fn wait_idle(&self) {
        self.backend.wait_idle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_renderer_uses_stub() {
        let renderer = Renderer::headless(&RendererConfig::default()).unwrap();
        assert_eq!(renderer.backend().api(), api::VideoApi::Null);
    }

    #[test]
    fn test_default_loaders_registered() {
        let mut renderer = Renderer::headless(&RendererConfig::default()).unwrap();
        let bytes =
            shader_format::ShaderBinaryBuilder::compute(vec![0; 8], Vec::new()).build();
        let loaded = renderer.load_resource("shader", &bytes, None).unwrap();
        assert!(matches!(loaded, LoadedResource::Shader(_)));
        renderer.unload_resource("shader", loaded).unwrap();

        assert!(matches!(
            renderer.load_resource("mesh", &[], None),
            Err(RenderError::UnknownName(_))
        ));
    }

    #[test]
    fn test_headless_frame_cycle() {
        let mut renderer = Renderer::headless(&RendererConfig::default()).unwrap();
        let frames = renderer.backend().frames_in_flight();
        for _ in 0..frames {
            renderer.begin_frame().unwrap();
            renderer.end_frame().unwrap();
        }
        assert_eq!(renderer.backend().current_frame(), 0);
    }
}
