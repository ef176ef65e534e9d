//! Resource loaders for the video backend
//!
//! Thin seam between on-disk asset bytes and GPU resources: a shader
//! loader that decodes the engine's shader binary format and a texture
//! loader that decodes PNG (or any format the `image` crate recognizes)
//! into a tightly-packed RGBA upload. Loaders validate on the host before
//! touching the backend so a bad asset fails with a useful error instead
//! of a driver one.

use std::any::Any;
use std::collections::HashMap;
use std::path::Path;

use crate::render::api::{
    PixelFormat, ShaderHandle, TextureDesc, TextureFlags, TextureHandle, VideoBackend,
};
use crate::render::error::{RenderError, RenderResult};
use crate::render::shader_format;

/// A backend resource produced by a registered loader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadedResource {
    /// An uploaded shader
    Shader(ShaderHandle),
    /// An uploaded texture
    Texture(TextureHandle),
}

/// Load/unload callbacks one resource type registers with the loader
/// subsystem
///
/// `udata` carries type-specific load parameters (the texture loader reads
/// [`TextureFlags`] from it); loaders that take none ignore it.
pub trait ResourceLoader {
    /// Turn raw asset bytes into an uploaded backend resource
    fn load(
        &self,
        backend: &mut dyn VideoBackend,
        bytes: &[u8],
        udata: Option<&dyn Any>,
    ) -> RenderResult<LoadedResource>;

    /// Release a resource this loader produced
    fn unload(&self, backend: &mut dyn VideoBackend, resource: LoadedResource);
}

/// Registry mapping resource type names to their loader callbacks
///
/// The cache keyed by `(type, filename)` lives with the asset subsystem;
/// this is only the registration seam it calls through.
#[derive(Default)]
pub struct LoaderRegistry {
    loaders: HashMap<&'static str, Box<dyn ResourceLoader>>,
}

impl LoaderRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the engine's `"shader"` and `"texture"` loaders
    /// registered
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("shader", Box::new(ShaderLoader));
        registry.register("texture", Box::new(TextureLoader));
        registry
    }

    /// Register (or replace) the loader for a type name
    pub fn register(&mut self, type_name: &'static str, loader: Box<dyn ResourceLoader>) {
        if self.loaders.insert(type_name, loader).is_some() {
            log::warn!("Replacing registered loader for {type_name:?}");
        }
    }

    /// Load raw asset bytes through the named type's callbacks
    pub fn load(
        &self,
        type_name: &str,
        backend: &mut dyn VideoBackend,
        bytes: &[u8],
        udata: Option<&dyn Any>,
    ) -> RenderResult<LoadedResource> {
        self.loaders
            .get(type_name)
            .ok_or_else(|| RenderError::UnknownName(type_name.to_string()))?
            .load(backend, bytes, udata)
    }

    /// Release a resource through the named type's callbacks
    pub fn unload(
        &self,
        type_name: &str,
        backend: &mut dyn VideoBackend,
        resource: LoadedResource,
    ) -> RenderResult<()> {
        self.loaders
            .get(type_name)
            .ok_or_else(|| RenderError::UnknownName(type_name.to_string()))?
            .unload(backend, resource);
        Ok(())
    }
}

/// The `"shader"` loader: validates a shader binary and uploads it
pub struct ShaderLoader;

impl ResourceLoader for ShaderLoader {
    fn load(
        &self,
        backend: &mut dyn VideoBackend,
        bytes: &[u8],
        _udata: Option<&dyn Any>,
    ) -> RenderResult<LoadedResource> {
        let resource = ShaderResource::from_bytes(bytes.to_vec())?;
        resource.upload(backend).map(LoadedResource::Shader)
    }

    fn unload(&self, backend: &mut dyn VideoBackend, resource: LoadedResource) {
        match resource {
            LoadedResource::Shader(handle) => backend.destroy_shader(handle),
            other => log::error!("Shader loader asked to unload {other:?}"),
        }
    }
}

/// The `"texture"` loader: decodes an encoded image and uploads it;
/// `udata` may carry [`TextureFlags`]
pub struct TextureLoader;

impl ResourceLoader for TextureLoader {
    fn load(
        &self,
        backend: &mut dyn VideoBackend,
        bytes: &[u8],
        udata: Option<&dyn Any>,
    ) -> RenderResult<LoadedResource> {
        let flags = udata
            .and_then(|data| data.downcast_ref::<TextureFlags>())
            .copied()
            .unwrap_or_else(TextureFlags::empty);
        let resource = TextureResource::from_encoded(bytes, flags)?;
        resource.upload(backend).map(LoadedResource::Texture)
    }

    fn unload(&self, backend: &mut dyn VideoBackend, resource: LoadedResource) {
        match resource {
            LoadedResource::Texture(handle) => backend.destroy_texture(handle),
            other => log::error!("Texture loader asked to unload {other:?}"),
        }
    }
}

/// A shader asset: validated bytes ready for `create_shader`
#[derive(Debug, Clone)]
pub struct ShaderResource {
    bytes: Vec<u8>,
    is_compute: bool,
}

impl ShaderResource {
    /// Validate a shader binary without uploading it
    pub fn from_bytes(bytes: Vec<u8>) -> RenderResult<Self> {
        let header = shader_format::decode(&bytes)
            .map_err(|e| RenderError::ResourceCreationFailed(e.to_string()))?;
        Ok(Self {
            is_compute: header.is_compute(),
            bytes,
        })
    }

    /// Read and validate a shader binary from disk
    pub fn from_file<P: AsRef<Path>>(path: P) -> RenderResult<Self> {
        let path = path.as_ref();
        log::debug!("Loading shader from {:?}", path);
        let bytes = std::fs::read(path).map_err(|e| {
            RenderError::ResourceCreationFailed(format!("Failed to read {path:?}: {e}"))
        })?;
        Self::from_bytes(bytes)
    }

    /// Whether the binary holds a compute shader
    pub fn is_compute(&self) -> bool {
        self.is_compute
    }

    /// Raw binary, for inspection
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Upload to the backend
    pub fn upload(&self, backend: &mut dyn VideoBackend) -> RenderResult<ShaderHandle> {
        backend.create_shader(&self.bytes)
    }
}

/// A texture asset: decoded RGBA pixels ready for `create_texture`
#[derive(Debug, Clone)]
pub struct TextureResource {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    flags: TextureFlags,
}

impl TextureResource {
    /// Decode an encoded image (PNG and friends) into RGBA8
    pub fn from_encoded(bytes: &[u8], flags: TextureFlags) -> RenderResult<Self> {
        let decoded = image::load_from_memory(bytes).map_err(|e| {
            RenderError::ResourceCreationFailed(format!("Failed to decode image: {e}"))
        })?;
        let rgba = decoded.to_rgba8();
        let (width, height) = rgba.dimensions();
        log::debug!("Decoded {}x{} image", width, height);
        Ok(Self {
            pixels: rgba.into_raw(),
            width,
            height,
            flags,
        })
    }

    /// Read and decode an image file from disk
    pub fn from_file<P: AsRef<Path>>(path: P, flags: TextureFlags) -> RenderResult<Self> {
        let path = path.as_ref();
        log::debug!("Loading texture from {:?}", path);
        let bytes = std::fs::read(path).map_err(|e| {
            RenderError::ResourceCreationFailed(format!("Failed to read {path:?}: {e}"))
        })?;
        Self::from_encoded(&bytes, flags)
    }

    /// Build from raw RGBA pixels, checked for size consistency
    pub fn from_rgba(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        flags: TextureFlags,
    ) -> RenderResult<Self> {
        let expected = width as usize * height as usize * 4;
        if pixels.len() != expected {
            return Err(RenderError::ResourceCreationFailed(format!(
                "pixel data is {} bytes, expected {} for {}x{}",
                pixels.len(),
                expected,
                width,
                height
            )));
        }
        Ok(Self {
            pixels,
            width,
            height,
            flags,
        })
    }

    /// A solid-color texture, for placeholders and tests
    pub fn solid_color(width: u32, height: u32, color: [u8; 4]) -> Self {
        let mut pixels = Vec::with_capacity(width as usize * height as usize * 4);
        for _ in 0..width * height {
            pixels.extend_from_slice(&color);
        }
        Self {
            pixels,
            width,
            height,
            flags: TextureFlags::empty(),
        }
    }

    /// Image dimensions `(width, height)`
    pub fn size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Decoded pixel bytes
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Upload to the backend
    pub fn upload(&self, backend: &mut dyn VideoBackend) -> RenderResult<TextureHandle> {
        backend.create_texture(
            &TextureDesc {
                width: self.width,
                height: self.height,
                format: PixelFormat::Rgba8,
                flags: self.flags,
            },
            &self.pixels,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::api::{PipelineDesc, PipelineFlags, PrimitiveTopology};
    use crate::render::backends::NullBackend;
    use crate::render::shader_format::ShaderBinaryBuilder;

    #[test]
    fn test_shader_resource_validates() {
        let good = ShaderBinaryBuilder::compute(vec![0; 8], b"/* glsl */".to_vec()).build();
        let resource = ShaderResource::from_bytes(good).unwrap();
        assert!(resource.is_compute());

        let err = ShaderResource::from_bytes(vec![1, 2, 3]).unwrap_err();
        assert!(matches!(err, RenderError::ResourceCreationFailed(_)));
    }

    #[test]
    fn test_texture_from_rgba_checks_size() {
        assert!(TextureResource::from_rgba(vec![0; 16], 2, 2, TextureFlags::empty()).is_ok());
        assert!(TextureResource::from_rgba(vec![0; 15], 2, 2, TextureFlags::empty()).is_err());
    }

    #[test]
    fn test_solid_color_layout() {
        let tex = TextureResource::solid_color(2, 1, [10, 20, 30, 40]);
        assert_eq!(tex.size(), (2, 1));
        assert_eq!(tex.pixels(), &[10, 20, 30, 40, 10, 20, 30, 40]);
    }

    #[test]
    fn test_registry_shader_load_and_unload() {
        let mut backend = NullBackend::new(2, (64, 64), [0.0; 4]);
        let registry = LoaderRegistry::with_defaults();
        let bytes = ShaderBinaryBuilder::compute(vec![0; 8], Vec::new()).build();

        let loaded = registry
            .load("shader", &mut backend, &bytes, None)
            .unwrap();
        let LoadedResource::Shader(handle) = loaded else {
            panic!("shader loader produced {loaded:?}");
        };
        registry.unload("shader", &mut backend, loaded).unwrap();
        // The handle is stale once unloaded.
        let default_framebuffer = backend.default_framebuffer();
        assert!(backend
            .create_pipeline(&PipelineDesc {
                flags: PipelineFlags::empty(),
                topology: PrimitiveTopology::TriangleList,
                shader: handle,
                framebuffer: default_framebuffer,
                vertex_layout: None,
                sets: vec![],
            })
            .is_err());
    }

    #[test]
    fn test_registry_texture_flags_through_udata() {
        let mut backend = NullBackend::new(2, (64, 64), [0.0; 4]);
        let registry = LoaderRegistry::with_defaults();

        let mut png = std::io::Cursor::new(Vec::new());
        image::RgbaImage::from_pixel(2, 2, image::Rgba([9, 9, 9, 255]))
            .write_to(&mut png, image::ImageFormat::Png)
            .unwrap();

        let flags = TextureFlags::FILTER_NEAREST;
        let loaded = registry
            .load("texture", &mut backend, png.get_ref(), Some(&flags))
            .unwrap();
        let LoadedResource::Texture(handle) = loaded else {
            panic!("texture loader produced {loaded:?}");
        };
        assert_eq!(backend.texture_size(handle).unwrap(), (2, 2));
    }

    #[test]
    fn test_registry_rejects_unknown_type() {
        let mut backend = NullBackend::new(2, (64, 64), [0.0; 4]);
        let registry = LoaderRegistry::with_defaults();
        assert!(matches!(
            registry.load("mesh", &mut backend, &[], None),
            Err(RenderError::UnknownName(_))
        ));
    }
}
