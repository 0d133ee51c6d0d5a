use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use log::info;

use crate::{
    descriptor::DescriptorHandle,
    frame::GraphicsContext,
    image::{ImageDecoder, MipChain, PngDecoder},
    upload::Texture,
    Result,
};

/// A loaded texture and the shader-resource slot its view lives in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureHandle {
    pub texture: Texture,
    pub descriptor: DescriptorHandle,
}

impl TextureHandle {
    #[must_use]
    pub fn slot(&self) -> u32 {
        self.descriptor.index
    }
}

/// Textures by path or name. Each key is loaded at most once; slots are never
/// reused, so a slot handed out here stays valid for the life of the context.
pub struct TextureRegistry {
    decoder: Box<dyn ImageDecoder>,
    textures: HashMap<PathBuf, TextureHandle>,
}

impl TextureRegistry {
    #[must_use]
    pub fn new(decoder: Box<dyn ImageDecoder>) -> Self {
        Self {
            decoder,
            textures: HashMap::new(),
        }
    }

    /// Decodes the image at `path` and uploads it, or returns the existing
    /// handle if it has been loaded before.
    ///
    /// Decode failures are recoverable; nothing is allocated for them.
    pub fn load(&mut self, context: &mut GraphicsContext, path: &Path) -> Result<TextureHandle> {
        if let Some(handle) = self.textures.get(path) {
            return Ok(*handle);
        }

        let image = self.decoder.decode(path)?;
        let handle = Self::upload(context, &image)?;

        info!(
            "loaded texture {} into slot {} ({}x{}, {} levels)",
            path.display(),
            handle.slot(),
            image.width(),
            image.height(),
            image.mip_levels()
        );

        self.textures.insert(path.to_owned(), handle);
        Ok(handle)
    }

    /// Registers an image that is already in memory under `key`. Like
    /// [`Self::load`], a key that is already present is not uploaded again.
    pub fn insert(
        &mut self,
        context: &mut GraphicsContext,
        key: impl Into<PathBuf>,
        image: &MipChain,
    ) -> Result<TextureHandle> {
        let key = key.into();
        if let Some(handle) = self.textures.get(&key) {
            return Ok(*handle);
        }

        let handle = Self::upload(context, image)?;
        self.textures.insert(key, handle);
        Ok(handle)
    }

    fn upload(context: &mut GraphicsContext, image: &MipChain) -> Result<TextureHandle> {
        let (texture, descriptor) = context.create_texture(image)?;
        Ok(TextureHandle {
            texture,
            descriptor,
        })
    }

    #[must_use]
    pub fn get(&self, key: &Path) -> Option<TextureHandle> {
        self.textures.get(key).copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.textures.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }
}

impl Default for TextureRegistry {
    fn default() -> Self {
        Self::new(Box::new(PngDecoder::default()))
    }
}
