use crate::error::PipelineError;
use crate::pipeline::PanoramaPipeline;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vista_gpu::LoadedTexture;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneState {
    Empty,
    Loading { url: String },
    Ready { url: String },
    /// The panorama could not be loaded; loading again is allowed
    Failed { url: String, reason: String },
}

/// Texture currently displayed by a scene.
///
/// A new texture is swapped in before the previous one is released, so the scene never shows an
/// empty frame between panoramas. Dropping the slot cancels its pending load and releases the
/// texture.
#[derive(Debug)]
pub struct SceneTextureSlot {
    pipeline: Arc<PanoramaPipeline>,
    token: CancellationToken,
    texture: Option<LoadedTexture>,
    state: SceneState,
}

impl SceneTextureSlot {
    pub fn new(pipeline: Arc<PanoramaPipeline>) -> Self {
        Self {
            pipeline,
            token: CancellationToken::new(),
            texture: None,
            state: SceneState::Empty,
        }
    }

    /// Token cancelled when the scene goes away. Clone it into whatever loads on the scene's
    /// behalf.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn state(&self) -> &SceneState {
        &self.state
    }

    pub fn texture(&self) -> Option<&LoadedTexture> {
        self.texture.as_ref()
    }

    /// Load `url` and install it. On failure the previous texture stays on screen.
    pub async fn load(&mut self, url: &str) -> Result<(), PipelineError> {
        self.state = SceneState::Loading {
            url: url.to_string(),
        };
        match self
            .pipeline
            .load_panorama_for_scene(url, &self.token)
            .await
        {
            Ok(texture) => {
                self.install(url, texture);
                Ok(())
            }
            Err(e) => {
                self.fail(url, &e);
                Err(e)
            }
        }
    }

    /// Display `texture`, then release whatever was displayed before
    pub fn install(&mut self, url: &str, texture: LoadedTexture) {
        let previous = self.texture.replace(texture);
        self.state = SceneState::Ready {
            url: url.to_string(),
        };
        if let Some(previous) = previous {
            let freed = self.pipeline.release_scene_texture(previous);
            tracing::debug!(url = %url, freed_mb = freed, "Replaced scene panorama");
        }
    }

    pub fn fail(&mut self, url: &str, error: &PipelineError) {
        tracing::error!(url = %url, "Scene panorama failed to load: {error}");
        self.state = SceneState::Failed {
            url: url.to_string(),
            reason: error.to_string(),
        };
    }

    /// Cancel pending loads and release the displayed texture
    pub fn teardown(self) {
        drop(self)
    }
}

impl Drop for SceneTextureSlot {
    fn drop(&mut self) {
        self.token.cancel();
        if let Some(texture) = self.texture.take() {
            self.pipeline.release_scene_texture(texture);
        }
        self.state = SceneState::Empty;
    }
}
