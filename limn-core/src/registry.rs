//! Maps symbolic model identifiers to loadable pipeline configurations.
//!
//! Adding a model family means adding one [`MODELS`] entry; dispatch and the
//! transport boundary stay untouched.

use hf_hub::api::tokio::Api;
use tracing::info;

use crate::error::RegistryError;
use crate::sd::SdLoader;
use crate::{DeviceMap, GenerationParams, Loader, PipelineLike};

/// Supported model architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelFamily {
    /// Latent-consistency distilled img2img models. Constrained to
    /// `steps <= origin_steps`.
    LatentConsistency,
    /// Plain Stable Diffusion v1.x img2img.
    StableDiffusion,
}

/// Numeric precision for device-resident weights. Falls back to f32 when the
/// selected device is the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precision {
    F16,
    F32,
}

/// Construction parameters for one model family entry.
#[derive(Debug, Clone)]
pub struct ModelSpec {
    /// Symbolic identifier selected at process start.
    pub name: &'static str,
    pub family: ModelFamily,
    /// Hugging Face repository holding the diffusers-layout weights.
    pub repo_id: &'static str,
    /// Pinned revision where reproducibility matters.
    pub revision: Option<&'static str>,
    pub precision: Precision,
    /// Whether content-safety filtering is applied to outputs.
    pub safety_checker: bool,
    /// Per-model generation defaults, overridable per request.
    pub defaults: GenerationParams,
}

pub const MODELS: &[ModelSpec] = &[
    ModelSpec {
        name: "dreamshaper",
        family: ModelFamily::LatentConsistency,
        repo_id: "SimianLuo/LCM_Dreamshaper_v7",
        revision: Some("fb9c5d167af11fd84454ae6493878b10bb63b067"),
        precision: Precision::F16,
        safety_checker: false,
        defaults: GenerationParams {
            steps: 10,
            guidance: 8.0,
            strength: 0.8,
            origin_steps: Some(50),
            seed: None,
        },
    },
    ModelSpec {
        name: "sd-v1-5",
        family: ModelFamily::StableDiffusion,
        repo_id: "runwayml/stable-diffusion-v1-5",
        revision: None,
        precision: Precision::F16,
        safety_checker: false,
        defaults: GenerationParams {
            steps: 30,
            guidance: 7.5,
            strength: 0.75,
            origin_steps: None,
            seed: None,
        },
    },
];

/// Resolves a symbolic identifier to its registry entry.
pub fn model_spec(name: &str) -> Result<&'static ModelSpec, RegistryError> {
    MODELS
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| RegistryError::UnsupportedModel(name.to_string()))
}

/// Loads the pipeline for `name`, acquiring device resources for the
/// lifetime of the returned handle.
///
/// Loading takes seconds and must happen at most once per process per
/// identifier; callers cache the handle rather than reload per request.
pub async fn load_model(
    name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Box<dyn PipelineLike>, RegistryError> {
    let spec = model_spec(name)?;
    info!(
        model = spec.name,
        repo = spec.repo_id,
        revision = spec.revision.unwrap_or("main"),
        family = ?spec.family,
        safety_checker = spec.safety_checker,
        "loading pipeline"
    );
    match spec.family {
        ModelFamily::LatentConsistency | ModelFamily::StableDiffusion => {
            let model = SdLoader::load(spec, api, device_map)
                .await
                .map_err(RegistryError::Load)?;
            Ok(Box::new(model))
        }
    }
}
