pub mod data_url;
pub mod device_map;
pub mod error;
pub mod orchestrator;
pub mod registry;

mod sd;

pub use device_map::*;
pub use error::*;
pub use orchestrator::Orchestrator;
pub use registry::{load_model, model_spec, ModelFamily, ModelSpec, Precision, MODELS};

use hf_hub::api::tokio::Api;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use std::future::Future;

/// One inbound generation request: a data-URL encoded source image, a text
/// prompt, and optional parameter overrides.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct DiffusionRequest {
    /// Source image as a `data:image/<subtype>;base64,...` string.
    #[serde(rename = "im_dataurl")]
    pub image_data_url: String,
    pub prompt: String,
    #[serde(default)]
    pub params: GenerationOverrides,
}

/// Fully resolved parameters for one pipeline invocation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    /// Number of denoising steps.
    pub steps: usize,
    /// Classifier-free guidance scale.
    pub guidance: f64,
    /// Init-image influence in `[0, 1]`; higher values diverge further from
    /// the source image.
    pub strength: f64,
    /// Discretization the distilled model was trained against. Only
    /// meaningful for latent-consistency models, where `steps` must not
    /// exceed it.
    pub origin_steps: Option<usize>,
    /// RNG seed for reproducibility; unset means the device default.
    pub seed: Option<u64>,
}

/// Request-level overrides, merged onto the selected model's defaults.
///
/// Unknown option names are rejected at deserialization time rather than
/// deep inside the model call.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, Default, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct GenerationOverrides {
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub strength: Option<f64>,
    pub origin_steps: Option<usize>,
    pub seed: Option<u64>,
}

impl GenerationOverrides {
    pub fn resolve(&self, defaults: &GenerationParams) -> GenerationParams {
        GenerationParams {
            steps: self.steps.unwrap_or(defaults.steps),
            guidance: self.guidance.unwrap_or(defaults.guidance),
            strength: self.strength.unwrap_or(defaults.strength),
            origin_steps: self.origin_steps.or(defaults.origin_steps),
            seed: self.seed.or(defaults.seed),
        }
    }
}

/// An opaque, ready-to-invoke generative pipeline. One call produces one
/// output image; batching is the orchestrator's job.
pub trait PipelineLike: Send {
    fn invoke(
        &mut self,
        prompt: &str,
        init_image: &DynamicImage,
        params: &GenerationParams,
    ) -> Result<DynamicImage, error::GenerationError>;
}

pub trait Loader {
    type Model: PipelineLike;

    fn load(
        spec: &'static ModelSpec,
        api: Api,
        device_map: DeviceMap,
    ) -> impl Future<Output = anyhow::Result<Self::Model>>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_uses_original_wire_names() {
        let req: DiffusionRequest = serde_json::from_str(
            r#"{"im_dataurl": "data:image/png;base64,AAAA", "prompt": "a red square"}"#,
        )
        .unwrap();
        assert_eq!(req.image_data_url, "data:image/png;base64,AAAA");
        assert_eq!(req.prompt, "a red square");
        assert_eq!(req.params, GenerationOverrides::default());
    }

    #[test]
    fn request_missing_prompt_is_rejected() {
        let err = serde_json::from_str::<DiffusionRequest>(r#"{"im_dataurl": "x"}"#);
        assert!(err.is_err());
    }

    #[test]
    fn unknown_generation_option_is_rejected() {
        let err = serde_json::from_str::<GenerationOverrides>(r#"{"setps": 4}"#);
        assert!(err.is_err());
    }

    #[test]
    fn overrides_merge_onto_defaults() {
        let defaults = GenerationParams {
            steps: 10,
            guidance: 8.0,
            strength: 0.8,
            origin_steps: Some(50),
            seed: None,
        };
        let overrides = GenerationOverrides {
            steps: Some(4),
            seed: Some(42),
            ..Default::default()
        };
        let resolved = overrides.resolve(&defaults);
        assert_eq!(resolved.steps, 4);
        assert_eq!(resolved.guidance, 8.0);
        assert_eq!(resolved.strength, 0.8);
        assert_eq!(resolved.origin_steps, Some(50));
        assert_eq!(resolved.seed, Some(42));
    }

    #[test]
    fn empty_overrides_keep_defaults() {
        let defaults = GenerationParams {
            steps: 30,
            guidance: 7.5,
            strength: 0.75,
            origin_steps: None,
            seed: None,
        };
        assert_eq!(GenerationOverrides::default().resolve(&defaults), defaults);
    }
}
