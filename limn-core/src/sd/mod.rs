use anyhow::{ensure, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::debug;

use crate::registry::{ModelFamily, ModelSpec, Precision};
use crate::{
    error::GenerationError, select_best_device, DeviceMap, GenerationParams, Loader, PipelineLike,
};

// The CLIP tokenizer is not shipped in diffusers-layout repositories.
const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";

// Latent scaling factor for the v1.x VAE.
const VAE_SCALE: f64 = 0.18215;

pub struct SdPipeline {
    spec: &'static ModelSpec,
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    text_model: ClipTextTransformer,
    vae: AutoEncoderKL,
    unet: UNet2DConditionModel,
    config: StableDiffusionConfig,
}

impl PipelineLike for SdPipeline {
    fn invoke(
        &mut self,
        prompt: &str,
        init_image: &DynamicImage,
        params: &GenerationParams,
    ) -> Result<DynamicImage, GenerationError> {
        Ok(self.run(prompt, init_image, params)?)
    }
}

impl SdPipeline {
    fn run(
        &mut self,
        prompt: &str,
        init_image: &DynamicImage,
        params: &GenerationParams,
    ) -> Result<DynamicImage> {
        ensure!(
            (0.0..=1.0).contains(&params.strength),
            "strength must be between 0 and 1, got {}",
            params.strength
        );
        if self.spec.family == ModelFamily::LatentConsistency {
            if let Some(origin_steps) = params.origin_steps {
                ensure!(
                    params.steps <= origin_steps,
                    "latent-consistency models require steps <= origin_steps ({} > {})",
                    params.steps,
                    origin_steps
                );
            }
        }

        // Optionally set seed for reproducibility.
        if let Some(seed) = params.seed {
            self.device.set_seed(seed)?;
        }

        let mut scheduler = self.config.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        // --- Compute prompt and unconditional embeddings for guidance ---
        let text_embeddings = Tensor::cat(
            &[self.text_embeddings("")?, self.text_embeddings(prompt)?],
            0,
        )?
        .to_dtype(self.dtype)?;

        // --- Encode the init image into the latent space ---
        let init_image = preprocess_image(init_image, &self.device)?.to_dtype(self.dtype)?;
        let init_latents = (self.vae.encode(&init_image)?.sample()? * VAE_SCALE)?;

        // Strength picks how far into the schedule denoising starts.
        let t_start = params.steps - (params.steps as f64 * params.strength) as usize;
        let mut latents = if t_start < timesteps.len() {
            let noise = init_latents.randn_like(0f64, 1f64)?;
            scheduler.add_noise(&init_latents, noise, timesteps[t_start])?
        } else {
            init_latents
        }
        .to_dtype(self.dtype)?;

        // --- Denoise through the provider's scheduler ---
        for (timestep_index, &timestep) in timesteps.iter().enumerate() {
            if timestep_index < t_start {
                continue;
            }
            let latent_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (uncond, cond) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred = (uncond + ((cond - uncond)? * params.guidance)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = timestep_index + 1, total = params.steps, "denoised");
        }

        // --- Decode latents and convert to a pixel buffer ---
        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let decoded = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let img = (decoded.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    /// Tokenizes and encodes one prompt, padded to the CLIP context length.
    fn text_embeddings(&self, prompt: &str) -> Result<Tensor> {
        let pad_id = match &self.config.clip.pad_with {
            Some(padding) => *self
                .tokenizer
                .get_vocab(true)
                .get(padding.as_str())
                .context("pad token not found in tokenizer vocab")?,
            None => *self
                .tokenizer
                .get_vocab(true)
                .get("<|endoftext|>")
                .context("end-of-text token not found in tokenizer vocab")?,
        };
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        ensure!(
            tokens.len() <= self.config.clip.max_position_embeddings,
            "prompt is too long ({} tokens > maximum {})",
            tokens.len(),
            self.config.clip.max_position_embeddings
        );
        tokens.resize(self.config.clip.max_position_embeddings, pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

/// Converts a pixel buffer to the (1, 3, height, width) tensor in `[-1, 1]`
/// the VAE encoder expects. Dimensions are snapped down to a multiple of 32.
fn preprocess_image(image: &DynamicImage, device: &Device) -> Result<Tensor> {
    let (height, width) = (image.height() as usize, image.width() as usize);
    let height = height - height % 32;
    let width = width - width % 32;
    ensure!(
        height > 0 && width > 0,
        "init image must be at least 32x32 pixels"
    );
    let image = image.resize_to_fill(
        width as u32,
        height as u32,
        image::imageops::FilterType::CatmullRom,
    );
    let data = image.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(data, (height, width, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor.to_device(device)?)
}

/// Converts a (3, height, width) u8 tensor into a pixel buffer.
fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    ensure!(channels == 3, "expected an image tensor with 3 channels");
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .context("error converting tensor to image buffer")?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

pub struct SdLoader;

impl Loader for SdLoader {
    type Model = SdPipeline;

    async fn load(spec: &'static ModelSpec, api: Api, device_map: DeviceMap) -> Result<Self::Model> {
        // Configure device and precision.
        let device = select_best_device(device_map).context("failed to set up device")?;
        let dtype = match spec.precision {
            Precision::F16 if !device.is_cpu() => DType::F16,
            _ => DType::F32,
        };

        let config = StableDiffusionConfig::v1_5(None, None, None);

        let repo = match spec.revision {
            Some(revision) => api.repo(hf_hub::Repo::with_revision(
                spec.repo_id.to_string(),
                hf_hub::RepoType::Model,
                revision.to_string(),
            )),
            None => api.repo(hf_hub::Repo::model(spec.repo_id.to_string())),
        };

        // --- Load CLIP tokenizer and text encoder ---
        let tokenizer_file = api
            .model(CLIP_TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let clip_weights = repo
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get text encoder weights")?;
        let text_model =
            stable_diffusion::build_clip_transformer(&config.clip, clip_weights, &device, dtype)
                .context("failed to load text encoder")?;

        // --- Load VAE ---
        let vae_weights = repo
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get VAE weights")?;
        let vae = config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load VAE")?;

        // --- Load UNet ---
        let unet_weights = repo
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get UNet weights")?;
        let unet = config
            .build_unet(unet_weights, &device, 4, false, dtype)
            .context("failed to load UNet")?;

        Ok(SdPipeline {
            spec,
            device,
            dtype,
            tokenizer,
            text_model,
            vae,
            unet,
            config,
        })
    }
}
