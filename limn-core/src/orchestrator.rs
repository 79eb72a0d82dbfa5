//! Batch generation over a single loaded pipeline.

use anyhow::anyhow;
use image::DynamicImage;
use std::sync::Mutex;
use tracing::info;

use crate::error::GenerationError;
use crate::{GenerationParams, PipelineLike};

/// Owns the process-wide pipeline handle and serializes access to it.
///
/// The underlying device context is single-tenant, so concurrent requests
/// queue on the lock rather than race.
pub struct Orchestrator {
    pipeline: Mutex<Box<dyn PipelineLike>>,
}

impl Orchestrator {
    pub fn new(pipeline: Box<dyn PipelineLike>) -> Self {
        Self {
            pipeline: Mutex::new(pipeline),
        }
    }

    /// Produces exactly `num_images` independent outputs from one
    /// prompt/source-image pair, in invocation order.
    ///
    /// The batch is all-or-nothing: the first failing invocation aborts it
    /// and no partial results are returned. Each invocation is synchronous
    /// and takes seconds; the lock is held for the whole batch.
    pub fn generate(
        &self,
        prompt: &str,
        init_image: &DynamicImage,
        num_images: usize,
        params: &GenerationParams,
    ) -> Result<Vec<DynamicImage>, GenerationError> {
        let mut pipeline = self
            .pipeline
            .lock()
            .map_err(|_| GenerationError::from(anyhow!("pipeline lock poisoned")))?;

        let mut images = Vec::with_capacity(num_images);
        for index in 0..num_images {
            let image = pipeline.invoke(prompt, init_image, params)?;
            info!(image = index + 1, batch = num_images, "generated image");
            images.push(image);
        }
        Ok(images)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_url::{data_url_to_image, image_to_data_url};
    use image::{ImageFormat, Rgb, RgbImage};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn test_params() -> GenerationParams {
        GenerationParams {
            steps: 10,
            guidance: 8.0,
            strength: 0.8,
            origin_steps: Some(50),
            seed: None,
        }
    }

    /// Pipeline stand-in that stamps the invocation index into the red
    /// channel of a 1x1 output, and optionally fails at a given call.
    struct CountingPipeline {
        calls: u8,
        fail_on_call: Option<u8>,
    }

    impl CountingPipeline {
        fn new() -> Self {
            Self {
                calls: 0,
                fail_on_call: None,
            }
        }

        fn failing_at(call: u8) -> Self {
            Self {
                calls: 0,
                fail_on_call: Some(call),
            }
        }
    }

    impl PipelineLike for CountingPipeline {
        fn invoke(
            &mut self,
            _prompt: &str,
            _init_image: &DynamicImage,
            _params: &GenerationParams,
        ) -> Result<DynamicImage, GenerationError> {
            self.calls += 1;
            if self.fail_on_call == Some(self.calls) {
                return Err(GenerationError::from(anyhow!("device fault")));
            }
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                1,
                1,
                Rgb([self.calls, 0, 0]),
            )))
        }
    }

    fn source_image() -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(1, 1, Rgb([255, 0, 0])))
    }

    #[test]
    fn batch_has_exactly_the_requested_cardinality() {
        let orchestrator = Orchestrator::new(Box::new(CountingPipeline::new()));
        let images = orchestrator
            .generate("a red square", &source_image(), 5, &test_params())
            .unwrap();
        assert_eq!(images.len(), 5);
    }

    #[test]
    fn zero_images_is_an_empty_batch() {
        let orchestrator = Orchestrator::new(Box::new(CountingPipeline::new()));
        let images = orchestrator
            .generate("a red square", &source_image(), 0, &test_params())
            .unwrap();
        assert!(images.is_empty());
    }

    #[test]
    fn outputs_preserve_invocation_order() {
        let orchestrator = Orchestrator::new(Box::new(CountingPipeline::new()));
        let images = orchestrator
            .generate("a red square", &source_image(), 3, &test_params())
            .unwrap();
        for (index, image) in images.iter().enumerate() {
            assert_eq!(image.to_rgb8().get_pixel(0, 0)[0], index as u8 + 1);
        }
    }

    #[test]
    fn mid_batch_failure_aborts_without_partial_results() {
        let orchestrator = Orchestrator::new(Box::new(CountingPipeline::failing_at(2)));
        let err = orchestrator
            .generate("a red square", &source_image(), 4, &test_params())
            .unwrap_err();
        assert!(err.to_string().contains("device fault"));
    }

    /// Pipeline stand-in that flags any overlapping invocations.
    struct ExclusivePipeline {
        in_flight: Arc<AtomicUsize>,
        overlapped: Arc<AtomicBool>,
    }

    impl PipelineLike for ExclusivePipeline {
        fn invoke(
            &mut self,
            _prompt: &str,
            _init_image: &DynamicImage,
            _params: &GenerationParams,
        ) -> Result<DynamicImage, GenerationError> {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) > 0 {
                self.overlapped.store(true, Ordering::SeqCst);
            }
            thread::sleep(Duration::from_millis(2));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                1,
                1,
                Rgb([0, 0, 0]),
            )))
        }
    }

    #[test]
    fn concurrent_callers_queue_on_the_pipeline_lock() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let orchestrator = Arc::new(Orchestrator::new(Box::new(ExclusivePipeline {
            in_flight: Arc::clone(&in_flight),
            overlapped: Arc::clone(&overlapped),
        })));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let orchestrator = Arc::clone(&orchestrator);
                thread::spawn(move || {
                    orchestrator.generate("a red square", &source_image(), 3, &test_params())
                })
            })
            .collect();
        for handle in handles {
            let images = handle.join().unwrap().unwrap();
            assert_eq!(images.len(), 3);
        }
        assert!(!overlapped.load(Ordering::SeqCst));
    }

    #[test]
    fn red_pixel_end_to_end_through_codec_and_orchestrator() {
        // data:image/png;base64,<1x1 red pixel> -> decode -> generate(2)
        // -> encode each output back to a well-formed PNG data URL.
        let source_url = image_to_data_url(&source_image(), ImageFormat::Png).unwrap();
        let decoded = data_url_to_image(&source_url).unwrap();

        let orchestrator = Orchestrator::new(Box::new(CountingPipeline::new()));
        let images = orchestrator
            .generate("a red square", &decoded, 2, &test_params())
            .unwrap();
        assert_eq!(images.len(), 2);

        for image in &images {
            let url = image_to_data_url(image, ImageFormat::Png).unwrap();
            assert!(url.starts_with("data:image/png;base64,"));
            assert!(data_url_to_image(&url).is_ok());
        }
    }
}
