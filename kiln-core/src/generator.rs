//! The generation facade: validation, admission, pipeline dispatch and encoding.

use std::fmt;
use std::sync::Arc;

use image::{GrayImage, RgbImage};
use tracing::{error, info, warn};

use crate::{
    codec, log_memory, GenerationDefaults, GenerationError, GenerationGate, GenerationRequest,
    GpuTelemetry, Pipeline, Result,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationMode {
    TextToImage,
    ImageToImage,
    Inpaint,
}

impl fmt::Display for GenerationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TextToImage => "txt2img",
            Self::ImageToImage => "img2img",
            Self::Inpaint => "inpaint",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GenerationResult {
    /// PNG data URIs, in pipeline order.
    pub images: Vec<String>,
    pub duration_seconds: f64,
}

enum Conditioning {
    None,
    Image(RgbImage),
    Masked(RgbImage, GrayImage),
}

pub struct Generator {
    pipeline: Arc<dyn Pipeline>,
    gate: GenerationGate,
    defaults: GenerationDefaults,
    telemetry: Option<Arc<dyn GpuTelemetry>>,
}

impl Generator {
    pub fn new(pipeline: Arc<dyn Pipeline>, defaults: GenerationDefaults) -> Self {
        Self {
            pipeline,
            gate: GenerationGate::new(),
            defaults,
            telemetry: None,
        }
    }

    /// Log accelerator memory from `telemetry` before and after every generation.
    pub fn with_telemetry(mut self, telemetry: Arc<dyn GpuTelemetry>) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    pub fn gate(&self) -> &GenerationGate {
        &self.gate
    }

    pub fn pipeline(&self) -> &dyn Pipeline {
        self.pipeline.as_ref()
    }

    pub fn generate(
        &self,
        mode: GenerationMode,
        request: &GenerationRequest,
    ) -> Result<GenerationResult> {
        match mode {
            GenerationMode::TextToImage => self.text_to_image(request),
            GenerationMode::ImageToImage => self.image_to_image(request),
            GenerationMode::Inpaint => self.inpaint(request),
        }
    }

    pub fn text_to_image(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        if !request.has_prompt() {
            return Err(GenerationError::Validation("Prompt is required".to_string()));
        }
        self.run(GenerationMode::TextToImage, request, Conditioning::None)
    }

    pub fn image_to_image(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let source = match request.source_image() {
            Some(source) if request.has_prompt() => source,
            _ => {
                return Err(GenerationError::Validation(
                    "Prompt and image are required".to_string(),
                ))
            }
        };
        let image = codec::decode_data_uri(source)?;
        let request = request.clone().with_default_size(image.width(), image.height());
        self.run(GenerationMode::ImageToImage, &request, Conditioning::Image(image))
    }

    pub fn inpaint(&self, request: &GenerationRequest) -> Result<GenerationResult> {
        let (source, mask) = match (request.source_image(), request.mask_image()) {
            (Some(source), Some(mask)) if request.has_prompt() => (source, mask),
            _ => {
                return Err(GenerationError::Validation(
                    "Prompt, image, and mask are required".to_string(),
                ))
            }
        };
        let image = codec::decode_data_uri(source)?;
        let mask = codec::decode_mask(mask)?;
        let request = request.clone().with_default_size(image.width(), image.height());
        self.run(GenerationMode::Inpaint, &request, Conditioning::Masked(image, mask))
    }

    /// Force the gate back to idle and clear caches. The running pipeline call, if any,
    /// is not cancelled; it finishes or fails on its own.
    pub fn interrupt(&self) {
        self.gate.release();
        self.pipeline.clear_cache();
        warn!("Generation interrupted");
    }

    fn log_memory(&self) {
        if let Some(telemetry) = &self.telemetry {
            log_memory(telemetry.as_ref());
        }
    }

    fn run(
        &self,
        mode: GenerationMode,
        request: &GenerationRequest,
        conditioning: Conditioning,
    ) -> Result<GenerationResult> {
        let permit = self
            .gate
            .try_acquire(&request.prompt)
            .ok_or(GenerationError::Busy)?;
        let params = request.normalize(&self.defaults);

        info!(
            %mode,
            prompt = %preview(&params.prompt),
            steps = params.steps,
            cfg_scale = params.cfg_scale,
            width = params.width,
            height = params.height,
            batch_size = params.batch_size,
            strength = params.strength,
            "starting generation"
        );
        self.log_memory();

        let outcome = match &conditioning {
            Conditioning::None => self.pipeline.text_to_image(&params),
            Conditioning::Image(image) => self.pipeline.image_to_image(&params, image),
            Conditioning::Masked(image, mask) => self.pipeline.inpaint(&params, image, mask),
        }
        .map_err(|e| GenerationError::Pipeline(format!("{e:#}")))
        .and_then(|images| {
            images
                .iter()
                .map(codec::encode_data_uri)
                .collect::<Result<Vec<_>>>()
        });

        if self.defaults.clear_cache_after_generation {
            self.pipeline.clear_cache();
        }
        self.log_memory();
        let duration_seconds = permit.elapsed().as_secs_f64();
        drop(permit);

        match outcome {
            Ok(images) => {
                info!(%mode, images = images.len(), "Generated in {duration_seconds:.2}s");
                Ok(GenerationResult {
                    images,
                    duration_seconds,
                })
            }
            Err(e) => {
                error!(%mode, "generation failed: {e}");
                Err(e)
            }
        }
    }
}

fn preview(prompt: &str) -> String {
    const MAX_CHARS: usize = 50;
    if prompt.chars().count() <= MAX_CHARS {
        prompt.to_string()
    } else {
        let mut short: String = prompt.chars().take(MAX_CHARS).collect();
        short.push_str("...");
        short
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{GenerationParams, LoadedPipelines};
    use anyhow::bail;
    use image::{DynamicImage, Luma, Rgb};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    /// Returns solid images sized from the params, records what it saw.
    #[derive(Default)]
    struct FakePipeline {
        calls: AtomicUsize,
        cache_clears: AtomicUsize,
        fail_with: Option<&'static str>,
        seen: parking_lot::Mutex<Vec<GenerationParams>>,
    }

    impl FakePipeline {
        fn failing(message: &'static str) -> Self {
            Self {
                fail_with: Some(message),
                ..Default::default()
            }
        }

        fn images(&self, params: &GenerationParams) -> anyhow::Result<Vec<DynamicImage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().push(params.clone());
            if let Some(message) = self.fail_with {
                bail!("{message}");
            }
            let img = RgbImage::from_pixel(params.width as u32, params.height as u32, Rgb([9, 8, 7]));
            Ok(vec![DynamicImage::ImageRgb8(img); params.batch_size])
        }
    }

    impl Pipeline for FakePipeline {
        fn text_to_image(&self, params: &GenerationParams) -> anyhow::Result<Vec<DynamicImage>> {
            self.images(params)
        }

        fn image_to_image(
            &self,
            params: &GenerationParams,
            _image: &RgbImage,
        ) -> anyhow::Result<Vec<DynamicImage>> {
            self.images(params)
        }

        fn inpaint(
            &self,
            params: &GenerationParams,
            _image: &RgbImage,
            mask: &GrayImage,
        ) -> anyhow::Result<Vec<DynamicImage>> {
            assert_eq!(mask.get_pixel(0, 0), &Luma([255]));
            self.images(params)
        }

        fn device(&self) -> String {
            "cpu".to_string()
        }

        fn loaded(&self) -> LoadedPipelines {
            LoadedPipelines {
                txt2img: true,
                img2img: true,
                inpaint: true,
            }
        }

        fn clear_cache(&self) {
            self.cache_clears.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Blocks inside the pipeline until told to continue.
    struct BlockingPipeline {
        entered: parking_lot::Mutex<mpsc::SyncSender<()>>,
        proceed: parking_lot::Mutex<mpsc::Receiver<()>>,
        calls: AtomicUsize,
    }

    impl Pipeline for BlockingPipeline {
        fn text_to_image(&self, _params: &GenerationParams) -> anyhow::Result<Vec<DynamicImage>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.lock().send(())?;
            self.proceed.lock().recv()?;
            Ok(vec![DynamicImage::ImageRgb8(RgbImage::new(8, 8))])
        }

        fn image_to_image(
            &self,
            params: &GenerationParams,
            _image: &RgbImage,
        ) -> anyhow::Result<Vec<DynamicImage>> {
            self.text_to_image(params)
        }

        fn inpaint(
            &self,
            params: &GenerationParams,
            _image: &RgbImage,
            _mask: &GrayImage,
        ) -> anyhow::Result<Vec<DynamicImage>> {
            self.text_to_image(params)
        }

        fn device(&self) -> String {
            "cpu".to_string()
        }

        fn loaded(&self) -> LoadedPipelines {
            LoadedPipelines::default()
        }
    }

    fn png_uri(img: DynamicImage) -> String {
        codec::encode_data_uri(&img).unwrap()
    }

    fn generator(pipeline: Arc<dyn Pipeline>) -> Generator {
        Generator::new(pipeline, GenerationDefaults::default())
    }

    #[test]
    fn text_to_image_with_defaults() {
        let pipeline = Arc::new(FakePipeline::default());
        let generator = generator(pipeline.clone());

        let result = generator.text_to_image(&GenerationRequest::new("a cat")).unwrap();
        assert_eq!(result.images.len(), 1);
        assert!(result.images[0].starts_with(codec::DATA_URI_PREFIX));
        assert!(result.duration_seconds >= 0.0);
        assert!(!generator.gate().is_busy());
        assert_eq!(pipeline.cache_clears.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn batch_is_clamped_before_the_pipeline() {
        let pipeline = Arc::new(FakePipeline::default());
        let generator = generator(pipeline.clone());
        let request = GenerationRequest {
            batch_size: Some(10),
            width: Some(100),
            ..GenerationRequest::new("a cat")
        };

        let result = generator.text_to_image(&request).unwrap();
        assert_eq!(result.images.len(), 4);
        let seen = pipeline.seen.lock();
        assert_eq!(seen[0].width, 96);
    }

    #[test]
    fn missing_prompt_never_touches_the_gate() {
        let pipeline = Arc::new(FakePipeline::default());
        let generator = generator(pipeline.clone());
        let image = png_uri(DynamicImage::ImageRgb8(RgbImage::new(8, 8)));

        let requests = [
            (GenerationMode::TextToImage, GenerationRequest::new("")),
            (
                GenerationMode::ImageToImage,
                GenerationRequest {
                    image: Some(image.clone()),
                    ..GenerationRequest::new("")
                },
            ),
            (
                GenerationMode::Inpaint,
                GenerationRequest {
                    image: Some(image.clone()),
                    mask: Some(image.clone()),
                    ..GenerationRequest::new("")
                },
            ),
        ];

        // Hold the gate so any admission attempt would show up as Busy instead.
        let _permit = generator.gate().try_acquire("holder").unwrap();
        for (mode, request) in requests {
            let err = generator.generate(mode, &request).unwrap_err();
            assert!(matches!(err, GenerationError::Validation(_)), "{mode}: {err:?}");
        }
        assert_eq!(generator.gate().snapshot().current_prompt, "holder");
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn conditioning_images_are_required() {
        let generator = generator(Arc::new(FakePipeline::default()));
        let image = png_uri(DynamicImage::ImageRgb8(RgbImage::new(8, 8)));

        let err = generator
            .image_to_image(&GenerationRequest::new("a cat"))
            .unwrap_err();
        assert_eq!(err, GenerationError::Validation("Prompt and image are required".into()));

        let err = generator
            .inpaint(&GenerationRequest {
                image: Some(image),
                ..GenerationRequest::new("a cat")
            })
            .unwrap_err();
        assert_eq!(
            err,
            GenerationError::Validation("Prompt, image, and mask are required".into())
        );
        assert!(!generator.gate().is_busy());
    }

    #[test]
    fn image_to_image_uses_source_size_by_default() {
        let pipeline = Arc::new(FakePipeline::default());
        let generator = generator(pipeline.clone());
        let request = GenerationRequest {
            image: Some(png_uri(DynamicImage::ImageRgb8(RgbImage::new(300, 200)))),
            ..GenerationRequest::new("a cat")
        };

        generator.image_to_image(&request).unwrap();
        let seen = pipeline.seen.lock();
        assert_eq!((seen[0].width, seen[0].height), (296, 200));
    }

    #[test]
    fn inpaint_passes_a_single_channel_mask() {
        let pipeline = Arc::new(FakePipeline::default());
        let generator = generator(pipeline.clone());
        let mask = GrayImage::from_pixel(16, 16, Luma([255]));
        let request = GenerationRequest {
            image: Some(png_uri(DynamicImage::ImageRgb8(RgbImage::new(16, 16)))),
            mask: Some(png_uri(DynamicImage::ImageLuma8(mask))),
            ..GenerationRequest::new("a cat")
        };

        let result = generator.inpaint(&request).unwrap();
        assert_eq!(result.images.len(), 1);
    }

    #[test]
    fn malformed_image_is_a_decode_error() {
        let pipeline = Arc::new(FakePipeline::default());
        let generator = generator(pipeline.clone());
        let request = GenerationRequest {
            image: Some("data:image/png;base64,!!!".to_string()),
            ..GenerationRequest::new("a cat")
        };

        let err = generator.image_to_image(&request).unwrap_err();
        assert!(matches!(err, GenerationError::Decode(_)));
        assert!(!generator.gate().is_busy());
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn pipeline_failure_releases_the_gate() {
        let pipeline = Arc::new(FakePipeline::failing("CUDA out of memory"));
        let generator = generator(pipeline.clone());

        let err = generator.text_to_image(&GenerationRequest::new("a cat")).unwrap_err();
        assert_eq!(err, GenerationError::Pipeline("CUDA out of memory".into()));
        assert!(!generator.gate().is_busy());
        assert_eq!(pipeline.cache_clears.load(Ordering::SeqCst), 1);

        // The slot is usable again.
        let err = generator.text_to_image(&GenerationRequest::new("again")).unwrap_err();
        assert!(matches!(err, GenerationError::Pipeline(_)));
    }

    /// Counts queries and reports a fixed reading.
    #[derive(Default)]
    struct CountingTelemetry {
        queries: AtomicUsize,
    }

    impl GpuTelemetry for CountingTelemetry {
        fn query(&self) -> Option<crate::GpuMemory> {
            self.queries.fetch_add(1, Ordering::SeqCst);
            Some(crate::GpuMemory {
                name: "test".to_string(),
                allocated_gb: 1.0,
                free_gb: 3.0,
                total_gb: 4.0,
            })
        }
    }

    #[test]
    fn memory_is_logged_around_each_generation() {
        let telemetry = Arc::new(CountingTelemetry::default());
        let generator =
            generator(Arc::new(FakePipeline::default())).with_telemetry(telemetry.clone());

        generator.text_to_image(&GenerationRequest::new("")).unwrap_err();
        assert_eq!(telemetry.queries.load(Ordering::SeqCst), 0);

        generator.text_to_image(&GenerationRequest::new("a cat")).unwrap();
        assert_eq!(telemetry.queries.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn cache_clearing_can_be_disabled() {
        let pipeline = Arc::new(FakePipeline::default());
        let defaults = GenerationDefaults {
            clear_cache_after_generation: false,
            ..Default::default()
        };
        let generator = Generator::new(pipeline.clone(), defaults);
        generator.text_to_image(&GenerationRequest::new("a cat")).unwrap();
        assert_eq!(pipeline.cache_clears.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn concurrent_request_is_rejected_not_queued() {
        let (entered_tx, entered_rx) = mpsc::sync_channel(1);
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let pipeline = Arc::new(BlockingPipeline {
            entered: parking_lot::Mutex::new(entered_tx),
            proceed: parking_lot::Mutex::new(proceed_rx),
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(generator(pipeline.clone()));

        let first = {
            let generator = Arc::clone(&generator);
            thread::spawn(move || generator.text_to_image(&GenerationRequest::new("first")))
        };
        entered_rx.recv().unwrap();

        let snapshot = generator.gate().snapshot();
        assert!(snapshot.is_generating);
        assert_eq!(snapshot.current_prompt, "first");

        let err = generator
            .text_to_image(&GenerationRequest::new("second"))
            .unwrap_err();
        assert_eq!(err, GenerationError::Busy);
        assert_eq!(pipeline.calls.load(Ordering::SeqCst), 1);

        proceed_tx.send(()).unwrap();
        assert!(first.join().unwrap().is_ok());
        assert!(!generator.gate().is_busy());
    }

    #[test]
    fn interrupt_frees_the_slot_without_waiting() {
        let (entered_tx, entered_rx) = mpsc::sync_channel(2);
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let pipeline = Arc::new(BlockingPipeline {
            entered: parking_lot::Mutex::new(entered_tx),
            proceed: parking_lot::Mutex::new(proceed_rx),
            calls: AtomicUsize::new(0),
        });
        let generator = Arc::new(generator(pipeline.clone()));

        let first = {
            let generator = Arc::clone(&generator);
            thread::spawn(move || generator.text_to_image(&GenerationRequest::new("first")))
        };
        entered_rx.recv().unwrap();

        generator.interrupt();
        assert!(!generator.gate().is_busy());

        // A new admission survives the interrupted call finishing afterwards.
        let permit = generator.gate().try_acquire("second").unwrap();
        proceed_tx.send(()).unwrap();
        assert!(first.join().unwrap().is_ok());
        assert!(permit.is_current());
        assert_eq!(generator.gate().snapshot().current_prompt, "second");
    }

    #[test]
    fn long_prompts_are_shortened_for_logs() {
        assert_eq!(preview("short"), "short");
        let long = "é".repeat(60);
        assert_eq!(preview(&long).chars().count(), 53);
    }
}
