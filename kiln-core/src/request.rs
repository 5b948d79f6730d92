use serde::{Deserialize, Serialize};

use crate::{GenerationDefaults, MAX_TRAIN_TIMESTEPS};

/// A generation request as it arrives over the wire. Every numeric field is optional and
/// deliberately wide so that out-of-range values are clamped instead of rejected.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: String,
    pub steps: Option<i64>,
    pub cfg_scale: Option<f64>,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub seed: Option<i64>,
    pub batch_size: Option<i64>,
    pub strength: Option<f64>,
    /// Source image as a data URI or bare base64.
    pub image: Option<String>,
    /// Inpainting mask as a data URI or bare base64.
    pub mask: Option<String>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn has_prompt(&self) -> bool {
        !self.prompt.trim().is_empty()
    }

    /// The source image payload, if present and non-empty.
    pub fn source_image(&self) -> Option<&str> {
        self.image.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// The mask payload, if present and non-empty.
    pub fn mask_image(&self) -> Option<&str> {
        self.mask.as_deref().filter(|s| !s.trim().is_empty())
    }

    /// Fills in the output size from a conditioning image when the caller left it out.
    pub fn with_default_size(mut self, width: u32, height: u32) -> Self {
        self.width.get_or_insert(i64::from(width));
        self.height.get_or_insert(i64::from(height));
        self
    }

    pub fn normalize(&self, defaults: &GenerationDefaults) -> GenerationParams {
        let max_steps = defaults.max_steps.clamp(1, MAX_TRAIN_TIMESTEPS);
        let steps = self
            .steps
            .map_or(defaults.steps, |n| n.clamp(1, max_steps as i64) as usize)
            .clamp(1, max_steps);
        let cfg_scale = self
            .cfg_scale
            .filter(|v| v.is_finite())
            .unwrap_or(defaults.cfg_scale);
        let strength = self
            .strength
            .filter(|v| v.is_finite())
            .unwrap_or(defaults.strength)
            .clamp(0.0, 1.0);
        let max_batch = defaults.max_batch_size.max(1);
        let batch_size = self
            .batch_size
            .map_or(defaults.batch_size, |n| n.clamp(1, max_batch as i64) as usize)
            .clamp(1, max_batch);

        GenerationParams {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            steps,
            cfg_scale,
            width: round_dimension(self.width, defaults.width, defaults.max_dimension),
            height: round_dimension(self.height, defaults.height, defaults.max_dimension),
            seed: SeedMode::from_seed(self.seed.unwrap_or(defaults.seed)),
            batch_size,
            strength,
        }
    }
}

/// Rounds down to a multiple of 8 inside `[8, max]`.
fn round_dimension(value: Option<i64>, default: usize, max: usize) -> usize {
    let max = (max / 8).max(1) * 8;
    let value = value.unwrap_or(default as i64).clamp(8, max as i64) as usize;
    value / 8 * 8
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeedMode {
    Fixed(u64),
    Random,
}

impl SeedMode {
    pub fn from_seed(seed: i64) -> Self {
        if seed >= 0 {
            Self::Fixed(seed as u64)
        } else {
            Self::Random
        }
    }

    /// The concrete seed to sample with.
    pub fn resolve(&self) -> u64 {
        match self {
            Self::Fixed(seed) => *seed,
            Self::Random => rand::random(),
        }
    }
}

/// A request after defaults and limits have been applied.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub steps: usize,
    pub cfg_scale: f64,
    pub width: usize,
    pub height: usize,
    pub seed: SeedMode,
    pub batch_size: usize,
    pub strength: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() {
        let params = GenerationRequest::new("a cat").normalize(&GenerationDefaults::default());
        assert_eq!(params.steps, 20);
        assert_eq!(params.cfg_scale, 7.5);
        assert_eq!((params.width, params.height), (512, 512));
        assert_eq!(params.seed, SeedMode::Random);
        assert_eq!(params.batch_size, 1);
        assert_eq!(params.strength, 0.8);
    }

    #[test]
    fn dimensions_are_multiples_of_eight() {
        let defaults = GenerationDefaults::default();
        for value in [-100, 0, 1, 7, 8, 9, 513, 519, 777, 1023, 2047, 5000, i64::MAX] {
            let request = GenerationRequest {
                width: Some(value),
                height: Some(value),
                ..GenerationRequest::new("x")
            };
            let params = request.normalize(&defaults);
            assert_eq!(params.width % 8, 0, "width for {value}");
            assert_eq!(params.height % 8, 0, "height for {value}");
            assert!(params.width >= 8 && params.width <= defaults.max_dimension);
        }
    }

    #[test]
    fn dimensions_round_down() {
        let request = GenerationRequest {
            width: Some(519),
            height: Some(777),
            ..GenerationRequest::new("x")
        };
        let params = request.normalize(&GenerationDefaults::default());
        assert_eq!((params.width, params.height), (512, 776));
    }

    #[test]
    fn batch_size_is_clamped() {
        let defaults = GenerationDefaults::default();
        for (requested, expected) in [(-3, 1), (0, 1), (1, 1), (3, 3), (4, 4), (50, 4)] {
            let request = GenerationRequest {
                batch_size: Some(requested),
                ..GenerationRequest::new("x")
            };
            assert_eq!(request.normalize(&defaults).batch_size, expected);
        }
    }

    #[test]
    fn seed_sign_selects_mode() {
        assert_eq!(SeedMode::from_seed(42), SeedMode::Fixed(42));
        assert_eq!(SeedMode::from_seed(0), SeedMode::Fixed(0));
        assert_eq!(SeedMode::from_seed(-1), SeedMode::Random);
        assert_eq!(SeedMode::Fixed(7).resolve(), 7);
    }

    #[test]
    fn strength_and_steps_are_bounded() {
        let request = GenerationRequest {
            strength: Some(3.0),
            steps: Some(0),
            cfg_scale: Some(f64::NAN),
            ..GenerationRequest::new("x")
        };
        let params = request.normalize(&GenerationDefaults::default());
        assert_eq!(params.strength, 1.0);
        assert_eq!(params.steps, 1);
        assert_eq!(params.cfg_scale, 7.5);
    }

    #[test]
    fn steps_never_exceed_the_limit() {
        let defaults = GenerationDefaults::default();
        let cases = [(i64::MAX, 150), (100_000_000_000, 150), (150, 150), (42, 42)];
        for (requested, expected) in cases {
            let request = GenerationRequest {
                steps: Some(requested),
                ..GenerationRequest::new("x")
            };
            assert_eq!(request.normalize(&defaults).steps, expected);
        }

        // A configured limit above the trained schedule is capped too.
        let defaults = GenerationDefaults {
            max_steps: 50_000,
            ..GenerationDefaults::default()
        };
        let request = GenerationRequest {
            steps: Some(i64::MAX),
            ..GenerationRequest::new("x")
        };
        assert_eq!(request.normalize(&defaults).steps, MAX_TRAIN_TIMESTEPS);
    }

    #[test]
    fn empty_payloads_count_as_missing() {
        let request = GenerationRequest {
            image: Some("  ".to_string()),
            mask: Some(String::new()),
            ..GenerationRequest::new("   ")
        };
        assert!(!request.has_prompt());
        assert!(request.source_image().is_none());
        assert!(request.mask_image().is_none());
    }

    #[test]
    fn conditioning_size_only_fills_gaps() {
        let request = GenerationRequest {
            width: Some(256),
            ..GenerationRequest::new("x")
        }
        .with_default_size(640, 480);
        assert_eq!((request.width, request.height), (Some(256), Some(480)));
    }

    #[test]
    fn deserializes_wire_fields() {
        let request: GenerationRequest = serde_json::from_str(
            r#"{"prompt":"a cat","steps":30,"cfg_scale":5,"seed":12,"image":"abc"}"#,
        )
        .unwrap();
        assert_eq!(request.prompt, "a cat");
        assert_eq!(request.steps, Some(30));
        assert_eq!(request.cfg_scale, Some(5.0));
        assert_eq!(request.seed, Some(12));
        assert_eq!(request.source_image(), Some("abc"));
        assert!(request.negative_prompt.is_empty());
    }
}
