//! Service pricing catalog.
//!
//! Every billable generation is identified by a service code such as
//! `music_generate_v5` or `video_gen4_10s`. The catalog maps each code to
//! its unit cost and to the provider, model and operation that fulfil it.
//!
//! Operations that finish inside a single request (image generation, chat,
//! stem separation, design tools) have no provider job to track. They are
//! priced separately as [`OperationPrice`] entries and charged with a plain
//! conditional deduction.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::LedgerError;

/// External generation provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Music generation (kie.ai Suno API).
    Suno,
    /// Video generation (Runway).
    Runway,
}

impl ProviderKind {
    /// Stable storage and routing name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Suno => "suno",
            Self::Runway => "runway",
        }
    }

    /// Parse the storage name.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "suno" => Some(Self::Suno),
            "runway" => Some(Self::Runway),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The provider operation a service code maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    /// Generate a new track.
    MusicGenerate,
    /// Extend an existing track.
    MusicExtend,
    /// Animate a still image.
    ImageToVideo,
    /// Restyle an existing clip.
    VideoToVideo,
}

/// One entry of the pricing catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Service code used by callers (`music_generate_v5`).
    pub code: String,

    /// Human-readable name.
    pub name: String,

    /// Operation performed.
    pub service_type: ServiceType,

    /// Provider that fulfils the request.
    pub provider: ProviderKind,

    /// Provider model identifier (`V5`, `gen4_turbo`, ...).
    pub model: String,

    /// Clip duration in seconds, for video services.
    pub duration_secs: Option<u32>,

    /// Units charged per request.
    pub cost: i64,
}

impl ServiceSpec {
    /// Build a catalog entry.
    #[must_use]
    pub fn new(
        code: impl Into<String>,
        name: impl Into<String>,
        service_type: ServiceType,
        provider: ProviderKind,
        model: impl Into<String>,
        cost: i64,
    ) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            service_type,
            provider,
            model: model.into(),
            duration_secs: None,
            cost,
        }
    }

    /// Set the clip duration.
    #[must_use]
    pub fn with_duration(mut self, secs: u32) -> Self {
        self.duration_secs = Some(secs);
        self
    }

    /// Whether this service is free and skips the ledger.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.cost == 0
    }
}

/// Product area of a synchronously charged operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationCategory {
    /// Audio processing around generated tracks.
    Music,
    /// Still image generation.
    Image,
    /// Video processing that completes in-request.
    Video,
    /// Chat completions.
    Chat,
    /// Real-time audio sessions.
    LiveAudio,
    /// Design studio tools.
    DesignStudio,
}

/// Price of an operation charged in one step, without a tracked job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPrice {
    /// Operation code (`image_standard`).
    pub code: String,
    /// Human-readable name.
    pub name: String,
    /// Product area.
    pub category: OperationCategory,
    /// Units charged per call. Zero means free.
    pub cost: i64,
}

impl OperationPrice {
    /// Whether the operation is free and skips the ledger.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.cost == 0
    }
}

/// Cost of every music operation.
pub const MUSIC_UNIT_COST: i64 = 6;

/// Lookup table from service code to [`ServiceSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PricingCatalog {
    services: BTreeMap<String, ServiceSpec>,
    operations: BTreeMap<String, OperationPrice>,
}

impl PricingCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            services: BTreeMap::new(),
            operations: BTreeMap::new(),
        }
    }

    /// Add or replace an entry.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` for a negative cost.
    pub fn insert(&mut self, spec: ServiceSpec) -> Result<(), LedgerError> {
        if spec.cost < 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "service {} has negative cost {}",
                spec.code, spec.cost
            )));
        }
        self.services.insert(spec.code.clone(), spec);
        Ok(())
    }

    /// Builder form of [`insert`](Self::insert). Negative costs are clamped
    /// to zero.
    #[must_use]
    pub fn with_service(mut self, mut spec: ServiceSpec) -> Self {
        spec.cost = spec.cost.max(0);
        self.services.insert(spec.code.clone(), spec);
        self
    }

    /// Look up a service code.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::UnknownService` if the code is not priced.
    pub fn resolve(&self, code: &str) -> Result<&ServiceSpec, LedgerError> {
        self.services
            .get(code)
            .ok_or_else(|| LedgerError::UnknownService(code.to_string()))
    }

    /// Add or replace a synchronous operation. Negative costs are clamped
    /// to zero.
    #[must_use]
    pub fn with_operation(mut self, mut price: OperationPrice) -> Self {
        price.cost = price.cost.max(0);
        self.operations.insert(price.code.clone(), price);
        self
    }

    /// Look up a synchronous operation code.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::UnknownService` if the code is not priced.
    pub fn operation(&self, code: &str) -> Result<&OperationPrice, LedgerError> {
        self.operations
            .get(code)
            .ok_or_else(|| LedgerError::UnknownService(code.to_string()))
    }

    /// Synchronous operations ordered by code.
    pub fn operations(&self) -> impl Iterator<Item = &OperationPrice> {
        self.operations.values()
    }

    /// Unit cost of any priced code, job service or synchronous operation.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::UnknownService` if the code is not priced.
    pub fn cost_of(&self, code: &str) -> Result<i64, LedgerError> {
        if let Some(price) = self.operations.get(code) {
            return Ok(price.cost);
        }
        self.resolve(code).map(|spec| spec.cost)
    }

    /// All entries ordered by code.
    pub fn iter(&self) -> impl Iterator<Item = &ServiceSpec> {
        self.services.values()
    }

    /// Number of priced services.
    #[must_use]
    pub fn len(&self) -> usize {
        self.services.len()
    }

    /// Whether the catalog is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Operations charged in a single step.
const SYNCHRONOUS_OPERATIONS: &[(&str, &str, OperationCategory, i64)] = {
    use OperationCategory::{Chat, DesignStudio, Image, LiveAudio, Music, Video};
    &[
        ("music_add_instrumental", "Add instrumental", Music, 6),
        ("music_add_vocals", "Add vocals", Music, 6),
        ("music_cover", "Cover track", Music, 6),
        ("music_separate_vocals", "Separate vocals (2-stem)", Music, 5),
        ("music_split_stem_full", "Full stem split (12-stem)", Music, 50),
        ("music_convert_wav", "Convert to WAV", Music, 1),
        ("music_generate_midi", "Generate MIDI", Music, 1),
        ("image_fast", "Imagen 4 Fast", Image, 15),
        ("image_standard", "Imagen 4 Standard", Image, 25),
        ("image_ultra", "Imagen 4 Ultra", Image, 35),
        ("image_3", "Imagen 3", Image, 10),
        ("image_gemini", "Gemini image", Image, 4),
        ("act_two", "Character animation", Video, 35),
        ("video_upscale_5s", "Video upscale 5s", Video, 10),
        ("video_upscale_10s", "Video upscale 10s", Video, 20),
        ("chat_basic", "Basic chat", Chat, 0),
        ("chat_advanced", "Advanced chat", Chat, 1),
        ("live_audio_1min", "Live audio 1 min", LiveAudio, 3),
        ("live_audio_5min", "Live audio 5 min", LiveAudio, 13),
        ("design_generate_image", "Design: image", DesignStudio, 4),
        ("design_generate_logo", "Design: logo", DesignStudio, 6),
        ("design_generate_icon", "Design: icon", DesignStudio, 4),
        ("design_generate_pattern", "Design: pattern", DesignStudio, 4),
        ("design_generate_svg", "Design: SVG", DesignStudio, 6),
        ("design_edit_image", "Design: edit image", DesignStudio, 5),
        ("design_remove_background", "Design: remove background", DesignStudio, 5),
        ("design_upscale_image", "Design: upscale", DesignStudio, 6),
        ("design_generate_variations", "Design: 3 variations", DesignStudio, 8),
        ("design_analyze_image", "Design: analyze image", DesignStudio, 2),
        ("design_extract_colors", "Design: color palette", DesignStudio, 2),
        ("design_trends", "Design: trends", DesignStudio, 3),
        ("design_assistant", "Design: assistant", DesignStudio, 1),
        ("design_export_png", "Design: export PNG", DesignStudio, 0),
        ("design_export_svg", "Design: export SVG", DesignStudio, 0),
    ]
};

impl Default for PricingCatalog {
    fn default() -> Self {
        use ProviderKind::{Runway, Suno};
        use ServiceType::{ImageToVideo, MusicExtend, MusicGenerate, VideoToVideo};

        let music = [
            ("music_generate_v3_5", "Suno V3.5", "V3_5"),
            ("music_generate_v4", "Suno V4", "V4"),
            ("music_generate_v4_5", "Suno V4.5", "V4_5"),
            ("music_generate_v4_5plus", "Suno V4.5+", "V4_5PLUS"),
            ("music_generate_v5", "Suno V5", "V5"),
        ];
        let video = [
            ("video_gen4_5s", "Gen-4 Turbo 5s", ImageToVideo, "gen4_turbo", 5, 20),
            ("video_gen4_10s", "Gen-4 Turbo 10s", ImageToVideo, "gen4_turbo", 10, 40),
            ("video_gen4_aleph_5s", "Gen-4 Aleph 5s", VideoToVideo, "gen4_aleph", 5, 60),
            ("video_to_video", "Video to video", VideoToVideo, "gen4_aleph", 5, 50),
            ("image_to_video_5s", "Image to video 5s", ImageToVideo, "gen4_turbo", 5, 18),
            ("image_to_video_10s", "Image to video 10s", ImageToVideo, "gen4_turbo", 10, 35),
            ("gen3_alpha_5s", "Gen-3 Alpha 5s", ImageToVideo, "gen3a_turbo", 5, 18),
            ("gen3_alpha_10s", "Gen-3 Alpha 10s", ImageToVideo, "gen3a_turbo", 10, 35),
        ];

        let mut catalog = Self::empty();
        for (code, name, model) in music {
            catalog = catalog.with_service(ServiceSpec::new(
                code,
                name,
                MusicGenerate,
                Suno,
                model,
                MUSIC_UNIT_COST,
            ));
        }
        catalog = catalog.with_service(ServiceSpec::new(
            "music_extend",
            "Extend track",
            MusicExtend,
            Suno,
            "V5",
            MUSIC_UNIT_COST,
        ));
        for (code, name, service_type, model, secs, cost) in video {
            catalog = catalog.with_service(
                ServiceSpec::new(code, name, service_type, Runway, model, cost)
                    .with_duration(secs),
            );
        }
        for (code, name, category, cost) in SYNCHRONOUS_OPERATIONS {
            catalog = catalog.with_operation(OperationPrice {
                code: (*code).to_string(),
                name: (*name).to_string(),
                category: *category,
                cost: *cost,
            });
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_catalog_costs() {
        let catalog = PricingCatalog::default();
        assert_eq!(catalog.resolve("music_generate_v5").unwrap().cost, 6);
        assert_eq!(catalog.resolve("music_extend").unwrap().cost, 6);
        assert_eq!(catalog.resolve("video_gen4_5s").unwrap().cost, 20);
        assert_eq!(catalog.resolve("video_gen4_10s").unwrap().cost, 40);
        assert_eq!(catalog.resolve("video_gen4_aleph_5s").unwrap().cost, 60);
        assert_eq!(catalog.resolve("image_to_video_10s").unwrap().cost, 35);
        assert_eq!(catalog.resolve("gen3_alpha_5s").unwrap().cost, 18);
    }

    #[test]
    fn video_entries_carry_duration_and_provider() {
        let catalog = PricingCatalog::default();
        let spec = catalog.resolve("video_gen4_10s").unwrap();
        assert_eq!(spec.provider, ProviderKind::Runway);
        assert_eq!(spec.duration_secs, Some(10));
        assert_eq!(spec.model, "gen4_turbo");

        let music = catalog.resolve("music_generate_v4_5").unwrap();
        assert_eq!(music.provider, ProviderKind::Suno);
        assert_eq!(music.duration_secs, None);
    }

    #[test]
    fn unknown_code_rejected() {
        let catalog = PricingCatalog::default();
        assert_eq!(
            catalog.resolve("midjourney_v6"),
            Err(LedgerError::UnknownService("midjourney_v6".to_string()))
        );
    }

    #[test]
    fn synchronous_operations_are_priced() {
        let catalog = PricingCatalog::default();
        let ultra = catalog.operation("image_ultra").unwrap();
        assert_eq!(ultra.cost, 35);
        assert_eq!(ultra.category, OperationCategory::Image);
        assert_eq!(catalog.operation("music_split_stem_full").unwrap().cost, 50);
        assert_eq!(catalog.operation("live_audio_5min").unwrap().cost, 13);
        assert!(catalog.operation("chat_basic").unwrap().is_free());
        assert!(catalog.operation("music_generate_v5").is_err());
    }

    #[test]
    fn cost_of_covers_both_tables() {
        let catalog = PricingCatalog::default();
        assert_eq!(catalog.cost_of("image_gemini"), Ok(4));
        assert_eq!(catalog.cost_of("music_generate_v5"), Ok(6));
        assert_eq!(catalog.cost_of("video_gen4_aleph_5s"), Ok(60));
        assert!(catalog.cost_of("nope").is_err());
    }

    #[test]
    fn insert_rejects_negative_cost() {
        let mut catalog = PricingCatalog::empty();
        let spec = ServiceSpec::new(
            "broken",
            "Broken",
            ServiceType::MusicGenerate,
            ProviderKind::Suno,
            "V5",
            -1,
        );
        assert!(catalog.insert(spec).is_err());
        assert!(catalog.is_empty());
    }

    #[test]
    fn provider_kind_names() {
        assert_eq!(ProviderKind::parse("suno"), Some(ProviderKind::Suno));
        assert_eq!(ProviderKind::Runway.to_string(), "runway");
        assert_eq!(ProviderKind::parse("openai"), None);
    }
}
