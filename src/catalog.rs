//! Static model catalog: free-tier Gemini models, their quota limits,
//! capability sets, and routing priority orders.
//!
//! Capabilities are an intrinsic model property. A credential can lose
//! *access* to a model at runtime, but the catalog itself never changes.

// ─────────────────────────────────────────────────────────────────────────────
// Model identifiers (free tier only)
// ─────────────────────────────────────────────────────────────────────────────

pub const GEMINI_25_PRO: &str = "gemini-2.5-pro";
pub const GEMINI_3_FLASH: &str = "gemini-3-flash-preview";
pub const GEMINI_25_FLASH: &str = "gemini-2.5-flash";
pub const GEMINI_25_FLASH_LITE: &str = "gemini-2.5-flash-lite";
pub const GEMINI_25_FLASH_IMAGE: &str = "gemini-2.5-flash-image";
pub const GEMINI_EMBEDDING: &str = "gemini-embedding-001";

/// Text model priority, smartest first. The router walks this list
/// top-to-bottom when falling back.
pub static TEXT_PRIORITY: &[&str] = &[
    GEMINI_25_PRO,
    GEMINI_3_FLASH,
    GEMINI_25_FLASH,
    GEMINI_25_FLASH_LITE,
];

/// Image generation model priority.
pub static IMAGE_PRIORITY: &[&str] = &[GEMINI_25_FLASH_IMAGE];

/// The single embedding model.
pub const EMBEDDING_MODEL: &str = GEMINI_EMBEDDING;

// ─────────────────────────────────────────────────────────────────────────────
// Capabilities
// ─────────────────────────────────────────────────────────────────────────────

/// A feature a model may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Capability {
    Text,
    Thinking,
    FunctionCalling,
    SearchGrounding,
    CodeExecution,
    UrlContext,
    StructuredOutput,
    MultimodalInput,
    ImageGeneration,
    Embedding,
}

impl Capability {
    const fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// A set of capabilities as a bitset. Subset tests are single integer ops,
/// which keeps router candidate filtering allocation-free.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    pub const fn of(caps: &[Capability]) -> Self {
        let mut bits = 0u16;
        let mut i = 0;
        while i < caps.len() {
            bits |= caps[i].bit();
            i += 1;
        }
        CapabilitySet(bits)
    }

    pub fn insert(&mut self, cap: Capability) {
        self.0 |= cap.bit();
    }

    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub const fn is_subset_of(self, other: CapabilitySet) -> bool {
        self.0 & other.0 == self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Capability set shared by the full-featured text models.
const TEXT_CAPS: CapabilitySet = CapabilitySet::of(&[
    Capability::Text,
    Capability::Thinking,
    Capability::FunctionCalling,
    Capability::SearchGrounding,
    Capability::CodeExecution,
    Capability::UrlContext,
    Capability::StructuredOutput,
    Capability::MultimodalInput,
]);

// ─────────────────────────────────────────────────────────────────────────────
// Catalog
// ─────────────────────────────────────────────────────────────────────────────

/// Which priority list a model belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelClass {
    Text,
    Image,
    Embedding,
}

/// One catalog entry. Limits are the published free-tier quotas, which
/// reset at midnight in the quota provider's calendar zone.
#[derive(Debug, Clone, Copy)]
pub struct ModelSpec {
    pub id: &'static str,
    pub short_name: &'static str,
    pub rpm: u32,
    pub rpd: u32,
    pub tpm: u64,
    pub caps: CapabilitySet,
    pub class: ModelClass,
}

pub static CATALOG: &[ModelSpec] = &[
    ModelSpec {
        id: GEMINI_25_PRO,
        short_name: "2.5-pro",
        rpm: 5,
        rpd: 100,
        tpm: 250_000,
        caps: TEXT_CAPS,
        class: ModelClass::Text,
    },
    ModelSpec {
        id: GEMINI_3_FLASH,
        short_name: "3-flash",
        rpm: 5,
        rpd: 50,
        tpm: 250_000,
        caps: TEXT_CAPS,
        class: ModelClass::Text,
    },
    ModelSpec {
        id: GEMINI_25_FLASH,
        short_name: "2.5-flash",
        rpm: 15,
        rpd: 1_500,
        tpm: 1_000_000,
        caps: TEXT_CAPS,
        class: ModelClass::Text,
    },
    ModelSpec {
        id: GEMINI_25_FLASH_LITE,
        short_name: "2.5-flash-lite",
        rpm: 15,
        rpd: 1_000,
        tpm: 250_000,
        caps: TEXT_CAPS,
        class: ModelClass::Text,
    },
    ModelSpec {
        id: GEMINI_25_FLASH_IMAGE,
        short_name: "2.5-flash-img",
        rpm: 10,
        rpd: 25,
        tpm: 250_000,
        caps: CapabilitySet::of(&[Capability::Text, Capability::ImageGeneration]),
        class: ModelClass::Image,
    },
    ModelSpec {
        id: GEMINI_EMBEDDING,
        short_name: "embedding",
        rpm: 15,
        rpd: 1_500,
        tpm: 1_000_000,
        caps: CapabilitySet::of(&[Capability::Embedding]),
        class: ModelClass::Embedding,
    },
];

/// Look up a catalog entry by model id.
pub fn model(id: &str) -> Option<&'static ModelSpec> {
    CATALOG.iter().find(|m| m.id == id)
}

/// All catalog model ids, in declaration order.
pub fn all_model_ids() -> impl Iterator<Item = &'static str> {
    CATALOG.iter().map(|m| m.id)
}

/// Map OpenAI model names used by IDEs to the closest catalog model.
/// Unknown names pass through unchanged (they may already be catalog ids).
pub fn resolve_alias(name: &str) -> &str {
    match name {
        "gpt-4" | "gpt-4-turbo" => GEMINI_25_PRO,
        "gpt-4o" => GEMINI_25_FLASH,
        "gpt-4o-mini" | "gpt-3.5-turbo" => GEMINI_25_FLASH_LITE,
        "dall-e-3" | "dall-e-2" => GEMINI_25_FLASH_IMAGE,
        "text-embedding-ada-002" | "text-embedding-3-small" | "text-embedding-3-large" => {
            GEMINI_EMBEDDING
        }
        other => other,
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Token estimation
// ─────────────────────────────────────────────────────────────────────────────

const CHARS_PER_TOKEN: f64 = 4.0;
const ESTIMATION_BUFFER: f64 = 1.2;

/// Conservative token count from text length. Used for TPM pre-checks
/// before the upstream reports real usage.
pub fn estimate_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    ((text.len() as f64 / CHARS_PER_TOKEN) * ESTIMATION_BUFFER) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_subset() {
        let required = CapabilitySet::of(&[Capability::FunctionCalling, Capability::Text]);
        assert!(required.is_subset_of(TEXT_CAPS));

        let image = CapabilitySet::of(&[Capability::ImageGeneration]);
        assert!(!image.is_subset_of(TEXT_CAPS));
        assert!(image.is_subset_of(model(GEMINI_25_FLASH_IMAGE).unwrap().caps));
    }

    #[test]
    fn empty_set_is_subset_of_everything() {
        assert!(CapabilitySet::EMPTY.is_subset_of(TEXT_CAPS));
        assert!(CapabilitySet::EMPTY.is_subset_of(CapabilitySet::EMPTY));
    }

    #[test]
    fn catalog_lookup() {
        assert_eq!(model(GEMINI_25_FLASH).unwrap().rpm, 15);
        assert_eq!(model(GEMINI_25_FLASH).unwrap().rpd, 1_500);
        assert!(model("gemini-9-ultra").is_none());
    }

    #[test]
    fn alias_resolution() {
        assert_eq!(resolve_alias("gpt-4o"), GEMINI_25_FLASH);
        assert_eq!(resolve_alias("text-embedding-3-small"), GEMINI_EMBEDDING);
        // Catalog ids and unknown names pass through.
        assert_eq!(resolve_alias(GEMINI_25_PRO), GEMINI_25_PRO);
        assert_eq!(resolve_alias("my-custom-model"), "my-custom-model");
    }

    #[test]
    fn token_estimation() {
        assert_eq!(estimate_tokens(""), 0);
        // 400 chars / 4 chars-per-token * 1.2 buffer = 120
        assert_eq!(estimate_tokens(&"x".repeat(400)), 120);
    }
}
