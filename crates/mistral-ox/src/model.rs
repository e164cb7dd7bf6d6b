use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Well-known model identifiers. Requests take plain strings, so fine-tuned
/// or newly released models can be used without a variant here.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    EnumIter,
    Display,
    IntoStaticStr,
)]
#[serde(into = "String", try_from = "String")]
pub enum Model {
    // Chat
    #[strum(to_string = "mistral-large-latest")]
    MistralLargeLatest,
    #[strum(to_string = "mistral-medium-latest")]
    MistralMediumLatest,
    #[strum(to_string = "mistral-small-latest")]
    MistralSmallLatest,
    #[strum(to_string = "ministral-8b-latest")]
    Ministral8bLatest,
    #[strum(to_string = "ministral-3b-latest")]
    Ministral3bLatest,
    #[strum(to_string = "open-mistral-nemo")]
    OpenMistralNemo,
    #[strum(to_string = "magistral-medium-latest")]
    MagistralMediumLatest,
    #[strum(to_string = "magistral-small-latest")]
    MagistralSmallLatest,
    #[strum(to_string = "pixtral-large-latest")]
    PixtralLargeLatest,

    // Code
    #[strum(to_string = "codestral-latest")]
    CodestralLatest,
    #[strum(to_string = "devstral-small-latest")]
    DevstralSmallLatest,

    // Embeddings
    #[strum(to_string = "mistral-embed")]
    MistralEmbed,
    #[strum(to_string = "codestral-embed")]
    CodestralEmbed,

    // Document understanding
    #[strum(to_string = "mistral-ocr-latest")]
    MistralOcrLatest,

    // Safety and classification
    #[strum(to_string = "mistral-moderation-latest")]
    MistralModerationLatest,
}

impl Model {
    /// Models served by `v1/embeddings`.
    pub fn is_embedding(self) -> bool {
        matches!(self, Self::MistralEmbed | Self::CodestralEmbed)
    }
}

impl From<Model> for String {
    fn from(model: Model) -> Self {
        model.to_string()
    }
}

impl TryFrom<String> for Model {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
