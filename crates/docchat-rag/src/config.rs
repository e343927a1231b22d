use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::types::ConversationStyle;

/// Upload ceiling in bytes.
pub const MAX_DOCUMENT_SIZE: u64 = 100_000_000;

/// Process-wide configuration. Built once at startup and shared as
/// `Arc<AppConfig>`; nothing else reads the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub temperatures: TemperatureScale,
    #[serde(default)]
    pub prompt: PromptConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub document_analysis: Option<DocumentAnalysisConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub max_document_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_document_size: MAX_DOCUMENT_SIZE,
        }
    }
}

/// Recursive splitter thresholds, counted in characters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1000,
            chunk_overlap: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: usize,
    /// Exchanges (user message plus answer) replayed as memory in simple mode.
    pub history_window: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 10,
            history_window: 10,
        }
    }
}

/// Sampling temperature per conversation style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemperatureScale {
    pub creative: f32,
    pub balanced: f32,
    pub precise: f32,
}

impl Default for TemperatureScale {
    fn default() -> Self {
        Self {
            creative: 1.0,
            balanced: 0.5,
            precise: 0.1,
        }
    }
}

impl TemperatureScale {
    pub fn for_style(&self, style: ConversationStyle) -> f32 {
        match style {
            ConversationStyle::Creative => self.creative,
            ConversationStyle::Balanced => self.balanced,
            ConversationStyle::Precise => self.precise,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    pub assistant_name: String,
    pub organization: String,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            assistant_name: "DocChat".to_string(),
            organization: "your organization".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LlmFlavor {
    /// Any endpoint speaking the OpenAI chat-completions protocol.
    OpenAi { base_url: String },
    /// Azure OpenAI; the deployment name is derived from the model id.
    AzureOpenAi { instance: String, api_version: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CombineStrategy {
    /// Extract relevant text per chunk, then answer over the extracts.
    #[default]
    MapReduce,
    /// Put every retrieved chunk into the answer prompt verbatim.
    Stuff,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub flavor: LlmFlavor,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    pub max_tokens: Option<usize>,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub combine_strategy: CombineStrategy,
    /// Concurrent map calls in the map-reduce chain.
    pub map_concurrency: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            flavor: LlmFlavor::OpenAi {
                base_url: "https://api.openai.com/v1".to_string(),
            },
            api_key: String::new(),
            max_tokens: None,
            request_timeout_secs: 300,
            combine_strategy: CombineStrategy::MapReduce,
            map_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    pub dimension: usize,
    /// OpenAI-compatible `/embeddings` base url. `None` selects the offline
    /// hashing embedder.
    pub base_url: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    pub model: String,
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            dimension: 1536,
            base_url: None,
            api_key: String::new(),
            model: "text-embedding-ada-002".to_string(),
            batch_size: 16,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentAnalysisConfig {
    pub endpoint: String,
    #[serde(default, skip_serializing)]
    pub api_key: String,
    pub api_version: String,
    pub model_id: String,
    pub poll_interval_ms: u64,
    pub max_polls: u32,
}

impl Default for DocumentAnalysisConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: String::new(),
            api_version: "2022-08-31".to_string(),
            model_id: "prebuilt-document".to_string(),
            poll_interval_ms: 1000,
            max_polls: 120,
        }
    }
}

impl AppConfig {
    /// Validate config values, returning errors for clearly broken configurations.
    pub fn validate(&self) -> Result<(), String> {
        if self.upload.max_document_size == 0 {
            return Err("upload.max_document_size must be > 0".into());
        }
        if self.chunking.chunk_size == 0 {
            return Err("chunking.chunk_size must be > 0".into());
        }
        if self.chunking.chunk_overlap >= self.chunking.chunk_size {
            return Err("chunking.chunk_overlap must be < chunk_size".into());
        }
        if self.retrieval.top_k == 0 {
            return Err("retrieval.top_k must be > 0".into());
        }
        let t = &self.temperatures;
        for value in [t.creative, t.balanced, t.precise] {
            if !(0.0..=2.0).contains(&value) {
                return Err("temperatures must be in [0.0, 2.0]".into());
            }
        }
        if !(t.creative > t.balanced && t.balanced > t.precise) {
            return Err("temperatures must decrease from creative to balanced to precise".into());
        }
        if self.llm.map_concurrency == 0 {
            return Err("llm.map_concurrency must be > 0".into());
        }
        if self.embedding.dimension == 0 {
            return Err("embedding.dimension must be > 0".into());
        }
        if self.embedding.batch_size == 0 {
            return Err("embedding.batch_size must be > 0".into());
        }
        if let Some(analysis) = &self.document_analysis {
            if analysis.endpoint.is_empty() {
                return Err("document_analysis.endpoint must not be empty".into());
            }
            if analysis.max_polls == 0 {
                return Err("document_analysis.max_polls must be > 0".into());
            }
        }
        Ok(())
    }

    /// Load config from a JSON file, falling back to defaults for missing fields.
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `DOCCHAT_*` environment overrides. Called once at process start.
    pub fn with_env_overrides(self) -> Result<Self, String> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        if let Some(dir) = lookup("DOCCHAT_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Some(instance) = lookup("DOCCHAT_AZURE_OPENAI_INSTANCE") {
            let api_version = lookup("DOCCHAT_AZURE_OPENAI_API_VERSION")
                .unwrap_or_else(|| "2023-05-15".to_string());
            self.llm.flavor = LlmFlavor::AzureOpenAi {
                instance,
                api_version,
            };
        } else if let Some(base_url) = lookup("DOCCHAT_OPENAI_BASE_URL") {
            self.llm.flavor = LlmFlavor::OpenAi { base_url };
        }
        if let Some(key) = lookup("DOCCHAT_OPENAI_API_KEY") {
            self.llm.api_key = key.clone();
            if self.embedding.api_key.is_empty() {
                self.embedding.api_key = key;
            }
        }

        if let Some(url) = lookup("DOCCHAT_EMBEDDING_BASE_URL") {
            self.embedding.base_url = Some(url);
        }
        if let Some(key) = lookup("DOCCHAT_EMBEDDING_API_KEY") {
            self.embedding.api_key = key;
        }
        if let Some(dim) = lookup("DOCCHAT_EMBEDDING_DIMENSION") {
            self.embedding.dimension = dim
                .parse()
                .map_err(|_| format!("DOCCHAT_EMBEDDING_DIMENSION is not a number: {}", dim))?;
        }

        if let Some(endpoint) = lookup("DOCCHAT_DOCUMENT_INTELLIGENCE_ENDPOINT") {
            let mut analysis = self.document_analysis.take().unwrap_or_default();
            analysis.endpoint = endpoint;
            if let Some(key) = lookup("DOCCHAT_DOCUMENT_INTELLIGENCE_KEY") {
                analysis.api_key = key;
            }
            self.document_analysis = Some(analysis);
        }

        self.validate()?;
        Ok(self)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("docchat-rag");

        Self {
            data_dir,
            upload: UploadConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            temperatures: TemperatureScale::default(),
            prompt: PromptConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            document_analysis: None,
        }
    }
}
