use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::{BackendMode, Config},
    generation::{GeminiGenerator, Generator, MockGenerator, MOCK_REPLY},
    memory::ConversationMemory,
    models::{SuggestionRequest, SuggestionResponse},
    normalizer::{fit_to_count, normalize},
};

const INSTRUCTIONS: &str = "You review translations between Japanese and Chinese. \
Compare the translated text with its source and point out up to five places where the \
meaning was rendered incorrectly, with a short comment on how to fix each one. \
Finish with an encouraging overall review. Reply in Chinese, as one JSON object of the form \
{\"指摘\": [{\"番号\": 1, \"箇所\": \"...\", \"コメント\": \"...\"}], \"全体講評\": \"...\"}. \
Follow the structure, length and tone of the example review, and end the overall review with \"加油～\".";

const EXAMPLE_SOURCE: &str = "保護者からよく「この教室に通わせたらどのような大人になるのか」と聞かれました。\
答えようがありませんでした。遺伝、家庭環境、友達及びどんな担任にあったかなどです。\
授業中、小さな子をいじめるなど問題行為を起こす子供がいました。";

const EXAMPLE_TRANSLATION: &str = "学生家长经常问我\"在这个班学，我家孩子会变成怎样的大人呢？\"\
我并不想回复。比方说遗传、家庭环境、友情以及工作等因素。\
在我的课上，有个孩子霸凌年纪比较小的孩子。";

fn gemini(config: &Config, key: &str) -> Result<Arc<dyn Generator>> {
    let generator = GeminiGenerator::new(
        key,
        config.gemini_base_url.clone(),
        config.gemini_model.clone(),
        config.generation_timeout,
    )
    .context("Failed to build Gemini client")?;
    Ok(Arc::new(generator))
}

pub fn generator_from_config(config: &Config) -> Result<Arc<dyn Generator>> {
    match (config.backend_mode, config.gemini_api_key.as_deref()) {
        (BackendMode::Real, Some(key)) => {
            info!(model = %config.gemini_model, "Using Gemini generator");
            gemini(config, key)
        }
        (BackendMode::Real, None) => {
            warn!("BACKEND_MODE=real but GEMINI_API_KEY is not set; using mock generator");
            Ok(Arc::new(MockGenerator::new()))
        }
        (BackendMode::Mock, _) => {
            info!("Using mock generator");
            Ok(Arc::new(MockGenerator::new()))
        }
    }
}

/// Generators a request may pick by name through its `engine` field. The
/// mock is always available; Gemini only when an API key is configured.
pub fn engines_from_config(config: &Config) -> Result<Vec<Arc<dyn Generator>>> {
    let mut engines: Vec<Arc<dyn Generator>> = vec![Arc::new(MockGenerator::new())];
    if let Some(key) = config.gemini_api_key.as_deref() {
        engines.push(gemini(config, key)?);
    }
    Ok(engines)
}

pub struct SuggestionService {
    generator: Arc<dyn Generator>,
    engines: Vec<Arc<dyn Generator>>,
    memory: Arc<ConversationMemory>,
    count: usize,
}

impl SuggestionService {
    pub fn new(generator: Arc<dyn Generator>, memory: Arc<ConversationMemory>, count: usize) -> Self {
        Self {
            generator,
            engines: Vec::new(),
            memory,
            count,
        }
    }

    /// Registers an engine selectable per request. The first engine with a
    /// given name wins.
    pub fn with_engine(mut self, engine: Arc<dyn Generator>) -> Self {
        if !self.engines.iter().any(|e| e.name() == engine.name()) {
            self.engines.push(engine);
        }
        self
    }

    fn select(&self, engine: Option<&str>) -> &Arc<dyn Generator> {
        let Some(name) = engine.map(str::trim).filter(|name| !name.is_empty()) else {
            return &self.generator;
        };
        if self.generator.name().eq_ignore_ascii_case(name) {
            return &self.generator;
        }
        match self
            .engines
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
        {
            Some(generator) => generator,
            None => {
                warn!(
                    engine = name,
                    default = self.generator.name(),
                    "Requested engine is unavailable; using default"
                );
                &self.generator
            }
        }
    }

    pub fn memory(&self) -> &ConversationMemory {
        &self.memory
    }

    pub async fn generate(&self, request: SuggestionRequest) -> SuggestionResponse {
        let conversation_id = request
            .conversation_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let previous = self.memory.recent(&conversation_id).await;
        let prompt = build_prompt(&request, &previous);
        let generator = self.select(request.engine.as_deref());

        let text = match generator.generate(&prompt).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    conversation_id = %conversation_id,
                    generator = generator.name(),
                    error = %err,
                    "Generation failed"
                );
                String::new()
            }
        };

        let normalized = normalize(&text, self.count);
        if normalized.is_empty() {
            warn!(conversation_id = %conversation_id, "No suggestions found in generated text");
        }
        let suggestions = fit_to_count(normalized.suggestions, self.count);

        self.memory
            .record(
                &conversation_id,
                format_turn(&request, &normalized.overall_comment),
            )
            .await;

        SuggestionResponse {
            suggestions,
            overall_comment: normalized.overall_comment,
            conversation_id,
        }
    }
}

pub fn build_prompt(request: &SuggestionRequest, previous: &[String]) -> String {
    let mut prompt = String::from(INSTRUCTIONS);

    prompt.push_str("\n\n## Example\n### Source text\n");
    prompt.push_str(EXAMPLE_SOURCE);
    prompt.push_str("\n### Translation to review\n");
    prompt.push_str(EXAMPLE_TRANSLATION);
    prompt.push_str("\n### Review\n");
    prompt.push_str(MOCK_REPLY);

    if !previous.is_empty() {
        prompt.push_str("\n\n## Earlier turns in this conversation\n");
        for turn in previous {
            prompt.push_str(turn);
            prompt.push('\n');
        }
    }

    if let Some(instruction) = request
        .instruction_prompt
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
    {
        prompt.push_str("\n## Additional instructions\n");
        prompt.push_str(instruction);
        prompt.push('\n');
    }

    prompt.push_str("\n## Source text\n");
    prompt.push_str(&request.original_text);
    prompt.push_str("\n\n## Translation to review\n");
    prompt.push_str(&request.target_text);
    prompt.push_str("\n\n## Review\n");
    prompt
}

fn format_turn(request: &SuggestionRequest, overall_comment: &str) -> String {
    format!(
        "Source: {}\nTranslation: {}\nReview: {}",
        request.original_text, request.target_text, overall_comment
    )
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::generation::GenerationError;
    use crate::models::Suggestion;

    struct UnavailableGenerator;

    #[async_trait]
    impl Generator for UnavailableGenerator {
        fn name(&self) -> &'static str {
            "unavailable"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            Err(GenerationError::MalformedResponse("no candidates".into()))
        }
    }

    fn request(conversation_id: Option<&str>) -> SuggestionRequest {
        SuggestionRequest {
            original_text: "答えようがありませんでした。".into(),
            target_text: "我并不想回复。".into(),
            instruction_prompt: Some("Be brief".into()),
            conversation_id: conversation_id.map(str::to_string),
            engine: None,
        }
    }

    struct CannedGenerator(&'static str);

    #[async_trait]
    impl Generator for CannedGenerator {
        fn name(&self) -> &'static str {
            "gemini"
        }

        async fn generate(&self, _prompt: &str) -> Result<String, GenerationError> {
            Ok(self.0.to_string())
        }
    }

    fn service(generator: Arc<dyn Generator>) -> SuggestionService {
        SuggestionService::new(generator, Arc::new(ConversationMemory::new(5, 16)), 5)
    }

    #[tokio::test]
    async fn mock_generation_yields_fixed_count() {
        let service = service(Arc::new(MockGenerator::new()));
        let response = service.generate(request(Some("c1"))).await;
        assert_eq!(response.conversation_id, "c1");
        assert_eq!(response.suggestions.len(), 5);
        assert_eq!(response.suggestions[0].original, "我并不想回复");
        assert_eq!(response.suggestions[4], Suggestion::placeholder(5));
        assert!(!response.overall_comment.is_empty());
    }

    #[tokio::test]
    async fn failed_generation_still_returns_placeholders() {
        let service = service(Arc::new(UnavailableGenerator));
        let response = service.generate(request(None)).await;
        assert!(Uuid::parse_str(&response.conversation_id).is_ok());
        assert_eq!(response.suggestions, fit_to_count(Vec::new(), 5));
        assert_eq!(response.overall_comment, "");
    }

    #[tokio::test]
    async fn turns_are_remembered_per_conversation() {
        let service = service(Arc::new(MockGenerator::new()));
        service.generate(request(Some("c1"))).await;
        service.generate(request(Some("c1"))).await;

        let turns = service.memory().recent("c1").await;
        assert_eq!(turns.len(), 2);
        assert!(turns[0].contains("我并不想回复"));
        assert!(service.memory().recent("c2").await.is_empty());
    }

    #[tokio::test]
    async fn engine_field_selects_generator() {
        let service = service(Arc::new(MockGenerator::new())).with_engine(Arc::new(
            CannedGenerator(r#"{"suggestions": [{"original": "canned", "reason": "r"}]}"#),
        ));

        let mut req = request(Some("c1"));
        req.engine = Some("gemini".into());
        let response = service.generate(req).await;
        assert_eq!(response.suggestions[0].original, "canned");
        assert_eq!(response.suggestions[1], Suggestion::placeholder(2));

        let response = service.generate(request(Some("c1"))).await;
        assert_eq!(response.suggestions[0].original, "我并不想回复");
    }

    #[tokio::test]
    async fn unknown_engine_uses_default_generator() {
        let service = service(Arc::new(MockGenerator::new()));
        let mut req = request(None);
        req.engine = Some("gemini".into());
        let response = service.generate(req).await;
        assert_eq!(response.suggestions[0].original, "我并不想回复");
    }

    #[test]
    fn engines_from_config_adds_gemini_only_with_key() {
        let config = Config::default();
        let names = engines_from_config(&config)
            .unwrap()
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>();
        assert_eq!(names, ["mock"]);

        let config = Config {
            gemini_api_key: Some("test-key".into()),
            ..Config::default()
        };
        let names = engines_from_config(&config)
            .unwrap()
            .iter()
            .map(|e| e.name())
            .collect::<Vec<_>>();
        assert_eq!(names, ["mock", "gemini"]);
    }

    #[test]
    fn prompt_includes_worked_example() {
        let prompt = build_prompt(&request(None), &[]);
        let example = prompt.find("## Example").unwrap();
        let source = prompt.find("\n## Source text\n").unwrap();
        assert!(example < source);
        assert!(prompt[example..source].contains(MOCK_REPLY));
        assert!(prompt.contains("加油～"));
    }

    #[test]
    fn prompt_carries_texts_instruction_and_history() {
        let prompt = build_prompt(&request(None), &["Source: a\nTranslation: b".to_string()]);
        assert!(prompt.starts_with(INSTRUCTIONS));
        assert!(prompt.contains("## Earlier turns"));
        assert!(prompt.contains("Be brief"));
        assert!(prompt.contains("答えようがありませんでした。"));
        assert!(prompt.ends_with("## Review\n"));
    }

    #[test]
    fn prompt_skips_empty_sections() {
        let mut req = request(None);
        req.instruction_prompt = Some("   ".into());
        let prompt = build_prompt(&req, &[]);
        assert!(!prompt.contains("## Earlier turns"));
        assert!(!prompt.contains("## Additional instructions"));
    }
}
