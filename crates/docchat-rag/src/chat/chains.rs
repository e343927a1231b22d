use anyhow::{Context, Result};
use futures::{StreamExt, TryStreamExt};
use std::sync::Arc;

use super::prompts::{ChatTemplate, CONTEXT_VAR, INPUT_VAR, QUESTION_VAR, SUMMARIES_VAR};
use crate::config::CombineStrategy;
use crate::llm::{GenerationConfig, LLMProvider, PromptMessage, TokenSink};
use crate::types::{ChatMessage, ChatRole, SearchHit};

/// Direct conversational chain: system, rolling history, the new input.
#[derive(Clone)]
pub struct ConversationChain {
    llm: Arc<dyn LLMProvider>,
}

impl ConversationChain {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self { llm }
    }

    /// Stored turns become prompt history; system and function records are
    /// not replayed.
    pub fn prepare(template: &ChatTemplate, history: &[ChatMessage], input: &str) -> Vec<PromptMessage> {
        let history: Vec<PromptMessage> = history
            .iter()
            .filter(|m| matches!(m.role, ChatRole::User | ChatRole::Assistant))
            .map(|m| PromptMessage::new(m.role, m.content.clone()))
            .collect();
        template.render(&[(INPUT_VAR, input)], &history)
    }

    pub async fn run(
        &self,
        messages: &[PromptMessage],
        config: &GenerationConfig,
        sink: &mut dyn TokenSink,
    ) -> Result<String> {
        self.llm.stream_chat(messages, config, sink).await
    }
}

/// Folds retrieved chunks into one answer.
#[derive(Clone)]
pub struct CombineDocumentsChain {
    llm: Arc<dyn LLMProvider>,
    strategy: CombineStrategy,
    map_template: ChatTemplate,
    map_concurrency: usize,
}

impl CombineDocumentsChain {
    pub fn new(
        llm: Arc<dyn LLMProvider>,
        strategy: CombineStrategy,
        map_template: ChatTemplate,
        map_concurrency: usize,
    ) -> Self {
        Self {
            llm,
            strategy,
            map_template,
            map_concurrency: map_concurrency.max(1),
        }
    }

    /// Map step (map-reduce only): one extraction call per chunk, results in
    /// retrieval order. Nothing retrieved means nothing to map.
    async fn summaries(
        &self,
        hits: &[SearchHit],
        question: &str,
        config: &GenerationConfig,
    ) -> Result<String> {
        if hits.is_empty() {
            return Ok(String::new());
        }

        let parts: Vec<String> = match self.strategy {
            CombineStrategy::Stuff => hits.iter().map(|h| h.page_content.clone()).collect(),
            CombineStrategy::MapReduce => {
                let extracts: Vec<String> = futures::stream::iter(hits.iter().enumerate())
                    .map(|(i, hit)| async move {
                        let messages = self.map_template.render(
                            &[(CONTEXT_VAR, hit.page_content.as_str()), (QUESTION_VAR, question)],
                            &[],
                        );
                        self.llm
                            .complete(&messages, config)
                            .await
                            .with_context(|| format!("Map step failed for chunk {}", i))
                    })
                    .buffered(self.map_concurrency)
                    .boxed()
                    .try_collect()
                    .await?;
                tracing::debug!(chunks = hits.len(), "Map step complete");
                extracts
                    .into_iter()
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .collect()
            }
        };

        Ok(parts.join("\n\n"))
    }

    /// Only the final combine call is streamed into `sink`.
    pub async fn run(
        &self,
        combine_template: &ChatTemplate,
        hits: &[SearchHit],
        question: &str,
        config: &GenerationConfig,
        sink: &mut dyn TokenSink,
    ) -> Result<String> {
        let summaries = self.summaries(hits, question, config).await?;
        let messages = combine_template.render(
            &[(SUMMARIES_VAR, summaries.as_str()), (QUESTION_VAR, question)],
            &[],
        );
        self.llm.stream_chat(&messages, config, sink).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::prompts::PromptAssembler;
    use crate::config::PromptConfig;
    use crate::llm::DiscardSink;
    use crate::testing::ScriptedProvider;
    use chrono::NaiveDate;

    fn hit(text: &str) -> SearchHit {
        SearchHit {
            id: text.into(),
            user_id: "u".into(),
            thread_id: "t".into(),
            page_content: text.into(),
            file_name: "f.txt".into(),
            score: 0.5,
        }
    }

    fn config() -> GenerationConfig {
        GenerationConfig {
            model: "gpt-4o".into(),
            temperature: 0.5,
            max_tokens: None,
        }
    }

    fn assembler() -> PromptAssembler {
        PromptAssembler::new(&PromptConfig::default())
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    #[test]
    fn test_prepare_replays_history_in_order() {
        let template = assembler().conversation_template("gpt-4o", today());
        let history = vec![
            ChatMessage::new("t", "u", ChatRole::User, "q1"),
            ChatMessage::new("t", "u", ChatRole::Assistant, "a1"),
            ChatMessage::new("t", "u", ChatRole::Function, "ignored"),
        ];
        let messages = ConversationChain::prepare(&template, &history, "q2");
        let contents: Vec<&str> = messages.iter().skip(1).map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["q1", "a1", "q2"]);
    }

    #[tokio::test]
    async fn test_map_reduce_maps_every_chunk_then_combines() {
        let llm = Arc::new(ScriptedProvider::new(vec!["combined answer"]));
        let chain = CombineDocumentsChain::new(
            llm.clone(),
            CombineStrategy::MapReduce,
            assembler().map_template(),
            2,
        );
        let template = assembler().combine_template("gpt-4o", today());

        let answer = chain
            .run(&template, &[hit("alpha"), hit("beta"), hit("gamma")], "which?", &config(), &mut DiscardSink)
            .await
            .unwrap();
        assert_eq!(answer, "combined answer");

        let calls = llm.calls();
        assert_eq!(calls.len(), 4);
        for call in &calls[..3] {
            assert!(call[0].content.contains("Return any relevant text verbatim."));
            assert_eq!(call[1].content, "which?");
        }
        // Map extracts echo their chunk; the combine prompt carries all of them
        let combine_system = &calls[3][0].content;
        assert!(combine_system.contains("alpha") && combine_system.contains("gamma"));
    }

    #[tokio::test]
    async fn test_empty_retrieval_skips_map_but_still_answers() {
        let llm = Arc::new(ScriptedProvider::new(vec!["The document may be empty."]));
        let chain = CombineDocumentsChain::new(llm.clone(), CombineStrategy::MapReduce, assembler().map_template(), 4);
        let template = assembler().combine_template("gpt-4o", today());

        let answer = chain
            .run(&template, &[], "summarize", &config(), &mut DiscardSink)
            .await
            .unwrap();
        assert_eq!(answer, "The document may be empty.");
        let calls = llm.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0][0].content.trim_end().ends_with("document contents:"));
    }

    #[tokio::test]
    async fn test_stuff_puts_chunks_in_prompt() {
        let llm = Arc::new(ScriptedProvider::new(vec!["ok"]));
        let chain = CombineDocumentsChain::new(llm.clone(), CombineStrategy::Stuff, assembler().map_template(), 4);
        let template = assembler().combine_template("gpt-4o", today());

        chain
            .run(&template, &[hit("foo"), hit("bar")], "q", &config(), &mut DiscardSink)
            .await
            .unwrap();
        let calls = llm.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0][0].content.ends_with("document contents: foo\n\nbar\n"));
    }
}
