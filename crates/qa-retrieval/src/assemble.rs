use qa_core::{AssembledContext, RetrievedChunk};
use std::collections::HashSet;
use tracing::debug;

/// 上下文组装器：按分数降序挑选分块，按来源去重，受字符预算约束。
/// 纯函数式实现，相同输入必得相同输出。
#[derive(Debug, Clone)]
pub struct ContextAssembler {
    pub budget_chars: usize,
    pub allow_multiple_chunks_per_source: bool,
}

impl ContextAssembler {
    pub fn new(budget_chars: usize, allow_multiple_chunks_per_source: bool) -> Self {
        Self {
            budget_chars,
            allow_multiple_chunks_per_source,
        }
    }

    pub fn assemble(&self, chunks: &[RetrievedChunk]) -> AssembledContext {
        let mut sorted: Vec<RetrievedChunk> = chunks.to_vec();
        sorted.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.source_id.cmp(&b.source_id))
                .then_with(|| a.rank.cmp(&b.rank))
        });

        let mut included = Vec::new();
        let mut seen_sources: HashSet<String> = HashSet::new();
        let mut total_length = 0usize;

        for chunk in sorted {
            // 每个来源只保留最高分分块，除非显式放开
            if !self.allow_multiple_chunks_per_source && seen_sources.contains(&chunk.source_id) {
                continue;
            }
            if total_length + chunk.text.len() > self.budget_chars {
                // 预算耗尽即停止
                break;
            }
            total_length += chunk.text.len();
            seen_sources.insert(chunk.source_id.clone());
            included.push(chunk);
        }

        // 重新编号
        for (rank, chunk) in included.iter_mut().enumerate() {
            chunk.rank = rank;
        }

        let source_count = seen_sources.len();
        debug!(
            included = included.len(),
            total_length, source_count, "上下文组装完成"
        );

        AssembledContext {
            chunks: included,
            total_length,
            source_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(source: &str, text: &str, score: f32, rank: usize) -> RetrievedChunk {
        RetrievedChunk {
            source_id: source.to_string(),
            document_title: format!("doc-{}", source),
            text: text.to_string(),
            score,
            rank,
        }
    }

    #[test]
    fn test_budget_never_exceeded() {
        let assembler = ContextAssembler::new(25, false);
        let chunks = vec![
            chunk("s1", "aaaaaaaaaa", 0.9, 0), // 10 chars
            chunk("s2", "bbbbbbbbbb", 0.8, 1), // 10 chars
            chunk("s3", "cccccccccc", 0.7, 2), // 10 chars - 超预算
        ];
        let ctx = assembler.assemble(&chunks);
        assert!(ctx.total_length <= 25);
        assert_eq!(ctx.chunks.len(), 2);
        assert_eq!(ctx.source_count, 2);
    }

    #[test]
    fn test_dedup_by_source_keeps_best() {
        let assembler = ContextAssembler::new(1000, false);
        let chunks = vec![
            chunk("s1", "best chunk", 0.9, 0),
            chunk("s1", "worse chunk from same source", 0.5, 1),
            chunk("s2", "other source", 0.4, 2),
        ];
        let ctx = assembler.assemble(&chunks);
        assert_eq!(ctx.chunks.len(), 2);
        assert_eq!(ctx.chunks[0].text, "best chunk");
        let sources: Vec<&str> = ctx.chunks.iter().map(|c| c.source_id.as_str()).collect();
        assert_eq!(sources, vec!["s1", "s2"]);
    }

    #[test]
    fn test_multi_chunk_per_source_override() {
        let assembler = ContextAssembler::new(1000, true);
        let chunks = vec![
            chunk("s1", "first", 0.9, 0),
            chunk("s1", "second", 0.5, 1),
        ];
        let ctx = assembler.assemble(&chunks);
        assert_eq!(ctx.chunks.len(), 2);
        assert_eq!(ctx.source_count, 1);
    }

    #[test]
    fn test_deterministic_and_ranks_reassigned() {
        let assembler = ContextAssembler::new(1000, false);
        let chunks = vec![
            chunk("s2", "two", 0.8, 5),
            chunk("s1", "one", 0.9, 3),
        ];
        let a = assembler.assemble(&chunks);
        let b = assembler.assemble(&chunks);
        assert_eq!(a.chunks.len(), b.chunks.len());
        assert_eq!(a.chunks[0].rank, 0);
        assert_eq!(a.chunks[1].rank, 1);
        assert_eq!(a.chunks[0].source_id, "s1");
    }

    #[test]
    fn test_empty_input_gives_empty_context() {
        let assembler = ContextAssembler::new(1000, false);
        let ctx = assembler.assemble(&[]);
        assert_eq!(ctx.source_count, 0);
        assert_eq!(ctx.total_length, 0);
        assert!(ctx.chunks.is_empty());
    }
}
