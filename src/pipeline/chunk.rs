//! Greedy token-bounded chunking of OCR text (text pipeline).
//!
//! The text pipeline OCRs the whole book first and then asks the model to
//! reformat it a block at a time. Blocks are built greedily and line by line:
//! a line is never split, and a block is closed as soon as the next line would
//! push it past the budget. A single line longer than the budget therefore
//! ends up alone in an over-budget block; OCR lines are short enough that this
//! never matters in practice.
//!
//! Blocks carry no context from one another. A chapter heading at the end of
//! one block is invisible to the next.

use crate::error::ScanbookError;
use serde::Serialize;
use tiktoken_rs::tokenizer::{get_tokenizer, Tokenizer};
use tiktoken_rs::{get_bpe_from_tokenizer, CoreBPE};

/// Counts model tokens in a piece of text.
pub trait TokenCounter: Send + Sync {
    fn count(&self, text: &str) -> usize;
}

/// Byte-pair counts from the model's own tiktoken vocabulary.
///
/// OpenAI model ids map to their encoding (`o200k_base` for the 4o / o-series
/// family, `cl100k_base` for GPT-4 and 3.5). Other vendors publish no BPE
/// tables, so their counts use `o200k_base`.
pub struct BpeTokenCounter {
    bpe: CoreBPE,
    encoding: &'static str,
}

impl BpeTokenCounter {
    pub fn for_model(model: &str) -> Result<Self, ScanbookError> {
        let tokenizer = get_tokenizer(model).unwrap_or(Tokenizer::O200kBase);
        let bpe = get_bpe_from_tokenizer(tokenizer).map_err(|e| ScanbookError::TokenizerUnavailable {
            model: model.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            bpe,
            encoding: encoding_name(tokenizer),
        })
    }

    /// Name of the BPE encoding in use.
    pub fn encoding(&self) -> &'static str {
        self.encoding
    }
}

impl TokenCounter for BpeTokenCounter {
    fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

impl std::fmt::Debug for BpeTokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BpeTokenCounter")
            .field("encoding", &self.encoding)
            .finish()
    }
}

fn encoding_name(tokenizer: Tokenizer) -> &'static str {
    match tokenizer {
        Tokenizer::O200kBase => "o200k_base",
        Tokenizer::Cl100kBase => "cl100k_base",
        Tokenizer::P50kBase => "p50k_base",
        Tokenizer::P50kEdit => "p50k_edit",
        Tokenizer::R50kBase => "r50k_base",
        Tokenizer::Gpt2 => "gpt2",
    }
}

/// A run of consecutive OCR lines submitted together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TextBlock {
    pub lines: Vec<String>,
    /// Sum of the token counts of `lines`.
    pub tokens: usize,
}

impl TextBlock {
    /// The block's text: its lines concatenated as-is.
    pub fn text(&self) -> String {
        self.lines.concat()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.iter().all(|l| l.is_empty())
    }
}

/// Split text into lines, each keeping its trailing newline, so that
/// concatenating them restores the input exactly.
pub fn split_lines(text: &str) -> Vec<String> {
    text.split_inclusive('\n').map(str::to_string).collect()
}

/// Partition `lines` into blocks of at most `budget` tokens.
///
/// Returns no blocks for empty input; otherwise every block holds at least
/// one line.
pub fn chunk_lines<I>(lines: I, budget: usize, counter: &dyn TokenCounter) -> Vec<TextBlock>
where
    I: IntoIterator,
    I::Item: Into<String>,
{
    let mut blocks = Vec::new();
    let mut current = TextBlock::default();

    for line in lines {
        let line: String = line.into();
        let tokens = counter.count(&line);
        if !current.lines.is_empty() && current.tokens + tokens > budget {
            blocks.push(std::mem::take(&mut current));
        }
        current.tokens += tokens;
        current.lines.push(line);
    }

    if !current.lines.is_empty() {
        blocks.push(current);
    }
    blocks
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One token per whitespace-separated word; easy to reason about.
    struct WordCounter;

    impl TokenCounter for WordCounter {
        fn count(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    fn words(n: usize) -> String {
        let mut s = vec!["w"; n].join(" ");
        s.push('\n');
        s
    }

    #[test]
    fn empty_input_yields_no_blocks() {
        let blocks = chunk_lines(Vec::<String>::new(), 10, &WordCounter);
        assert!(blocks.is_empty());
    }

    #[test]
    fn blocks_respect_budget() {
        let lines: Vec<String> = [3, 4, 2, 5, 1, 1, 6, 3].iter().map(|&n| words(n)).collect();
        let blocks = chunk_lines(lines.clone(), 8, &WordCounter);

        for block in &blocks {
            assert!(block.tokens <= 8, "block over budget: {block:?}");
            assert_eq!(
                block.tokens,
                block.lines.iter().map(|l| WordCounter.count(l)).sum::<usize>()
            );
        }
        // 3+4 | 2+5+1 | 1+6 | 3
        let sizes: Vec<usize> = blocks.iter().map(|b| b.tokens).collect();
        assert_eq!(sizes, vec![7, 8, 7, 3]);
    }

    #[test]
    fn concatenated_blocks_reconstruct_input() {
        let text = "CHAPTER ONE\n\nIt was the best of times,\nit was the worst of times,\n\
                    it was the age of wisdom,\n12\nit was the age of foolishness\n";
        let lines = split_lines(text);
        let blocks = chunk_lines(lines.clone(), 7, &WordCounter);

        let rebuilt: Vec<String> = blocks.iter().flat_map(|b| b.lines.clone()).collect();
        assert_eq!(rebuilt, lines);
        let joined: String = blocks.iter().map(TextBlock::text).collect();
        assert_eq!(joined, text);
    }

    #[test]
    fn oversized_line_stands_alone() {
        let lines = vec![words(2), words(50), words(2)];
        let blocks = chunk_lines(lines, 10, &WordCounter);
        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[1].tokens, 50);
        assert_eq!(blocks[1].lines.len(), 1);
    }

    #[test]
    fn oversized_first_line_does_not_emit_an_empty_block() {
        let blocks = chunk_lines(vec![words(20)], 10, &WordCounter);
        assert_eq!(blocks.len(), 1);
        assert!(!blocks[0].lines.is_empty());
    }

    #[test]
    fn split_lines_keeps_unterminated_last_line() {
        assert_eq!(split_lines("a\nb"), vec!["a\n", "b"]);
        assert!(split_lines("").is_empty());
    }

    #[test]
    fn encoding_follows_the_model() {
        assert_eq!(BpeTokenCounter::for_model("gpt-4o").unwrap().encoding(), "o200k_base");
        assert_eq!(BpeTokenCounter::for_model("gpt-4").unwrap().encoding(), "cl100k_base");
        assert_eq!(
            BpeTokenCounter::for_model("claude-sonnet-4").unwrap().encoding(),
            "o200k_base"
        );
    }

    #[test]
    fn digits_cost_more_than_a_quarter_token_per_char() {
        let counter = BpeTokenCounter::for_model("gpt-4").unwrap();
        let row = "| 1914 | 3,271,406 | 12.5% | p. 118, 119, 204-7 |\n";
        assert!(
            counter.count(row) > row.len() / 4 + 4,
            "{} tokens for {} chars",
            counter.count(row),
            row.len()
        );
    }

    #[test]
    fn tables_and_greek_stay_within_the_budget() {
        let counter = BpeTokenCounter::for_model("gpt-4o").unwrap();
        let mut text = String::new();
        for year in 1900..1960 {
            text.push_str(&format!("| {year} | {},{:03} | {}.{}% |\n", year % 97, year % 1000, year % 13, year % 10));
            text.push_str("Η Ελλάδα είναι χώρα της νοτιοανατολικής Ευρώπης.\n");
        }
        let lines = split_lines(&text);
        let budget = 60;
        let blocks = chunk_lines(lines.clone(), budget, &counter);

        assert!(blocks.len() > 1);
        for block in &blocks {
            assert!(block.tokens <= budget, "{} tokens in {:?}", block.tokens, block.lines);
            let summed: usize = block.lines.iter().map(|l| counter.count(l)).sum();
            assert_eq!(block.tokens, summed);
        }
        let rebuilt: Vec<String> = blocks.into_iter().flat_map(|b| b.lines).collect();
        assert_eq!(rebuilt, lines);
    }
}
