//! Prompt sources.
//!
//! The runner asks for prompt `i` when dispatching request `i` and falls back
//! to a random prompt once the index runs past the source.

use anyhow::{Context, Result, bail};
use log::{debug, warn};
use rand::Rng;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::InputConfig;
use crate::tokenizer::Tokenizer;

pub trait PromptSource: Send + Sync {
    fn content_by_index(&self, index: usize) -> Option<String>;

    fn random_content(&self) -> String;

    fn count(&self) -> usize;

    /// Prompt for request `index`.
    fn prompt_at(&self, index: usize) -> String {
        self.content_by_index(index)
            .unwrap_or_else(|| self.random_content())
    }
}

fn pick_random(prompts: &[String]) -> String {
    if prompts.is_empty() {
        return String::new();
    }
    let index = rand::thread_rng().gen_range(0..prompts.len());
    prompts[index].clone()
}

/// One line of a `.jsonl` prompt file.
#[derive(Debug, Deserialize)]
struct PromptLine {
    prompt: String,
}

/// Prompts known up front: literal text, a file or a set of files.
#[derive(Debug, Clone)]
pub struct StaticPrompts {
    prompts: Vec<String>,
}

impl StaticPrompts {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self {
            prompts: vec![text.into()],
        }
    }

    /// A `.jsonl` file holds one `{"prompt": ...}` object per line; any other
    /// file is a single prompt.
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read prompt file {}", path.display()))?;

        let is_jsonl = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("jsonl"));
        let prompts = if is_jsonl {
            parse_jsonl(&contents)
        } else {
            vec![contents]
        };

        if prompts.iter().all(|p| p.trim().is_empty()) {
            bail!("no prompts found in {}", path.display());
        }
        debug!("Loaded {} prompts from {}", prompts.len(), path.display());
        Ok(Self { prompts })
    }

    /// Every file matching `pattern` becomes one prompt, in path order.
    pub fn from_glob(pattern: &str) -> Result<Self> {
        let paths = glob_files(pattern)?;
        if paths.is_empty() {
            bail!("no files match {}", pattern);
        }

        let mut prompts = Vec::with_capacity(paths.len());
        for path in &paths {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read prompt file {}", path.display()))?;
            prompts.push(contents);
        }
        debug!("Loaded {} prompts matching {}", prompts.len(), pattern);
        Ok(Self { prompts })
    }
}

impl PromptSource for StaticPrompts {
    fn content_by_index(&self, index: usize) -> Option<String> {
        self.prompts.get(index).cloned()
    }

    fn random_content(&self) -> String {
        pick_random(&self.prompts)
    }

    fn count(&self) -> usize {
        self.prompts.len()
    }
}

fn parse_jsonl(contents: &str) -> Vec<String> {
    let mut prompts = Vec::new();
    for (number, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<PromptLine>(line) {
            Ok(parsed) => prompts.push(parsed.prompt),
            Err(e) => warn!("Skipping prompt line {}: {}", number + 1, e),
        }
    }
    prompts
}

/// Files matching a pattern whose wildcards (`*`, `?`) appear only in the
/// final path component.
fn glob_files(pattern: &str) -> Result<Vec<PathBuf>> {
    let path = Path::new(pattern);
    let file_pattern = path
        .file_name()
        .and_then(|name| name.to_str())
        .with_context(|| format!("invalid glob pattern {}", pattern))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    if dir.to_string_lossy().contains(['*', '?']) {
        bail!("wildcards are only supported in the file name: {}", pattern);
    }

    let mut matches = Vec::new();
    let entries =
        std::fs::read_dir(&dir).with_context(|| format!("failed to list {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str()
            && wildcard_match(file_pattern, name)
        {
            matches.push(entry.path());
        }
    }
    matches.sort();
    Ok(matches)
}

/// Match `name` against a pattern where `*` is any run and `?` any one char.
pub fn wildcard_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    let (mut p, mut n) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            p += 1;
            resume = n;
        } else if let Some(star) = star {
            p = star + 1;
            resume += 1;
            n = resume;
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}

const FILLER: &str = "The history of computing is a story of abstraction layered on \
abstraction. Early machines were programmed by rewiring panels, then by punching \
cards, then by writing assembly for a specific processor. Compilers let programmers \
describe what they wanted instead of how the hardware should do it, and operating \
systems hid the details of disks, memory and devices behind files and processes. \
Networks connected those systems, and protocols layered on protocols turned a tangle \
of cables into a single global fabric. Each step traded some control for leverage, \
and each new layer became the foundation for the next. ";

/// Filler prompts of a fixed token length.
#[derive(Debug, Clone)]
pub struct GeneratedPrompts {
    prompts: Vec<String>,
    tokens: usize,
}

impl GeneratedPrompts {
    /// `count` distinct prompts of at most `tokens` tokens each. Each begins
    /// with its index so servers cannot answer from a prefix cache.
    pub fn new(tokenizer: &Tokenizer, tokens: usize, count: usize) -> Result<Self> {
        if tokens == 0 {
            bail!("generated prompt length must be greater than 0");
        }
        let filler_tokens = tokenizer.count_tokens(FILLER).max(1);
        let repeats = tokens / filler_tokens + 2;
        let body = FILLER.repeat(repeats);

        let prompts = (0..count.max(1))
            .map(|i| tokenizer.truncate(&format!("[{}] {}", i, body), tokens))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { prompts, tokens })
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }
}

impl PromptSource for GeneratedPrompts {
    fn content_by_index(&self, index: usize) -> Option<String> {
        self.prompts.get(index).cloned()
    }

    fn random_content(&self) -> String {
        pick_random(&self.prompts)
    }

    fn count(&self) -> usize {
        self.prompts.len()
    }
}

/// Build the prompt source selected by the `[input]` section.
pub fn from_config(input: &InputConfig, tokenizer: &Tokenizer) -> Result<Arc<dyn PromptSource>> {
    if let Some(text) = &input.text {
        return Ok(Arc::new(StaticPrompts::from_text(text.clone())));
    }
    if let Some(file) = &input.file {
        return Ok(Arc::new(StaticPrompts::from_file(file)?));
    }
    if let Some(pattern) = &input.glob {
        return Ok(Arc::new(StaticPrompts::from_glob(pattern)?));
    }
    if let Some(tokens) = input.generate_tokens {
        return Ok(Arc::new(GeneratedPrompts::new(
            tokenizer,
            tokens,
            input.generate_count,
        )?));
    }
    bail!("no prompt input configured")
}
