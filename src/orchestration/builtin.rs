//! Built-in research and writeup tools.
//!
//! These are deterministic stand-ins for external services so a run works
//! end to end out of the box. Outputs depend only on inputs.

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use crate::orchestration::tools::{Tool, ToolRegistry};
use crate::{Error, Result};

/// Registry holding every built-in tool.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(SearchPapers);
    registry.register(GenerateIdeas);
    registry.register(RefineIdeas);
    registry.register(RunExperiment);
    registry.register(CollectResults);
    registry.register(CompileWriteup);
    registry.register(Reviewer);
    registry
}

fn object<'a>(tool: &str, input: &'a Value) -> Result<&'a Map<String, Value>> {
    input
        .as_object()
        .ok_or_else(|| Error::permanent(tool, "input must be a JSON object"))
}

fn text_field(input: &Map<String, Value>, key: &str) -> Option<String> {
    match input.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn count_field(input: &Map<String, Value>, key: &str, default: u64) -> u64 {
    input.get(key).and_then(Value::as_u64).unwrap_or(default)
}

pub struct SearchPapers;

#[async_trait]
impl Tool for SearchPapers {
    fn name(&self) -> &str {
        "search_papers"
    }

    fn description(&self) -> &str {
        "Search for research papers on a query"
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let input = object(self.name(), &input)?;
        let query = text_field(input, "query")
            .or_else(|| text_field(input, "topic"))
            .ok_or_else(|| Error::permanent(self.name(), "missing 'query'"))?;
        let max = count_field(input, "max_results", 10).min(3);
        tracing::debug!(%query, max, "search_papers");

        let papers: Vec<Value> = (0..max)
            .map(|i| {
                json!({
                    "title": format!("Research Paper on {} #{}", query, i + 1),
                    "abstract": format!("This paper explores {} from a novel perspective.", query),
                    "url": format!("https://arxiv.org/abs/mock{}", i),
                })
            })
            .collect();
        Ok(json!({"count": papers.len(), "papers": papers}))
    }
}

pub struct GenerateIdeas;

#[async_trait]
impl Tool for GenerateIdeas {
    fn name(&self) -> &str {
        "generate_ideas"
    }

    fn description(&self) -> &str {
        "Generate research ideas for a topic"
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let input = object(self.name(), &input)?;
        let topic = text_field(input, "topic")
            .ok_or_else(|| Error::permanent(self.name(), "missing 'topic'"))?;
        let n = count_field(input, "num_ideas", 5) as usize;

        let ideas: Vec<String> = [
            format!("Explore {} using machine learning approaches", topic),
            format!("Investigate the impact of {} on system performance", topic),
            format!("Develop a novel framework for {}", topic),
            format!("Compare different methods for handling {}", topic),
            format!("Apply {} to solve real-world problems", topic),
        ]
        .into_iter()
        .take(n)
        .collect();
        Ok(json!({"ideas": ideas}))
    }
}

pub struct RefineIdeas;

#[async_trait]
impl Tool for RefineIdeas {
    fn name(&self) -> &str {
        "refine_ideas"
    }

    fn description(&self) -> &str {
        "Score and refine a list of ideas"
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let input = object(self.name(), &input)?;
        let ideas = input
            .get("ideas")
            .and_then(Value::as_array)
            .ok_or_else(|| Error::permanent(self.name(), "'ideas' must be a list"))?;

        let refined: Vec<Value> = ideas
            .iter()
            .map(|idea| {
                let text = idea.as_str().map(str::to_string).unwrap_or_else(|| idea.to_string());
                json!({
                    "idea": text,
                    "novelty_score": 0.8,
                    "feasibility_score": 0.7,
                    "impact_score": 0.9,
                    "refined_description": format!("Enhanced: {}", text),
                })
            })
            .collect();
        Ok(json!({"refined_ideas": refined}))
    }
}

pub struct RunExperiment;

#[async_trait]
impl Tool for RunExperiment {
    fn name(&self) -> &str {
        "run_experiment"
    }

    fn description(&self) -> &str {
        "Run a named experiment with parameters"
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let input = object(self.name(), &input)?;
        let name = text_field(input, "experiment_name")
            .ok_or_else(|| Error::permanent(self.name(), "missing 'experiment_name'"))?;
        let parameters = input.get("parameters").cloned().unwrap_or_else(|| json!({}));
        Ok(json!({
            "success": true,
            "results": {
                "experiment": name,
                "accuracy": 0.92,
                "loss": 0.15,
                "parameters": parameters,
            }
        }))
    }
}

pub struct CollectResults;

#[async_trait]
impl Tool for CollectResults {
    fn name(&self) -> &str {
        "collect_results"
    }

    fn description(&self) -> &str {
        "Aggregate results of finished experiments"
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let input = object(self.name(), &input)?;
        let ids: Vec<String> = input
            .get("experiment_ids")
            .and_then(Value::as_array)
            .map(|ids| {
                ids.iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        let results: Vec<Value> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                json!({
                    "experiment_id": id,
                    "status": "completed",
                    "accuracy": 0.90 + (i as f64) * 0.01,
                })
            })
            .collect();
        let summary = format!("Collected {} experiment results", results.len());
        Ok(json!({"results": results, "summary": summary}))
    }
}

pub struct CompileWriteup;

#[async_trait]
impl Tool for CompileWriteup {
    fn name(&self) -> &str {
        "compile_writeup"
    }

    fn description(&self) -> &str {
        "Compile a markdown document from sections"
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let input = object(self.name(), &input)?;
        let title = text_field(input, "title").unwrap_or_else(|| "Untitled".to_string());

        let mut document = format!("# {}\n", title);
        if let Some(sections) = input.get("sections").and_then(Value::as_object) {
            for (name, content) in sections {
                let body = content
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| content.to_string());
                document.push_str(&format!("\n## {}\n\n{}\n", name, body));
            }
        }
        Ok(json!({"chars": document.len(), "document": document}))
    }
}

pub struct Reviewer;

#[async_trait]
impl Tool for Reviewer {
    fn name(&self) -> &str {
        "reviewer"
    }

    fn description(&self) -> &str {
        "Review content for quality"
    }

    async fn invoke(&self, input: Value) -> Result<Value> {
        let input = object(self.name(), &input)?;
        let content = text_field(input, "content").unwrap_or_default();
        let review_type = text_field(input, "review_type").unwrap_or_else(|| "general".to_string());
        if content.is_empty() {
            return Err(Error::permanent(self.name(), "nothing to review"));
        }
        Ok(json!({
            "feedback": format!("{} review: {} characters, well organized", review_type, content.chars().count()),
            "score": 0.85,
            "suggestions": [
                "Add more specific examples",
                "Clarify technical terms",
                "Include references to related work",
            ],
        }))
    }
}
