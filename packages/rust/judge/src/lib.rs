//! Relevance judge: the LLM call behind the filter, finder and file-finder stages.
//!
//! Stages talk to a [`Judge`]. A judge always answers free text via
//! [`Judge::invoke`]; judges that can constrain their output to a JSON schema
//! also implement [`Judge::invoke_structured`]. Callers try the structured
//! path first and fall back to text plus [`JudgeSchema::format_instructions`].

mod chat;
mod extract;

use async_trait::async_trait;

use archivist_shared::{ArchivistError, Result};

pub use chat::ChatJudge;
pub use extract::extract_json;

/// A named JSON schema the judge's answer must conform to.
#[derive(Debug, Clone)]
pub struct JudgeSchema {
    /// Short identifier (sent as the schema name to APIs that want one).
    pub name: &'static str,
    /// JSON Schema document.
    pub schema: serde_json::Value,
}

impl JudgeSchema {
    pub fn new(name: &'static str, schema: serde_json::Value) -> Self {
        Self { name, schema }
    }

    /// Instruction block appended to prompts on the plain-text fallback path.
    pub fn format_instructions(&self) -> String {
        let schema = serde_json::to_string(&self.schema).unwrap_or_default();
        format!(
            "The output should be formatted as a JSON instance that conforms to the JSON schema below.\n\
             \n\
             Here is the output schema:\n\
             ```\n{schema}\n```\n\
             Return only the JSON, no other text."
        )
    }
}

/// Black-box relevance judge.
#[async_trait]
pub trait Judge: Send + Sync {
    /// Send `prompt` and return the raw text answer.
    async fn invoke(&self, prompt: &str) -> Result<String>;

    /// Send `prompt` and return an answer constrained to `schema`.
    ///
    /// The default reports the mode as unsupported so callers fall back to
    /// [`Judge::invoke`].
    async fn invoke_structured(
        &self,
        prompt: &str,
        schema: &JudgeSchema,
    ) -> Result<serde_json::Value> {
        let _ = prompt;
        Err(ArchivistError::Judge(format!(
            "structured output ({}) is not supported by this judge",
            schema.name
        )))
    }
}
