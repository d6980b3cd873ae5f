//! Prompt templates for the judge-backed stages.

use archivist_judge::JudgeSchema;
use archivist_shared::ArchiveFile;

/// Prompt asking the judge to prune raw search hits.
pub fn filter_prompt(query: &str, results: &[String]) -> String {
    let results = serde_json::to_string(results).unwrap_or_default();
    format!(
        "You are a helpful assistant that filters Internet Archive search results.
The user is looking for: {query}

Here are the search results (item identifiers):
{results}

Please filter these results to only include relevant items, but do not be too aggressive.
Metadata is loaded later and the results are verified again.
Return your answer as JSON with a single field \"filtered_results\" holding the list of item identifiers.
Example: {{\"filtered_results\": [\"item1\", \"item2\", \"item3\"]}}
"
    )
}

/// Prompt asking whether one item matches the query, given its attributes.
pub fn finder_prompt(
    query: &str,
    identifier: &str,
    attributes: &serde_json::Map<String, serde_json::Value>,
) -> String {
    let attributes = serde_json::to_string(attributes).unwrap_or_default();
    format!(
        "You are a precise assistant that evaluates Internet Archive entries for relevance.

Task:
- Determine whether the following entry matches the user's query.

User query:
{query}

Entry to evaluate (identifier):
{identifier}

Entry metadata (JSON):
{attributes}

Criteria (examples, not exhaustive):
- Title or identifier contains the search terms or clear synonyms.
- Language and description are appropriate.
- Media type and format are plausible for the query (e.g. a manual).
- Year and time context appear relevant.

Focus on semantic similarity, not just substring matches. If uncertain, it is not relevant.
Answer with JSON: {{\"is_this_entry_relevant\": true}} or {{\"is_this_entry_relevant\": false}}
"
    )
}

/// Prompt asking which PDF files of one item to download.
pub fn file_finder_prompt(query: &str, identifier: &str, files: &[ArchiveFile]) -> String {
    let files = serde_json::to_string(files).unwrap_or_default();
    format!(
        "You are a careful assistant that selects the most relevant PDF files for the user's query from a single Internet Archive item.

User query:
{query}

Item identifier:
{identifier}

All available files for this item (JSON array):
{files}

Instructions:
- Return only files that are actual PDFs (\"PDF\", \"Text PDF\", \"Image Container PDF\", \"Searchable PDF\").
- Prefer searchable PDFs. If there is both an OCR/searchable PDF and a raw image PDF, list the searchable one first.
- Prefer files with source \"original\" over \"derivative\" when both are equivalent.
- Exclude non-PDF files (ePub, DjVu, HTML, JP2, TXT, XML, ...).
- Keep the selection minimal. If no PDF is relevant, return an empty list.

Return only JSON with a single field \"pdfs_to_download\" holding a list of file names.
Example: {{\"pdfs_to_download\": [\"Example Item.pdf\"]}}
"
    )
}

/// Append schema instructions for judges without structured output.
pub fn with_format_instructions(prompt: &str, schema: &JudgeSchema) -> String {
    format!("{prompt}\n{}", schema.format_instructions())
}
