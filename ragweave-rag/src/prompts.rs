//! Prompt templates for every LLM call the pipeline makes.
//!
//! Placeholders are `{name}`; fill them with [`render`].

/// Answer synthesis over retrieved context.
pub const TEXT_QA_PROMPT: &str = r#"Context information is below.
---------------------
{context_str}
---------------------
Given the context information and not prior knowledge, answer the query.
Query: {query_str}
Answer: "#;

/// Query reformulation for fusion retrieval.
pub const QUERY_GEN_PROMPT: &str = r#"You are a helpful assistant that generates multiple search queries based on a single input query. Generate {num_queries} search queries, one on each line, related to the following input query:
Query: {query_str}
Queries:
"#;

/// Hypothetical document generation.
pub const HYDE_PROMPT: &str = r#"Please write a passage to answer the question.
Try to include as many key details as possible.


{query_str}


Passage: "#;

/// Multi-step decomposition. The model answers `None` once nothing is left to ask.
pub const STEP_DECOMPOSE_PROMPT: &str = r#"The original question is as follows: {query_str}
We have an opportunity to answer some, or all of the question from a knowledge source. Context information for the knowledge source is provided below, as well as previous reasoning steps.
Given the context and previous reasoning, return a question that can be answered from the context. This question can be the same as the original question, or it can represent a subcomponent of the overall question. It should not be irrelevant to the original question.
If we cannot extract more information from the context, provide 'None' as the answer.

Question: {query_str}
Knowledge source context: {context_str}
Previous reasoning: {prev_reasoning}
New question: "#;

/// LLM reranking over a numbered batch of documents.
pub const CHOICE_SELECT_PROMPT: &str = r#"A list of documents is shown below. Each document has a number next to it along with a summary of the document. A question is also provided.
Respond with the numbers of the documents you should consult to answer the question, in order of relevance, as well as the relevance score. The relevance score is a number from 1-10 based on how relevant you think the document is to the question.
Do not include any documents that are not relevant to the question.
Example format:
Document 1:
<summary of document 1>

Document 2:
<summary of document 2>

...

Document 10:
<summary of document 10>

Question: <question>
Answer:
Doc: 9, Relevance: 7
Doc: 3, Relevance: 4
Doc: 7, Relevance: 3

Let's try this now:

{context_str}
Question: {query_str}
Answer:
"#;

/// Test-set question generation. `{style}` is one of the evolution instructions below.
pub const TESTSET_QUESTION_PROMPT: &str = r#"You are building an evaluation set for a question answering system.
Read the context and write one question it answers, together with the ground-truth answer.
{style}
Respond with JSON only, in the form {"question": "...", "ground_truth": "..."}.

Context:
{context_str}
"#;

pub const SIMPLE_STYLE: &str = "The question should ask for a single fact stated in the context.";
pub const REASONING_STYLE: &str =
    "The question should require reasoning over several statements in the context to answer.";
pub const MULTI_CONTEXT_STYLE: &str =
    "The context is made of several passages; the question should need information from more than one of them.";

/// Test-set critic. Scores a generated question for usefulness.
pub const TESTSET_CRITIC_PROMPT: &str = r#"Rate the following question for an evaluation set on clarity, answerability from the context, and specificity.
Respond with JSON only, in the form {"score": <number from 1 to 10>, "reason": "..."}.

Context:
{context_str}

Question: {question}
"#;

/// Substitute `{key}` placeholders.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_placeholders() {
        let prompt = render(TEXT_QA_PROMPT, &[("context_str", "ctx"), ("query_str", "q?")]);
        assert!(prompt.contains("ctx\n---"));
        assert!(prompt.contains("Query: q?"));
        assert!(!prompt.contains("{query_str}"));
    }

    #[test]
    fn test_render_leaves_json_braces() {
        let prompt = render(TESTSET_QUESTION_PROMPT, &[("style", SIMPLE_STYLE), ("context_str", "c")]);
        assert!(prompt.contains(r#"{"question": "...", "ground_truth": "..."}"#));
        assert!(prompt.contains(SIMPLE_STYLE));
    }
}
