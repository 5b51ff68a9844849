use std::fmt::Write;

use crate::model::RetrievedDocument;

/// Render retrieved documents and the question into one prompt.
///
/// With no documents the query is returned unchanged.
pub fn build_prompt(query: &str, docs: &[RetrievedDocument]) -> String {
    if docs.is_empty() {
        return query.to_string();
    }

    let mut context = String::new();
    for (i, doc) in docs.iter().enumerate() {
        let _ = write!(context, "[Document {}]: {}\n\n", i + 1, doc.content);
    }

    format!(
        "Answer the user's question using only the reference documents below. \
If the documents do not contain the relevant information, say explicitly that it could not be found.\n\
\n\
Reference documents:\n\
{}\n\
User question: {}\n\
\n\
Please provide an accurate and complete answer:",
        context, query
    )
}
