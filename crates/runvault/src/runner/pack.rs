//! Packing OCR markdown into the model request.

/// OCR output of one document, in upload order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentMarkdown {
    pub doc_id: String,
    pub markdown: String,
}

/// Wrap every document in `<DOC_START id="..">`/`<DOC_END>` markers.
pub fn pack_documents(documents: &[DocumentMarkdown]) -> String {
    let mut lines = Vec::with_capacity(documents.len() * 3 + 2);
    lines.push("<BEGIN_DOCUMENTS>".to_string());
    for doc in documents {
        lines.push(format!("<DOC_START id=\"{}\">", doc.doc_id));
        lines.push(doc.markdown.clone());
        lines.push("<DOC_END>".to_string());
    }
    lines.push("<END_DOCUMENTS>".to_string());
    lines.join("\n")
}

/// Body of `llm/request.txt`.
pub fn request_text(system_prompt: &str, user_content: &str) -> String {
    format!(
        "<SYSTEM_PROMPT>\n{}\n</SYSTEM_PROMPT>\n\n<USER_CONTENT>\n{}\n</USER_CONTENT>\n",
        system_prompt, user_content
    )
}
