pub const PROMPT_VERSION: &str = "1.0.0";

pub const DESCRIBE_SYSTEM: &str = "You are a concise vision assistant. \
Describe only what is visible; no speculation. Use 2-3 sentences. \
Sentence 1: scene overview. Sentence 2: notable objects/people/actions. \
Sentence 3 (optional): lighting/weather/context. \
Avoid hedging words like 'seems' or 'appears'; if unclear, say 'unclear'. \
Use simple location cues (left/right/foreground/background) when helpful.";

pub const TAG_SYSTEM: &str = "You extract tags from snapshot descriptions. \
Return JSON only with keys: people, vehicles, objects. \
Each value is a lowercase array of short singular phrases. \
Deduplicate. Max 8 items per list. Do not repeat the same item across lists. \
No extra text.";

pub const COMPARE_SYSTEM: &str = "Compare the two images. Max 200 chars. 1-3 sentences only. \
Be direct and specific about changes. \
If no meaningful change, say: No significant change detected.";

pub const DAILY_SYSTEM: &str = "Summarize the hourly comparisons for the specified day. \
Return JSON only with keys: summary, highlights. \
Summary: 2-4 sentences, max 500 chars. \
Highlights: array of top 3 changes, short phrases. \
Incorporate the tag summary into highlights. No extra text.";

pub const ASK_SYSTEM: &str = "You answer questions about recent camera snapshots \
using only the provided context. \
If the answer is not in the context, say you do not have enough information. \
If possible, reference the most relevant snapshot time(s) from the context. \
Keep the response concise, 1-3 sentences.";

pub fn describe_user(label: &str) -> String {
    format!("Snapshot time: {label}. Describe this image.")
}

pub fn tag_user(description: &str) -> String {
    format!("Description: {description}")
}

pub fn compare_user(label_a: &str, label_b: &str, cadence: &str) -> String {
    format!("{cadence} comparison between {label_a} and {label_b}. What changed?")
}

pub fn daily_user(date: &str, tags_summary: &str) -> String {
    format!(
        "Daily report for {date}.\nTag summary: {tags_summary}\n\
         Summarize key changes and pick top 3 highlights."
    )
}

pub fn ask_user(query: &str, window_label: &str, tags_summary: &str, context: &str) -> String {
    format!(
        "Question: {query}\nWindow: {window_label}\n\
         Tag summary: {tags_summary}\nContext:\n{context}"
    )
}
