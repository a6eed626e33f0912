//! The `research_query` prompt template.

/// Report format used when the caller does not name one.
pub const DEFAULT_REPORT_FORMAT: &str = "research_report";

/// Build a prompt instructing an agent how to research `topic` toward `goal`
/// with this server's tools and resources.
///
/// A blank `report_format` falls back to [`DEFAULT_REPORT_FORMAT`].
pub fn research_query(topic: &str, goal: &str, report_format: Option<&str>) -> String {
    let report_format = report_format
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .unwrap_or(DEFAULT_REPORT_FORMAT);

    format!(
        "Please research the following topic: {topic}\n\
         \n\
         Goal: {goal}\n\
         \n\
         You have the following tools available:\n\
         1. deep_research: runs thorough web research and returns a research_id\n\
         2. quick_search: returns search results with snippets, without a full research pass\n\
         3. write_report: writes a report from the evidence gathered under a research_id\n\
         4. get_research_sources: lists the sources gathered under a research_id\n\
         5. get_research_context: returns the full evidence text gathered under a research_id\n\
         \n\
         You can also read cached research directly through the resource `research://{topic}`.\n\
         \n\
         Start with deep_research on the topic. Once it completes, call write_report \
         with the returned research_id to produce a report in the `{report_format}` format. \
         Ground every claim in the gathered sources and cite them."
    )
}
